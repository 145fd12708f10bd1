//! Operation abstraction
//!
//! An [`Operation`] is a deferred, re-invocable computation that yields a
//! `Result` each time it is called. Combinators take an operation and return
//! a new one, so policies stack in whatever order the caller writes them:
//!
//! ```ignore
//! use resilient::prelude::*;
//!
//! let op = op_fn(|| async { fetch_post(1).await })
//!     .with_retry(RetryPolicy::exponential())
//!     .with_timeout(Duration::from_secs(2))
//!     .with_fallback_value(Post::placeholder());
//!
//! let post = op.call().await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppError;
use crate::reliability::{Fallback, Retry, RetryPolicy, Timeout};

/// A re-invocable asynchronous computation
///
/// Implementations must not carry state between calls; retry relies on
/// calling the same operation again and getting a fresh attempt.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Success value
    type Output: Send;

    /// Failure value
    type Error: Send;

    /// Run the operation once
    async fn call(&self) -> Result<Self::Output, Self::Error>;
}

#[async_trait]
impl<'a, O> Operation for &'a O
where
    O: Operation + ?Sized,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        (**self).call().await
    }
}

#[async_trait]
impl<O> Operation for Arc<O>
where
    O: Operation + ?Sized,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        (**self).call().await
    }
}

#[async_trait]
impl<O> Operation for Box<O>
where
    O: Operation + ?Sized,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        (**self).call().await
    }
}

/// Type-erased operation
pub type BoxOperation<T, E = AppError> = Box<dyn Operation<Output = T, Error = E>>;

/// Operation backed by a closure that builds a fresh future per call
#[derive(Clone)]
pub struct FnOperation<F> {
    f: F,
}

/// Wrap a closure returning a future as an [`Operation`]
pub fn op_fn<F, Fut, T, E>(f: F) -> FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    FnOperation { f }
}

#[async_trait]
impl<F, Fut, T, E> Operation for FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;

    async fn call(&self) -> Result<T, E> {
        (self.f)().await
    }
}

/// Operation that always succeeds with a clone of the same value
#[derive(Debug, Clone)]
pub struct Succeed<T, E> {
    value: T,
    _error: PhantomData<fn() -> E>,
}

/// An operation that always yields `Ok(value)`
pub fn succeed<T, E>(value: T) -> Succeed<T, E>
where
    T: Clone + Send + Sync,
{
    Succeed {
        value,
        _error: PhantomData,
    }
}

#[async_trait]
impl<T, E> Operation for Succeed<T, E>
where
    T: Clone + Send + Sync,
    E: Send,
{
    type Output = T;
    type Error = E;

    async fn call(&self) -> Result<T, E> {
        Ok(self.value.clone())
    }
}

/// Operation that always fails with a clone of the same error
#[derive(Debug, Clone)]
pub struct Fail<T, E> {
    error: E,
    _output: PhantomData<fn() -> T>,
}

/// An operation that always yields `Err(error)`
pub fn fail<T, E>(error: E) -> Fail<T, E>
where
    E: Clone + Send + Sync,
{
    Fail {
        error,
        _output: PhantomData,
    }
}

#[async_trait]
impl<T, E> Operation for Fail<T, E>
where
    T: Send,
    E: Clone + Send + Sync,
{
    type Output = T;
    type Error = E;

    async fn call(&self) -> Result<T, E> {
        Err(self.error.clone())
    }
}

/// Combinator methods available on every [`Operation`]
pub trait OperationExt: Operation + Sized {
    /// Retry failures according to `policy`
    fn with_retry(self, policy: RetryPolicy) -> Retry<Self> {
        Retry::new(self, policy)
    }

    /// Bound every call to `duration`
    fn with_timeout(self, duration: Duration) -> Timeout<Self> {
        Timeout::new(self, duration)
    }

    /// Run `fallback` whenever this operation fails
    fn with_fallback<F>(self, fallback: F) -> Fallback<Self, F>
    where
        F: Operation<Output = Self::Output, Error = Self::Error>,
    {
        Fallback::new(self, fallback)
    }

    /// Yield `value` whenever this operation fails
    fn with_fallback_value(self, value: Self::Output) -> Fallback<Self, Succeed<Self::Output, Self::Error>>
    where
        Self::Output: Clone + Sync,
    {
        Fallback::new(self, succeed(value))
    }

    /// Erase the concrete type
    fn boxed(self) -> BoxOperation<Self::Output, Self::Error>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<O: Operation> OperationExt for O {}
