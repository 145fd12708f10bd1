//! Fallback on failure

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::operation::Operation;

type ErrorObserver<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Operation wrapper that substitutes a fallback when the primary fails
///
/// The primary's error is discarded once the fallback runs; the fallback's
/// outcome (success or failure) becomes the result. Attach an observer with
/// [`Fallback::on_error`] to capture the discarded error. On success the
/// fallback is never evaluated.
pub struct Fallback<O: Operation, F> {
    primary: O,
    fallback: F,
    on_error: Option<ErrorObserver<O::Error>>,
}

impl<O: Operation, F> Fallback<O, F> {
    /// Run `fallback` whenever `primary` fails
    pub fn new(primary: O, fallback: F) -> Self {
        Self {
            primary,
            fallback,
            on_error: None,
        }
    }

    /// Observe the primary's error before it is discarded
    pub fn on_error<H>(mut self, observer: H) -> Self
    where
        H: Fn(&O::Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }
}

#[async_trait]
impl<O, F> Operation for Fallback<O, F>
where
    O: Operation,
    O::Error: fmt::Debug,
    F: Operation<Output = O::Output, Error = O::Error>,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        match self.primary.call().await {
            Ok(value) => Ok(value),
            Err(error) => {
                debug!(?error, "primary operation failed, evaluating fallback");
                if let Some(observer) = &self.on_error {
                    observer(&error);
                }
                drop(error);
                self.fallback.call().await
            }
        }
    }
}
