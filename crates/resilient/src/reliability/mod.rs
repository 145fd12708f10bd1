//! Reliability combinators
//!
//! This module provides:
//! - [`RetryPolicy`] / [`Retry`] - bounded retry with exponential backoff and full jitter
//! - [`Timeout`] - deadline guard that cancels overrunning work
//! - [`Fallback`] - substitute a value or another operation on failure
//!
//! Each combinator takes an [`Operation`] and returns one, so composition
//! order is whatever the caller writes. `with_timeout(with_retry(op))`
//! bounds the whole retry loop; `with_retry(with_timeout(op))` gives every
//! attempt its own window.

mod fallback;
mod retry;
mod timeout;

use std::time::Duration;

use crate::operation::{succeed, Operation, Succeed};

pub use fallback::Fallback;
pub use retry::{And, AttemptPhase, MaxAttempts, Retry, RetryPolicy, RetryPredicate, RetryState};
pub use timeout::Timeout;

/// Retry `op` according to `policy`
pub fn with_retry<O: Operation>(op: O, policy: RetryPolicy) -> Retry<O> {
    Retry::new(op, policy)
}

/// Bound every call of `op` to `duration`
pub fn with_timeout<O: Operation>(op: O, duration: Duration) -> Timeout<O> {
    Timeout::new(op, duration)
}

/// Run `fallback` whenever `op` fails
pub fn with_fallback<O, F>(op: O, fallback: F) -> Fallback<O, F>
where
    O: Operation,
    F: Operation<Output = O::Output, Error = O::Error>,
{
    Fallback::new(op, fallback)
}

/// Yield `value` whenever `op` fails
pub fn with_fallback_value<O>(op: O, value: O::Output) -> Fallback<O, Succeed<O::Output, O::Error>>
where
    O: Operation,
    O::Output: Clone + Sync,
{
    Fallback::new(op, succeed(value))
}
