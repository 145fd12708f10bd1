//! Operation timeout enforcement
//!
//! [`Timeout`] races the wrapped operation against a deadline. When the
//! deadline wins, the in-flight attempt is dropped, which cancels it at its
//! next suspension point: it stops consuming resources but is never killed
//! mid-instruction. Exactly one outcome is observed per call.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AppError;
use crate::operation::Operation;

/// Operation wrapper that bounds each call to a fixed duration
#[derive(Debug, Clone)]
pub struct Timeout<O> {
    inner: O,
    duration: Duration,
}

impl<O> Timeout<O> {
    /// Bound every call of `inner` to `duration`
    pub fn new(inner: O, duration: Duration) -> Self {
        Self { inner, duration }
    }

    /// The configured limit
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Remaining time before a deadline that started at `started_at`
    ///
    /// Returns `None` once the limit has passed.
    pub fn remaining_time(&self, started_at: Instant) -> Option<Duration> {
        self.duration.checked_sub(started_at.elapsed())
    }
}

#[async_trait]
impl<O> Operation for Timeout<O>
where
    O: Operation,
    O::Error: From<AppError>,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        match tokio::time::timeout(self.duration, self.inner.call()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                debug!(limit_ms = self.duration.as_millis() as u64, "operation timed out");
                Err(AppError::timeout(self.duration).into())
            }
        }
    }
}
