//! Composition root
//!
//! [`OperationRunner`] wires the configured policies around a single
//! operation:
//!
//! ```text
//! deadline( retry( attempt_timeout( op ) ) )
//! ```
//!
//! Every attempt gets its own `attempt_timeout` window, and a timed-out attempt
//! counts as a retriable failure. The `deadline` bounds the whole run,
//! including backoff waits. Either layer is skipped when unset. Batches go
//! through a [`BoundedConcurrencyRunner`] with the configured ceiling.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::concurrency::{BoundedConcurrencyRunner, JoinMode, JoinOutcome};
use crate::config::{ConfigError, RunnerConfig};
use crate::error::{AppError, Classify};
use crate::operation::Operation;
use crate::reliability::{Retry, RetryPolicy};

/// Policies applied to a single run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunPolicy {
    pub retry: RetryPolicy,
    pub attempt_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
}

impl RunPolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            attempt_timeout: None,
            deadline: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl From<&RunnerConfig> for RunPolicy {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            attempt_timeout: config.attempt_timeout,
            deadline: config.deadline,
        }
    }
}

/// Runs operations under a fixed set of policies
///
/// # Example
///
/// ```ignore
/// use resilient::prelude::*;
///
/// let runner = OperationRunner::from_config(&RunnerConfig::from_env()?)?;
/// let post = runner.run(client.json_operation::<Post>(HttpRequest::get(url))).await?;
/// ```
#[derive(Debug, Clone)]
pub struct OperationRunner {
    policy: RunPolicy,
    join_mode: JoinMode,
    batch: BoundedConcurrencyRunner,
}

impl Default for OperationRunner {
    fn default() -> Self {
        Self::new(RunPolicy::default())
    }
}

impl OperationRunner {
    /// Create a runner with the given policy and default batch settings
    pub fn new(policy: RunPolicy) -> Self {
        let defaults = RunnerConfig::default();
        Self {
            policy,
            join_mode: defaults.join_mode,
            batch: BoundedConcurrencyRunner::new(defaults.concurrency),
        }
    }

    /// Create a runner from validated configuration
    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            policy: RunPolicy::from(config),
            join_mode: config.join_mode,
            batch: BoundedConcurrencyRunner::new(config.concurrency),
        })
    }

    /// Create a runner from `RESILIENT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_config(&RunnerConfig::from_env()?)
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub fn join_mode(&self) -> JoinMode {
        self.join_mode
    }

    pub fn concurrency(&self) -> usize {
        self.batch.concurrency()
    }

    /// Run `op` under the runner's policy
    pub async fn run<O>(&self, op: O) -> Result<O::Output, O::Error>
    where
        O: Operation,
        O::Error: Classify + From<AppError>,
    {
        self.run_with(op, &self.policy).await
    }

    /// Run `op` under an explicit policy
    #[instrument(
        skip_all,
        fields(
            run_id = %Uuid::now_v7(),
            max_attempts = policy.retry.max_attempts,
            attempt_timeout_ms = policy.attempt_timeout.map(|d| d.as_millis() as u64),
            deadline_ms = policy.deadline.map(|d| d.as_millis() as u64),
        )
    )]
    pub async fn run_with<O>(&self, op: O, policy: &RunPolicy) -> Result<O::Output, O::Error>
    where
        O: Operation,
        O::Error: Classify + From<AppError>,
    {
        let attempt = AttemptWindow {
            op: &op,
            limit: policy.attempt_timeout,
        };
        let retry = Retry::new(attempt, policy.retry.clone());

        let started = tokio::time::Instant::now();
        let result = match policy.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, retry.call()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(AppError::timeout(deadline).into()),
            },
            None => retry.call().await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(elapsed_ms, "run succeeded"),
            Err(error) => warn!(elapsed_ms, kind = %error.kind(), "run failed"),
        }
        result
    }

    /// Run `op`, yielding `value` if every attempt fails
    pub async fn run_with_fallback<O>(&self, op: O, value: O::Output) -> O::Output
    where
        O: Operation,
        O::Error: Classify + From<AppError> + fmt::Debug,
    {
        match self.run(op).await {
            Ok(output) => output,
            Err(error) => {
                debug!(?error, "run failed, using fallback value");
                value
            }
        }
    }

    /// Run `op` until it finishes or `token` is cancelled
    ///
    /// Returns `None` on cancellation. A pending backoff wait stops at once,
    /// and anything the in-flight attempt holds is dropped.
    pub async fn run_until_cancelled<O>(
        &self,
        op: O,
        token: &CancellationToken,
    ) -> Option<Result<O::Output, O::Error>>
    where
        O: Operation,
        O::Error: Classify + From<AppError>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("run cancelled");
                None
            }
            result = self.run(op) => Some(result),
        }
    }

    /// Run every operation under the runner's policy with the configured ceiling and join mode
    pub async fn run_all<O>(&self, ops: Vec<O>) -> JoinOutcome<O::Output, O::Error>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: Classify + From<AppError> + 'static,
    {
        let guarded = ops.into_iter().map(|op| self.guarded(op)).collect();
        self.batch.run(guarded, self.join_mode).await
    }

    /// Run every operation under the runner's policy and collect all results
    pub async fn run_all_settled<O>(&self, ops: Vec<O>) -> Vec<Result<O::Output, O::Error>>
    where
        O: Operation + 'static,
        O::Output: 'static,
        O::Error: Classify + From<AppError> + 'static,
    {
        let guarded = ops.into_iter().map(|op| self.guarded(op)).collect();
        self.batch.run_all_settled(guarded).await
    }

    fn guarded<O: Operation>(&self, op: O) -> Guarded<O> {
        Guarded {
            runner: self.clone(),
            op,
        }
    }
}

/// One attempt, optionally bounded
struct AttemptWindow<'a, O> {
    op: &'a O,
    limit: Option<Duration>,
}

#[async_trait]
impl<'a, O> Operation for AttemptWindow<'a, O>
where
    O: Operation,
    O::Error: Classify + From<AppError>,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<O::Output, O::Error> {
        let result = match self.limit {
            Some(limit) => match tokio::time::timeout(limit, self.op.call()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(AppError::timeout(limit).into()),
            },
            None => self.op.call().await,
        };
        if let Err(error) = &result {
            debug!(kind = %error.kind(), "attempt failed");
        }
        result
    }
}

/// An operation carrying its runner into a batch task
struct Guarded<O> {
    runner: OperationRunner,
    op: O,
}

#[async_trait]
impl<O> Operation for Guarded<O>
where
    O: Operation,
    O::Error: Classify + From<AppError>,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<O::Output, O::Error> {
        self.runner.run(&self.op).await
    }
}
