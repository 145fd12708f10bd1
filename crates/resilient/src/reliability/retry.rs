//! Retry policy implementation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::duration_millis;
use crate::error::{Classify, ErrorKind};
use crate::operation::Operation;

/// Configuration for operation retries
///
/// Delays grow as `base_delay * 2^retry`, capped at `max_delay`. With jitter
/// enabled the capped delay is replaced by a uniform sample from
/// `[0, delay]` (full jitter) so that many clients failing together do not
/// retry in lockstep.
///
/// # Example
///
/// ```
/// use resilient::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(10));
///
/// // First retry after ~100ms
/// // Second retry after ~200ms
/// // Third retry after ~400ms
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of invocations (including the initial one)
    ///
    /// `0` and `1` both mean the operation runs exactly once.
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Replace each delay with a uniform sample from `[0, delay]`
    pub jitter: bool,

    /// Error kinds that are never retried
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<ErrorKind>,
}

fn default_non_retryable() -> Vec<ErrorKind> {
    ErrorKind::ALL
        .into_iter()
        .filter(|kind| !kind.is_retryable())
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 3 max attempts
    /// - 100ms base delay
    /// - 30 second max delay
    /// - full jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
            non_retryable: default_non_retryable(),
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            non_retryable: default_non_retryable(),
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: interval,
            max_delay: interval,
            jitter: false,
            non_retryable: default_non_retryable(),
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable full jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Never retry errors of this kind
    pub fn with_non_retryable_kind(mut self, kind: ErrorKind) -> Self {
        if !self.non_retryable.contains(&kind) {
            self.non_retryable.push(kind);
        }
        self
    }

    /// Allow retrying errors of this kind
    pub fn with_retryable_kind(mut self, kind: ErrorKind) -> Self {
        self.non_retryable.retain(|k| *k != kind);
        self
    }

    /// Un-jittered delay for a zero-based retry index
    pub fn capped_delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay to wait before retry number `retry` (zero-based)
    ///
    /// Retry 0 is the wait between the first and second invocation.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let capped = self.capped_delay(retry);
        if !self.jitter || capped.is_zero() {
            return capped;
        }

        let upper = u64::try_from(capped.as_nanos()).unwrap_or(u64::MAX);
        let sampled = rand::thread_rng().gen_range(0..=upper);
        Duration::from_nanos(sampled)
    }

    /// Check if errors of this kind may be retried
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        !self.non_retryable.contains(&kind)
    }

    /// Check if there are remaining attempts after `attempts_made` invocations
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Decides whether a failed attempt should be retried
///
/// `attempt` is the number of invocations made so far, including the one
/// that just failed. Predicates compose with [`RetryPredicate::and`].
pub trait RetryPredicate<E>: Send + Sync {
    /// Whether another attempt should follow
    fn should_retry(&self, attempt: u32, error: &E) -> bool;

    /// Both predicates must agree
    fn and<Q>(self, other: Q) -> And<Self, Q>
    where
        Self: Sized,
        Q: RetryPredicate<E>,
    {
        And(self, other)
    }
}

impl<E: Classify> RetryPredicate<E> for RetryPolicy {
    fn should_retry(&self, attempt: u32, error: &E) -> bool {
        self.has_attempts_remaining(attempt) && self.is_retryable(error.kind())
    }
}

impl<E, F> RetryPredicate<E> for F
where
    F: Fn(u32, &E) -> bool + Send + Sync,
{
    fn should_retry(&self, attempt: u32, error: &E) -> bool {
        self(attempt, error)
    }
}

/// Attempt cap that ignores the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAttempts(pub u32);

impl<E> RetryPredicate<E> for MaxAttempts {
    fn should_retry(&self, attempt: u32, _error: &E) -> bool {
        attempt < self.0
    }
}

/// Logical AND of two predicates
#[derive(Debug, Clone, Copy)]
pub struct And<A, B>(pub A, pub B);

impl<E, A, B> RetryPredicate<E> for And<A, B>
where
    A: RetryPredicate<E>,
    B: RetryPredicate<E>,
{
    fn should_retry(&self, attempt: u32, error: &E) -> bool {
        self.0.should_retry(attempt, error) && self.1.should_retry(attempt, error)
    }
}

/// Where a retry loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Not started
    Idle,
    /// An attempt is executing
    Running,
    /// Backing off before the next attempt
    Waiting(Duration),
    /// Terminal: an attempt succeeded
    Succeeded,
    /// Terminal: the last attempt failed and no retry follows
    Failed,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Waiting(delay) => write!(f, "waiting({delay:?})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State of one in-flight retry loop
///
/// Created fresh for every call, so `attempt` starts at zero per run and
/// only ever grows within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Invocations made so far
    pub attempt: u32,
    /// Delay before the next invocation (zero until the first failure)
    pub next_delay: Duration,
    /// Current phase
    pub phase: AttemptPhase,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt: 0,
            next_delay: Duration::ZERO,
            phase: AttemptPhase::Idle,
        }
    }

    fn transition(&mut self, phase: AttemptPhase) {
        debug!(attempt = self.attempt, from = %self.phase, to = %phase, "retry state transition");
        self.phase = phase;
    }
}

type RetryObserver<E> = Arc<dyn Fn(&RetryState, &E) + Send + Sync>;

/// Operation wrapper that re-invokes its inner operation on failure
///
/// Attempts are strictly sequential: attempt N+1 starts only after attempt N
/// has failed and its backoff delay has elapsed. Dropping the future cancels
/// a pending backoff wait immediately.
pub struct Retry<O: Operation, P = RetryPolicy> {
    inner: O,
    policy: RetryPolicy,
    predicate: P,
    observer: Option<RetryObserver<O::Error>>,
}

impl<O: Operation> Retry<O> {
    /// Retry `inner` according to `policy`
    pub fn new(inner: O, policy: RetryPolicy) -> Self {
        Self {
            inner,
            predicate: policy.clone(),
            policy,
            observer: None,
        }
    }
}

impl<O: Operation, P> Retry<O, P> {
    /// Additionally require `predicate` to agree before retrying
    pub fn retry_if<Q>(self, predicate: Q) -> Retry<O, And<P, Q>>
    where
        Q: RetryPredicate<O::Error>,
    {
        Retry {
            inner: self.inner,
            policy: self.policy,
            predicate: And(self.predicate, predicate),
            observer: self.observer,
        }
    }

    /// Observe every failure that is about to be retried
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryState, &O::Error) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The backoff policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<O, P> Operation for Retry<O, P>
where
    O: Operation,
    P: RetryPredicate<O::Error>,
{
    type Output = O::Output;
    type Error = O::Error;

    async fn call(&self) -> Result<Self::Output, Self::Error> {
        let mut state = RetryState::new();

        loop {
            state.transition(AttemptPhase::Running);
            let result = self.inner.call().await;
            state.attempt += 1;

            let error = match result {
                Ok(value) => {
                    state.transition(AttemptPhase::Succeeded);
                    if state.attempt > 1 {
                        debug!(attempts = state.attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.predicate.should_retry(state.attempt, &error) {
                state.transition(AttemptPhase::Failed);
                if state.attempt > 1 {
                    warn!(attempts = state.attempt, "retries exhausted");
                }
                return Err(error);
            }

            state.next_delay = self.policy.delay_for(state.attempt - 1);
            if let Some(observer) = &self.observer {
                observer(&state, &error);
            }
            state.transition(AttemptPhase::Waiting(state.next_delay));
            tokio::time::sleep(state.next_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::operation::op_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn failing_then_ok(
        failures: u32,
        error: AppError,
    ) -> (Arc<AtomicU32>, impl Operation<Output = u32, Error = AppError>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = op_fn(move || {
            let counter = counter.clone();
            let error = error.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(error)
                } else {
                    Ok(n)
                }
            }
        });
        (calls, op)
    }

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert!(policy.jitter);
        assert_eq!(
            policy.non_retryable,
            vec![ErrorKind::Decode, ErrorKind::NotFound, ErrorKind::Validation]
        );
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(7), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for() {
        let policy = RetryPolicy::exponential().with_jitter(false);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        // Exponent overflow falls back to the cap instead of panicking
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(300));

        for retry in 0..8 {
            let upper = Duration::from_millis(50 * 2u64.pow(retry)).min(Duration::from_millis(300));
            for _ in 0..200 {
                let delay = policy.delay_for(retry);
                assert!(delay <= upper, "retry {retry}: {delay:?} > {upper:?}");
            }
        }
    }

    #[test]
    fn test_non_retryable_kinds() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);

        assert!(!RetryPredicate::should_retry(&policy, 1, &AppError::validation("x")));
        assert!(!RetryPredicate::should_retry(&policy, 1, &AppError::not_found("post", 1)));
        assert!(!RetryPredicate::should_retry(&policy, 1, &AppError::decode("x")));
        assert!(RetryPredicate::should_retry(&policy, 1, &AppError::transport("x")));
        assert!(RetryPredicate::should_retry(&policy, 1, &AppError::service("x")));

        let policy = policy.with_retryable_kind(ErrorKind::NotFound);
        assert!(RetryPredicate::should_retry(&policy, 1, &AppError::not_found("post", 1)));

        let policy = policy.with_non_retryable_kind(ErrorKind::Service);
        assert!(!RetryPredicate::should_retry(&policy, 1, &AppError::service("x")));
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_and_composition() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);
        let combined = RetryPredicate::<AppError>::and(policy, MaxAttempts(2));
        let err = AppError::transport("x");

        assert!(combined.should_retry(1, &err));
        assert!(!combined.should_retry(2, &err));

        let only_service = |_attempt: u32, e: &AppError| e.kind() == ErrorKind::Service;
        let combined = MaxAttempts(5).and(only_service);
        assert!(!combined.should_retry(1, &err));
        assert!(combined.should_retry(1, &AppError::service("x")));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_kind(ErrorKind::Service);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }

    #[test]
    fn test_deserialize_defaults_non_retryable() {
        let parsed: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "base_delay": 10, "max_delay": 1000, "jitter": false}"#,
        )
        .unwrap();

        assert_eq!(parsed.base_delay, Duration::from_millis(10));
        assert_eq!(parsed.non_retryable, RetryPolicy::exponential().non_retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_invoked_exactly_max_attempts() {
        for max_attempts in 1..=5 {
            let (calls, op) = failing_then_ok(u32::MAX, AppError::transport("down"));
            let retry = Retry::new(op, RetryPolicy::exponential().with_max_attempts(max_attempts));

            assert!(retry.call().await.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_runs_once() {
        let (calls, op) = failing_then_ok(u32::MAX, AppError::transport("down"));
        let retry = Retry::new(op, RetryPolicy::exponential().with_max_attempts(0));

        assert_eq!(retry.call().await, Err(AppError::transport("down")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let (calls, op) = failing_then_ok(u32::MAX, AppError::not_found("post", 999));
        let retry = Retry::new(op, RetryPolicy::exponential().with_max_attempts(5));

        assert_eq!(retry.call().await, Err(AppError::not_found("post", 999)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timing_two_failures_then_success() {
        let (calls, op) = failing_then_ok(2, AppError::transport("refused"));
        let policy = RetryPolicy::exponential()
            .with_base_delay(Duration::from_millis(100))
            .with_max_attempts(3)
            .with_jitter(false);
        let retry = Retry::new(op, policy);

        let started = tokio::time::Instant::now();
        assert_eq!(retry.call().await, Ok(3));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(310), "{elapsed:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_counter_resets_per_call() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (_calls, op) = failing_then_ok(u32::MAX, AppError::service("boom"));
        let retry = Retry::new(op, RetryPolicy::fixed(Duration::from_millis(10), 3)).on_retry({
            let seen = seen.clone();
            move |state, _err| seen.lock().unwrap().push(state.attempt)
        });

        let _ = retry.call().await;
        let _ = retry.call().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_restricts_retries() {
        let (calls, op) = failing_then_ok(u32::MAX, AppError::service("boom"));
        let retry = Retry::new(op, RetryPolicy::exponential().with_max_attempts(5))
            .retry_if(|attempt: u32, _e: &AppError| attempt < 2);

        assert!(retry.call().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_call_cancels_backoff_wait() {
        let (calls, op) = failing_then_ok(u32::MAX, AppError::transport("down"));
        let retry = Retry::new(op, RetryPolicy::fixed(Duration::from_secs(60), 3));

        let outcome = tokio::time::timeout(Duration::from_secs(1), retry.call()).await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
