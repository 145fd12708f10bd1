// Runner configuration
//
// Configuration for OperationRunner, loaded from environment variables or built in code.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::concurrency::JoinMode;
use crate::reliability::RetryPolicy;

/// Errors from loading or validating a [`RunnerConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for an [`OperationRunner`](crate::runner::OperationRunner)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Retry policy applied to every run
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Limit for each individual attempt
    #[serde(default, with = "option_duration_millis")]
    pub attempt_timeout: Option<Duration>,

    /// Limit for a whole run, retries and backoff included
    #[serde(default, with = "option_duration_millis")]
    pub deadline: Option<Duration>,

    /// Ceiling for batch runs
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Failure handling for batch runs
    #[serde(default)]
    pub join_mode: JoinMode,
}

fn default_concurrency() -> usize {
    4
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: None,
            deadline: None,
            concurrency: default_concurrency(),
            join_mode: JoinMode::default(),
        }
    }
}

impl RunnerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (unset means default):
    /// - `RESILIENT_MAX_ATTEMPTS`: invocations per run, initial one included (default: 3)
    /// - `RESILIENT_BASE_DELAY_MS`: delay before the first retry (default: 100)
    /// - `RESILIENT_MAX_DELAY_MS`: cap on any single delay (default: 30000)
    /// - `RESILIENT_JITTER`: `true`/`false`/`1`/`0` (default: true)
    /// - `RESILIENT_ATTEMPT_TIMEOUT_MS`: per-attempt limit (default: none)
    /// - `RESILIENT_DEADLINE_MS`: whole-run limit (default: none)
    /// - `RESILIENT_CONCURRENCY`: batch ceiling (default: 4)
    /// - `RESILIENT_JOIN_MODE`: `fail_fast` or `collect_all` (default: fail_fast)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut retry = defaults.retry.clone();

        if let Some(attempts) = parse_var(&lookup, "RESILIENT_MAX_ATTEMPTS", parse_u32)? {
            retry.max_attempts = attempts;
        }
        if let Some(delay) = parse_var(&lookup, "RESILIENT_BASE_DELAY_MS", parse_millis)? {
            retry.base_delay = delay;
        }
        if let Some(delay) = parse_var(&lookup, "RESILIENT_MAX_DELAY_MS", parse_millis)? {
            retry.max_delay = delay;
        }
        if let Some(jitter) = parse_var(&lookup, "RESILIENT_JITTER", parse_bool)? {
            retry.jitter = jitter;
        }

        let config = Self {
            retry,
            attempt_timeout: parse_var(&lookup, "RESILIENT_ATTEMPT_TIMEOUT_MS", parse_millis)?,
            deadline: parse_var(&lookup, "RESILIENT_DEADLINE_MS", parse_millis)?,
            concurrency: parse_var(&lookup, "RESILIENT_CONCURRENCY", parse_usize)?
                .unwrap_or(defaults.concurrency),
            join_mode: parse_var(&lookup, "RESILIENT_JOIN_MODE", |v| v.parse::<JoinMode>())?
                .unwrap_or(defaults.join_mode),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid(format!(
                "max delay {:?} is shorter than base delay {:?}",
                self.retry.max_delay, self.retry.base_delay
            )));
        }
        if self.attempt_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("attempt timeout must be positive".into()));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("deadline must be positive".into()));
        }
        Ok(())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_join_mode(mut self, mode: JoinMode) -> Self {
        self.join_mode = mode;
        self
    }
}

fn parse_var<L, T, P, PE>(lookup: &L, var: &'static str, parse: P) -> Result<Option<T>, ConfigError>
where
    L: Fn(&str) -> Option<String>,
    P: FnOnce(&str) -> Result<T, PE>,
    PE: ToString,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    parse(trimmed)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn parse_u32(value: &str) -> Result<u32, std::num::ParseIntError> {
    value.parse()
}

fn parse_usize(value: &str) -> Result<usize, std::num::ParseIntError> {
    value.parse()
}

fn parse_millis(value: &str) -> Result<Duration, std::num::ParseIntError> {
    value.parse().map(Duration::from_millis)
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got {other}")),
    }
}

/// Serialize a [`Duration`] as whole milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an optional [`Duration`] as whole milliseconds or `null`
pub mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::duration_millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
