//! Error taxonomy
//!
//! Every failure that leaves this crate is an [`AppError`]: a closed sum over
//! the six [`ErrorKind`]s. [`classify`] is the single place that knows how
//! collaborator-specific failures map onto that set; every combinator only
//! looks at the kind.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{DecodeError, TransportError};

/// Result type alias used throughout the crate
pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// The closed set of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection or protocol failure
    Transport,
    /// Deadline exceeded
    Timeout,
    /// Payload shape mismatch
    Decode,
    /// Entity absent
    NotFound,
    /// Caller input malformed
    Validation,
    /// Catch-all internal fault
    Service,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Transport,
        ErrorKind::Timeout,
        ErrorKind::Decode,
        ErrorKind::NotFound,
        ErrorKind::Validation,
        ErrorKind::Service,
    ];

    /// Whether retrying can plausibly change the outcome
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Transport | Self::Timeout | Self::Service => true,
            Self::Decode | Self::NotFound | Self::Validation => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Timeout => write!(f, "timeout"),
            Self::Decode => write!(f, "decode"),
            Self::NotFound => write!(f, "not_found"),
            Self::Validation => write!(f, "validation"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Anything that can report which [`ErrorKind`] it belongs to
///
/// Retry predicates are written against this trait so that callers can keep
/// their own error type as long as it classifies.
pub trait Classify {
    /// The kind of this error
    fn kind(&self) -> ErrorKind;
}

/// Application error
///
/// Immutable value object; equality is by kind and fields. Causes are kept
/// as rendered strings so the error stays `Clone + Eq` and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppError {
    /// Connection refused, reset, protocol violation, unexpected status
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
        cause: Option<String>,
    },

    /// The operation did not finish within its deadline
    #[error("operation timed out after {elapsed:?}")]
    Timeout {
        #[serde(with = "crate::config::duration_millis")]
        elapsed: Duration,
    },

    /// A payload could not be decoded into the expected shape
    #[error("decode error: {message}")]
    Decode {
        message: String,
        path: Option<String>,
    },

    /// The requested entity does not exist
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Caller input was rejected
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Internal fault, or a failure nothing else claimed
    #[error("service error: {message}")]
    Service {
        message: String,
        cause: Option<String>,
    },
}

impl AppError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
            cause: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            path: None,
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a service error
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause to the variants that carry one
    ///
    /// Variants without a cause slot are returned unchanged.
    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        match &mut self {
            Self::Transport { cause: slot, .. } | Self::Service { cause: slot, .. } => {
                *slot = Some(cause.to_string());
            }
            _ => {}
        }
        self
    }

    /// Attach the offending field to a validation error
    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        if let Self::Validation { field, .. } = &mut self {
            *field = Some(name.into());
        }
        self
    }

    /// Attach the payload path to a decode error
    pub fn with_path(mut self, location: impl Into<String>) -> Self {
        if let Self::Decode { path, .. } = &mut self {
            *path = Some(location.into());
        }
        self
    }

    /// Attach the HTTP status to a transport error
    pub fn with_status(mut self, code: u16) -> Self {
        if let Self::Transport { status, .. } = &mut self {
            *status = Some(code);
        }
        self
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Service { .. } => ErrorKind::Service,
        }
    }

    /// Human-readable message suitable for rendering to a user
    pub fn message(&self) -> String {
        match self {
            Self::Transport { message, .. }
            | Self::Decode { message, .. }
            | Self::Validation { message, .. }
            | Self::Service { message, .. } => message.clone(),
            Self::Timeout { elapsed } => format!("no response within {elapsed:?}"),
            Self::NotFound { resource, id } => format!("{resource} {id} does not exist"),
        }
    }

    /// Underlying cause, when one was recorded
    pub fn cause(&self) -> Option<&str> {
        match self {
            Self::Transport { cause, .. } | Self::Service { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Whether retrying can plausibly change the outcome
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl Classify for AppError {
    fn kind(&self) -> ErrorKind {
        AppError::kind(self)
    }
}

/// A failure as reported by a collaborator, before classification
#[derive(Debug)]
pub enum RawFailure {
    /// The transport refused or broke the exchange
    Transport(TransportError),
    /// The payload did not match the expected shape
    Decode(DecodeError),
    /// The collaborator reported the entity as absent
    Absent { resource: String, id: String },
    /// Input failed a schema or business rule check
    Schema {
        message: String,
        field: Option<String>,
    },
    /// The collaborator failed internally
    Internal(String),
    /// Anything else
    Other(anyhow::Error),
}

/// Map a collaborator failure onto exactly one [`ErrorKind`]
///
/// Unrecognised failures become [`AppError::Service`] with the original
/// message kept as the cause.
pub fn classify(failure: impl Into<RawFailure>) -> AppError {
    match failure.into() {
        RawFailure::Transport(err) => classify_transport(err),
        RawFailure::Decode(err) => AppError::Decode {
            message: err.to_string(),
            path: err.path().map(str::to_string),
        },
        RawFailure::Absent { resource, id } => AppError::NotFound { resource, id },
        RawFailure::Schema { message, field } => AppError::Validation { message, field },
        RawFailure::Internal(message) => AppError::service(message),
        RawFailure::Other(err) => classify_any(err),
    }
}

fn classify_transport(err: TransportError) -> AppError {
    match err {
        TransportError::Status { status, url } => match status {
            404 | 410 => AppError::not_found("resource", url),
            400 | 422 => AppError::validation(format!("request to {url} rejected with {status}")),
            500..=599 => AppError::service(format!("upstream {url} failed with {status}"))
                .with_cause(format!("HTTP {status}")),
            _ => AppError::transport(format!("unexpected status {status} from {url}"))
                .with_status(status),
        },
        TransportError::TimedOut { elapsed, .. } => AppError::timeout(elapsed),
        other => AppError::transport(other.to_string()).with_cause(format!("{other:?}")),
    }
}

fn classify_any(err: anyhow::Error) -> AppError {
    let err = match err.downcast::<AppError>() {
        Ok(app) => return app,
        Err(err) => err,
    };
    let err = match err.downcast::<TransportError>() {
        Ok(transport) => return classify_transport(transport),
        Err(err) => err,
    };
    let err = match err.downcast::<DecodeError>() {
        Ok(decode) => return classify(RawFailure::Decode(decode)),
        Err(err) => err,
    };
    let err = match err.downcast::<serde_json::Error>() {
        Ok(json) => return classify(RawFailure::Decode(DecodeError::from(json))),
        Err(err) => err,
    };

    AppError::Service {
        message: err.to_string(),
        cause: Some(format!("{err:#}")),
    }
}

impl From<TransportError> for RawFailure {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<DecodeError> for RawFailure {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<anyhow::Error> for RawFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        classify(err)
    }
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        classify(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        classify(err)
    }
}
