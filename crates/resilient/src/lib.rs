//! # Resilient Execution Core
//!
//! Composable resilience combinators for fallible async operations.
//!
//! ## Features
//!
//! - **Bounded retry**: exponential backoff capped at a maximum, with full jitter
//! - **Timeout guards**: overrunning work is dropped and reported as `Timeout`
//! - **Fallback**: substitute a value or another operation on failure
//! - **Scoped resources**: release runs exactly once on every exit path
//! - **Bounded concurrency**: fan out with a ceiling, fail-fast or collect-all
//! - **One error taxonomy**: every failure is an [`AppError`] with a single [`ErrorKind`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OperationRunner                          │
//! │  (deadline → retry → attempt timeout, per configured policy) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Operation combinators (caller-ordered)            │
//! │      Retry · Timeout · Fallback · ResourceScope              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BoundedConcurrencyRunner                     │
//! │  (spawns one task per operation, gated by ConcurrencyLimiter)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use resilient::prelude::*;
//!
//! let client = HttpClient::new("https://api.example.com", Arc::new(ReqwestTransport::new()));
//!
//! let post = client
//!     .json_operation::<Post>(HttpRequest::get(client.url("/posts/999")))
//!     .with_retry(RetryPolicy::exponential())
//!     .with_timeout(Duration::from_secs(2))
//!     .with_fallback_value(Post::placeholder())
//!     .call()
//!     .await?;
//! ```

pub mod concurrency;
pub mod config;
pub mod error;
pub mod operation;
pub mod reliability;
pub mod runner;
pub mod scope;
pub mod transport;

/// Prelude for common imports
pub mod prelude {
    pub use crate::concurrency::{
        run_all, run_all_settled, BoundedConcurrencyRunner, ConcurrencyLimiter, JoinMode,
        JoinOutcome,
    };
    pub use crate::config::{ConfigError, RunnerConfig};
    pub use crate::error::{classify, AppError, Classify, ErrorKind, RawFailure};
    pub use crate::operation::{fail, op_fn, succeed, BoxOperation, Operation, OperationExt};
    pub use crate::reliability::{Fallback, Retry, RetryPolicy, RetryPredicate, Timeout};
    pub use crate::runner::{OperationRunner, RunPolicy};
    pub use crate::scope::{use_resource, ResourceScope};
    pub use crate::transport::{
        decode_json, DecodeError, HttpClient, HttpRequest, Method, RawResponse, Transport,
        TransportError,
    };
    #[cfg(feature = "reqwest")]
    pub use crate::transport::ReqwestTransport;
}

// Re-export key types at crate root
pub use concurrency::{run_all, run_all_settled, BoundedConcurrencyRunner, JoinMode, JoinOutcome};
pub use config::{ConfigError, RunnerConfig};
pub use error::{classify, AppError, Classify, ErrorKind, RawFailure, Result};
pub use operation::{op_fn, BoxOperation, Operation, OperationExt};
pub use reliability::{
    with_fallback, with_fallback_value, with_retry, with_timeout, Fallback, Retry, RetryPolicy,
    Timeout,
};
pub use runner::{OperationRunner, RunPolicy};
pub use scope::{use_resource, ResourceScope};
