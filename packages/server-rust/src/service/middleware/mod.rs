//! Tower middleware layers for endpoints.
//!
//! - [`retry`]: Re-invokes on retryable failures using a [`backoff`] policy
//! - [`circuit_breaker`]: Fails fast while a dependency is unhealthy
//! - [`logging`]: One structured log line per call
//! - [`pipeline`]: Composes the layers into the standard chain

pub mod backoff;
pub mod circuit_breaker;
pub mod logging;
pub mod pipeline;
pub mod retry;

pub use backoff::{Backoff, BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use circuit_breaker::{is_breaker_rejection, CircuitBreakerLayer};
pub use logging::LogLayer;
pub use pipeline::build_resilient_chain;
pub use retry::{RetriesExhausted, RetryLayer};
