//! Pipeline composition: the standard resilient middleware chain.

use std::sync::Arc;

use trellis_core::MiddlewareChain;

use super::backoff::BackoffPolicy;
use super::circuit_breaker::CircuitBreakerLayer;
use super::logging::LogLayer;
use super::retry::RetryLayer;
use crate::service::breaker::CircuitBreaker;

/// Build the standard endpoint middleware chain.
///
/// Layer order (outermost to innermost):
/// 1. `LogLayer` -- one log line per call, with the final status
/// 2. `RetryLayer` -- re-invokes on retryable failures, including breaker rejections
/// 3. `CircuitBreakerLayer` -- fails fast while the dependency is unhealthy
#[must_use]
pub fn build_resilient_chain<P: BackoffPolicy>(
    log: LogLayer,
    backoff: P,
    breaker: Arc<dyn CircuitBreaker>,
) -> MiddlewareChain {
    MiddlewareChain::new()
        .layer(log)
        .layer(RetryLayer::new(backoff))
        .layer(CircuitBreakerLayer::shared(breaker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
