//! Circuit breaker middleware for endpoints.
//!
//! Only retryable failures count against the breaker. Business failures
//! (bad input, not found, conflicts) are reported as successes so they can
//! never open the circuit. A rejection by the breaker surfaces as a
//! retryable [`BreakerRejection`] so an outer retry or an upstream caller
//! can back off and try again.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use trellis_core::{BoxFuture, Call, Endpoint, Error, Reply};

use crate::service::breaker::{BreakerRejection, CallOutcome, CircuitBreaker, Permit};

// ---------------------------------------------------------------------------
// CircuitBreakerLayer
// ---------------------------------------------------------------------------

/// Tower layer that guards an endpoint with a shared [`CircuitBreaker`].
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<dyn CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: impl CircuitBreaker) -> Self {
        Self {
            breaker: Arc::new(breaker),
        }
    }

    /// Shares an existing breaker, e.g. across several endpoints of one dependency.
    #[must_use]
    pub fn shared(breaker: Arc<dyn CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl Layer<Endpoint> for CircuitBreakerLayer {
    type Service = CircuitBreakerService;

    fn layer(&self, inner: Endpoint) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerService
// ---------------------------------------------------------------------------

/// Service wrapper produced by [`CircuitBreakerLayer`].
#[derive(Clone)]
pub struct CircuitBreakerService {
    inner: Endpoint,
    breaker: Arc<dyn CircuitBreaker>,
}

impl Service<Call> for CircuitBreakerService {
    type Response = Reply;
    type Error = Error;
    type Future = BoxFuture<Result<Reply, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let permit = match Permit::acquire(&self.breaker) {
            Ok(permit) => permit,
            Err(rejection) => {
                tracing::debug!(parent: call.ctx.span(), %rejection, "call rejected by circuit breaker");
                return Box::pin(async move { Err::<Reply, Error>(rejection.into()) });
            }
        };

        let fut = self.inner.call(call);
        Box::pin(async move {
            let result = fut.await;
            let outcome = match &result {
                Err(err) if err.is_retryable() => CallOutcome::Failure,
                _ => CallOutcome::Success,
            };
            permit.record(outcome);
            result
        })
    }
}

/// Returns `true` if `err` is a rejection produced by a circuit breaker.
#[must_use]
pub fn is_breaker_rejection(err: &Error) -> bool {
    err.find::<BreakerRejection>().is_some()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use http::StatusCode;
    use tower::ServiceExt;
    use trellis_core::{RequestContext, StatusError};

    use super::*;
    use crate::service::breaker::{Breaker, BreakerConfig, BreakerState};
    use crate::service::middleware::backoff::FixedBackoff;
    use crate::service::middleware::retry::RetryLayer;

    fn trip_after_one() -> Arc<Breaker> {
        Arc::new(Breaker::new(
            "upstream",
            BreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
        ))
    }

    fn failing(make_err: fn() -> Error) -> (Endpoint, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let endpoint = Endpoint::new(move |_call| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Reply, Error>(make_err()) }
        });
        (endpoint, calls)
    }

    fn call() -> Call {
        Call::new(RequestContext::detached(), ())
    }

    #[tokio::test]
    async fn retryable_failure_trips_and_next_call_is_denied() {
        let breaker = trip_after_one();
        let layer = CircuitBreakerLayer::shared(breaker.clone());
        let (endpoint, calls) = failing(|| Error::msg("upstream down").retryable());
        let svc = layer.layer(endpoint);

        let first = svc.clone().oneshot(call()).await.unwrap_err();
        assert_eq!(first.to_string(), "upstream down");
        assert_eq!(breaker.state(), BreakerState::Open);

        let second = svc.oneshot(call()).await.unwrap_err();
        assert!(is_breaker_rejection(&second));
        assert!(second.is_retryable());
        assert_eq!(second.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn business_failures_never_trip() {
        let breaker = trip_after_one();
        let svc = CircuitBreakerLayer::shared(breaker.clone())
            .layer(failing(|| StatusError::new(StatusCode::BAD_REQUEST).into()).0);

        for _ in 0..3 {
            let err = svc.clone().oneshot(call()).await.unwrap_err();
            assert!(err.is::<StatusError>());
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn business_failures_invoke_every_time() {
        let (endpoint, calls) = failing(|| Error::msg("invalid order"));
        let svc = CircuitBreakerLayer::new(Breaker::new(
            "orders",
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        ))
        .layer(endpoint);

        for _ in 0..3 {
            let err = svc.clone().oneshot(call()).await.unwrap_err();
            assert_eq!(err.to_string(), "invalid order");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn outer_retry_sees_rejection_as_retryable() {
        let breaker = trip_after_one();
        let (endpoint, calls) = failing(|| Error::msg("upstream down").retryable());
        let guarded = Endpoint::from_service(CircuitBreakerLayer::shared(breaker).layer(endpoint));
        let svc = RetryLayer::new(FixedBackoff::immediate(2)).layer(guarded);

        let err = svc.oneshot(call()).await.unwrap_err();
        assert!(is_breaker_rejection(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
