//! Retry middleware for endpoints.
//!
//! Re-invokes the inner endpoint while it fails with a retryable error and
//! the backoff policy still yields delays. Non-retryable errors and
//! successes pass through untouched.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use trellis_core::{BoxFuture, Call, Classify, Endpoint, Error, Reply};

use super::backoff::{Backoff, BackoffPolicy};

// ---------------------------------------------------------------------------
// RetriesExhausted
// ---------------------------------------------------------------------------

/// Returned when the backoff policy runs out while the call keeps failing.
///
/// The last underlying error is the cause, so its classification and status
/// code survive.
pub struct RetriesExhausted {
    pub attempts: u32,
    pub last: Error,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "giving up after {} attempts: {}",
            self.attempts, self.last
        )
    }
}

impl fmt::Debug for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetriesExhausted")
            .field("attempts", &self.attempts)
            .field("last", &self.last)
            .finish()
    }
}

impl std::error::Error for RetriesExhausted {}

impl Classify for RetriesExhausted {
    fn cause(&self) -> Option<&dyn Classify> {
        Some(self.last.as_classify())
    }
}

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer that retries retryable failures according to a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct RetryLayer<P> {
    policy: Arc<P>,
}

impl<P: BackoffPolicy> RetryLayer<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<P> Layer<Endpoint> for RetryLayer<P> {
    type Service = RetryService<P>;

    fn layer(&self, inner: Endpoint) -> Self::Service {
        RetryService {
            inner,
            policy: Arc::clone(&self.policy),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

/// Service wrapper produced by [`RetryLayer`].
#[derive(Debug)]
pub struct RetryService<P> {
    inner: Endpoint,
    policy: Arc<P>,
}

impl<P> Clone for RetryService<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<P: BackoffPolicy> Service<Call> for RetryService<P> {
    type Response = Reply;
    type Error = Error;
    type Future = BoxFuture<Result<Reply, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let inner = self.inner.clone();
        let mut backoff = self.policy.backoff();

        Box::pin(async move {
            let mut attempts: u32 = 0;
            loop {
                attempts += 1;
                let err = match inner.call(call.clone()).await {
                    Ok(reply) => return Ok(reply),
                    Err(err) if !err.is_retryable() => return Err(err),
                    Err(err) => err,
                };

                let Some(delay) = backoff.next_backoff() else {
                    return Err(RetriesExhausted {
                        attempts,
                        last: err,
                    }
                    .into());
                };

                tracing::debug!(
                    parent: call.ctx.span(),
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying endpoint call"
                );

                tokio::select! {
                    () = call.ctx.cancelled() => return Err(err),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        })
    }
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
    use crate::service::middleware::backoff::FixedBackoff;

    /// Endpoint that fails `failures` times with the given error, then succeeds.
    fn flaky(
        failures: u32,
        make_err: fn() -> Error,
    ) -> (Endpoint, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let endpoint = Endpoint::new(move |_call| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(make_err())
                } else {
                    Ok(Reply::new("done"))
                }
            }
        });
        (endpoint, calls)
    }

    fn call() -> Call {
        Call::new(RequestContext::detached(), ())
    }

    #[tokio::test]
    async fn retries_retryable_failures_until_success() {
        let (endpoint, calls) = flaky(2, || Error::msg("transient").retryable());
        let svc = RetryLayer::new(FixedBackoff::immediate(2)).layer(endpoint);

        let reply = svc.oneshot(call()).await.unwrap();
        assert_eq!(reply.downcast::<&str>().unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_returned_unchanged() {
        let (endpoint, calls) = flaky(1, || StatusError::new(StatusCode::NOT_FOUND).into());
        let svc = RetryLayer::new(FixedBackoff::immediate(5)).layer(endpoint);

        let err = svc.oneshot(call()).await.unwrap_err();
        assert!(err.is::<StatusError>());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_keeps_status() {
        let (endpoint, calls) = flaky(10, || {
            StatusError::new(StatusCode::SERVICE_UNAVAILABLE).into()
        });
        let svc = RetryLayer::new(FixedBackoff::immediate(2)).layer(endpoint);

        let err = svc.oneshot(call()).await.unwrap_err();
        let exhausted = err.find::<RetriesExhausted>().unwrap();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let (endpoint, calls) = flaky(1, || Error::msg("transient").retryable());
        let svc = RetryLayer::new(FixedBackoff::constant(Duration::from_secs(5), 1)).layer(endpoint);

        let started = tokio::time::Instant::now();
        svc.oneshot(call()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_wait_with_last_error() {
        let (endpoint, calls) = flaky(10, || Error::msg("transient").retryable());
        let svc = RetryLayer::new(FixedBackoff::constant(Duration::from_secs(60), 3)).layer(endpoint);

        let call = call();
        let token = call.ctx.cancellation().clone();
        let pending = tokio::spawn(svc.oneshot(call));

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "transient");
        assert!(err.find::<RetriesExhausted>().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
