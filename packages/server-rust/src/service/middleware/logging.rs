//! Endpoint call logging.
//!
//! Logs every call in the request span bound by the transport, with the
//! status the transport will answer with and the call duration. Request and
//! response payloads are logged only when enabled.

use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};
use trellis_core::{status_code_of, BoxFuture, Call, Endpoint, Error, Reply};

// ---------------------------------------------------------------------------
// LogLayer
// ---------------------------------------------------------------------------

/// Tower layer that logs endpoint calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogLayer {
    log_request: bool,
    log_response: bool,
    errors_only: bool,
}

impl LogLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a layer from option names: `"request"`, `"response"`, `"errors"`.
    ///
    /// Unknown names are ignored.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        fields
            .into_iter()
            .fold(Self::default(), |layer, field| match field {
                "request" => layer.request(),
                "response" => layer.response(),
                "errors" => layer.errors_only(),
                _ => layer,
            })
    }

    /// Logs the request payload before the call.
    #[must_use]
    pub fn request(mut self) -> Self {
        self.log_request = true;
        self
    }

    /// Logs the response payload after a successful call.
    #[must_use]
    pub fn response(mut self) -> Self {
        self.log_response = true;
        self
    }

    /// Only logs calls that failed.
    #[must_use]
    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }
}

impl Layer<Endpoint> for LogLayer {
    type Service = LogService;

    fn layer(&self, inner: Endpoint) -> Self::Service {
        LogService {
            inner,
            options: *self,
        }
    }
}

// ---------------------------------------------------------------------------
// LogService
// ---------------------------------------------------------------------------

/// Service wrapper produced by [`LogLayer`].
#[derive(Debug, Clone)]
pub struct LogService {
    inner: Endpoint,
    options: LogLayer,
}

impl Service<Call> for LogService {
    type Response = Reply;
    type Error = Error;
    type Future = BoxFuture<Result<Reply, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let options = self.options;
        let span = call.ctx.span().clone();

        if options.log_request && !options.errors_only {
            tracing::info!(parent: &span, request = ?call.request, "request");
        }

        let fut = self.inner.call(call);
        Box::pin(async move {
            let start = Instant::now();
            let result = fut.await;
            let status = status_code_of(&result).as_u16();

            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &result {
                Err(err) => {
                    tracing::warn!(parent: &span, status, duration_ms, error = %err, "response");
                }
                Ok(_) if options.errors_only => {}
                Ok(reply) if options.log_response => {
                    tracing::info!(
                        parent: &span,
                        status,
                        duration_ms,
                        response = ?reply.payload(),
                        "response"
                    );
                }
                Ok(_) => tracing::info!(parent: &span, status, duration_ms, "response"),
            }

            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
