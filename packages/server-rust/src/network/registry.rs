//! Endpoint registry: collects HTTP endpoints and binds them into handlers.
//!
//! Binding wraps every endpoint with the shared middleware chain, attaches
//! its codecs, and produces one [`HttpHandler`] per endpoint. Each request
//! served by a bound handler gets its own [`RequestContext`]: a fresh span
//! carrying the configured log keys and a cancellation token that fires if
//! the client goes away or the transport gives up draining.

use std::sync::Arc;

use axum::handler::Handler;
use axum::http::header::HeaderMap;
use axum::http::{Extensions, Method, Uri, Version};
use axum::response::Response;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use trellis_core::{Call, Endpoint, LogContext, MiddlewareChain, Payload};

use super::endpoint::{encode_error, into_handler, ErasedEndpoint, HttpEndpoint, HttpHandler, RequestHead};

/// An endpoint bound for serving: where it answers and the handler to run.
#[derive(Clone)]
pub struct BoundHandler {
    pub methods: Vec<Method>,
    pub paths: Vec<String>,
    pub handler: HttpHandler,
}

impl std::fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundHandler")
            .field("methods", &self.methods)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

/// Errors from binding endpoints.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("endpoint #{index} declares no HTTP method (paths: {paths:?})")]
    MissingMethods { index: usize, paths: Vec<String> },

    #[error("endpoint #{index} declares no path (methods: {methods:?})")]
    MissingPaths { index: usize, methods: Vec<Method> },
}

/// Ordered collection of HTTP endpoints.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<ErasedEndpoint>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint. Endpoints bind in the order they were added.
    pub fn add<Req: Payload, Resp: Payload>(&mut self, endpoint: HttpEndpoint<Req, Resp>) -> &mut Self {
        self.endpoints.push(endpoint.erase());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Checks that every endpoint has at least one method and one path.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint that is missing either.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.methods.is_empty() {
                return Err(RegistryError::MissingMethods {
                    index,
                    paths: endpoint.paths.clone(),
                });
            }
            if endpoint.paths.is_empty() {
                return Err(RegistryError::MissingPaths {
                    index,
                    methods: endpoint.methods.clone(),
                });
            }
        }
        Ok(())
    }

    /// Binds every endpoint: middleware chain, codecs, then per-endpoint layers.
    ///
    /// Request tokens are children of `requests`, so cancelling it cancels
    /// every request in flight.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if any endpoint fails validation; nothing is bound.
    pub fn build(
        &self,
        chain: &MiddlewareChain,
        logging: &LogContext,
        requests: &CancellationToken,
    ) -> Result<Vec<BoundHandler>, RegistryError> {
        self.validate()?;

        Ok(self
            .endpoints
            .iter()
            .map(|endpoint| {
                let serve = Arc::new(ServeEndpoint {
                    endpoint: chain.apply(endpoint.endpoint.clone()),
                    source: endpoint.clone(),
                    logging: logging.clone(),
                    requests: requests.clone(),
                });

                let handler = move |method: Method,
                                    uri: Uri,
                                    version: Version,
                                    headers: HeaderMap,
                                    extensions: Extensions,
                                    body: Bytes| {
                    let serve = Arc::clone(&serve);
                    async move {
                        let head = RequestHead::new(method, uri, version, headers, &extensions);
                        serve.serve(head, body).await
                    }
                };

                let mut handler = into_handler(handler.with_state(()));
                for layer in endpoint.layers.iter().rev() {
                    handler = layer(handler);
                }

                BoundHandler {
                    methods: endpoint.methods.clone(),
                    paths: endpoint.paths.clone(),
                    handler,
                }
            })
            .collect())
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

struct ServeEndpoint {
    endpoint: Endpoint,
    source: ErasedEndpoint,
    logging: LogContext,
    requests: CancellationToken,
}

impl ServeEndpoint {
    async fn serve(&self, head: RequestHead, body: Bytes) -> Response {
        let cancellation = self.requests.child_token();
        // Dropping the response future (client disconnect) cancels the request.
        let _cancel_on_drop = cancellation.clone().drop_guard();
        let ctx = self.logging.bind(cancellation, |key| head.log_value(key));

        let result = async {
            let request = (self.source.decode)(&ctx, &head, body)?;
            let reply = self
                .endpoint
                .call(Call {
                    ctx: ctx.clone(),
                    request,
                })
                .await?;
            (self.source.encode)(&ctx, reply)
        }
        .instrument(ctx.span().clone())
        .await;

        result.unwrap_or_else(|err| encode_error(&ctx, &err))
    }
}
