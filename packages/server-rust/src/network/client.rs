//! Outbound HTTP client whose failures carry the same classification as
//! endpoint errors.
//!
//! Non-success statuses become [`StatusError`](trellis_core::StatusError)s
//! via `classify_status`, so a client call wrapped in the retry layer only
//! retries 429 and the retryable 5xx statuses, and an endpoint that proxies
//! the call answers with the upstream status.

use std::fmt;
use std::marker::PhantomData;

use axum::http::{Method, StatusCode};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use trellis_core::{classify_status, Classify, Endpoint, Error, LogKey, Payload, RequestContext};

/// Failures that happen before an HTTP status is available.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("sending request: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("reading response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("request cancelled")]
    Cancelled,
}

impl Classify for ClientError {
    fn retryable(&self) -> Option<bool> {
        match self {
            ClientError::Transport(err) => Some(err.is_connect() || err.is_timeout()),
            ClientError::Body(err) => Some(err.is_timeout()),
            ClientError::Cancelled => Some(false),
        }
    }

    fn status_code(&self) -> Option<StatusCode> {
        match self {
            ClientError::Transport(err) | ClientError::Body(err) if err.is_timeout() => {
                Some(StatusCode::GATEWAY_TIMEOUT)
            }
            ClientError::Transport(_) | ClientError::Body(_) => Some(StatusCode::BAD_GATEWAY),
            ClientError::Cancelled => None,
        }
    }
}

/// Typed JSON client for one remote endpoint.
pub struct HttpClient<Req, Resp> {
    client: reqwest::Client,
    method: Method,
    url: Url,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for HttpClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> fmt::Debug for HttpClient<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> HttpClient<Req, Resp>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), method, url)
    }

    /// Uses a preconfigured `reqwest` client (timeouts, TLS, pooling).
    #[must_use]
    pub fn with_client(client: reqwest::Client, method: Method, url: Url) -> Self {
        Self {
            client,
            method,
            url,
            _types: PhantomData,
        }
    }

    /// Sends `request` and decodes the JSON response.
    ///
    /// The request is JSON-encoded as the body, except for GET and HEAD.
    /// The caller's request id, when bound, is forwarded as `x-request-id`.
    ///
    /// # Errors
    ///
    /// - a [`StatusError`](trellis_core::StatusError) for non-success statuses
    /// - a [`ClientError`] for connection, timeout, or cancellation failures
    /// - the `serde_json` error if the body does not decode as `Resp`
    pub async fn call(&self, ctx: &RequestContext, request: &Req) -> Result<Resp, Error> {
        let mut builder = self.client.request(self.method.clone(), self.url.clone());
        if !matches!(self.method, Method::GET | Method::HEAD) {
            builder = builder.json(request);
        }
        if let Some(request_id) = ctx.field(LogKey::HttpXRequestId) {
            builder = builder.header("x-request-id", request_id);
        }

        let response = tokio::select! {
            response = builder.send() => response.map_err(ClientError::Transport)?,
            () = ctx.cancelled() => return Err(ClientError::Cancelled.into()),
        };
        classify_status(response.status())?;

        let body = response.bytes().await.map_err(ClientError::Body)?;
        if body.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// The client as an [`Endpoint`], so middleware can wrap outbound calls.
    #[must_use]
    pub fn endpoint(self) -> Endpoint
    where
        Req: Payload + Clone,
        Resp: Payload,
    {
        Endpoint::typed(move |ctx: RequestContext, request: Req| {
            let client = self.clone();
            async move { client.call(&ctx, &request).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::{get, post};
    use axum::Json;
    use serde::Deserialize;
    use tower::{Layer, ServiceExt};
    use trellis_core::Call;

    use super::*;
    use crate::service::middleware::{FixedBackoff, RetryLayer};

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    struct Ping {
        n: u32,
    }

    async fn upstream(flaky_failures: usize) -> SocketAddr {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = axum::Router::new()
            .route("/ping", post(|Json(ping): Json<Ping>| async move { Json(Ping { n: ping.n + 1 }) }))
            .route("/busy", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route("/gone", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/flaky",
                post(move |Json(ping): Json<Ping>| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < flaky_failures {
                            Err(StatusCode::BAD_GATEWAY)
                        } else {
                            Ok(Json(ping))
                        }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    fn url(addr: SocketAddr, path: &str) -> Url {
        format!("http://{addr}{path}").parse().unwrap()
    }

    #[tokio::test]
    async fn decodes_successful_responses() {
        let addr = upstream(0).await;
        let client: HttpClient<Ping, Ping> = HttpClient::new(Method::POST, url(addr, "/ping"));
        let pong = client
            .call(&RequestContext::detached(), &Ping { n: 1 })
            .await
            .unwrap();
        assert_eq!(pong, Ping { n: 2 });
    }

    #[tokio::test]
    async fn error_statuses_keep_their_classification() {
        let addr = upstream(0).await;
        let ctx = RequestContext::detached();

        let busy: HttpClient<(), Ping> = HttpClient::new(Method::GET, url(addr, "/busy"));
        let err = busy.call(&ctx, &()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let gone: HttpClient<(), Ping> = HttpClient::new(Method::GET, url(addr, "/gone"));
        let err = gone.call(&ctx, &()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connection_failures_are_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client: HttpClient<(), Ping> = HttpClient::new(Method::GET, url(addr, "/ping"));
        let err = client.call(&RequestContext::detached(), &()).await.unwrap_err();
        assert!(err.is::<ClientError>());
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_call() {
        let addr = upstream(0).await;
        let client: HttpClient<Ping, Ping> = HttpClient::new(Method::POST, url(addr, "/ping"));
        let ctx = RequestContext::detached();
        ctx.cancellation().cancel();

        let err = client.call(&ctx, &Ping { n: 0 }).await.unwrap_err();
        assert!(matches!(err.find::<ClientError>(), Some(ClientError::Cancelled)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn retry_layer_wraps_the_client_endpoint() {
        let addr = upstream(2).await;
        let client: HttpClient<Ping, Ping> = HttpClient::new(Method::POST, url(addr, "/flaky"));
        let endpoint = RetryLayer::new(FixedBackoff::immediate(3)).layer(client.endpoint());

        let reply = endpoint
            .oneshot(Call::new(RequestContext::detached(), Ping { n: 9 }))
            .await
            .unwrap();
        assert_eq!(reply.downcast::<Ping>().unwrap(), Ping { n: 9 });
    }
}
