//! HTTP endpoint descriptors: routing attributes plus request/response codecs.
//!
//! An [`HttpEndpoint`] pairs a transport-independent [`Endpoint`] with the
//! methods and paths it answers on, a request decoder, a response encoder,
//! and optional per-endpoint tower layers. JSON codecs are the default.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::http::header::{self, HeaderMap};
use axum::http::{Method, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use trellis_core::{Classify, Endpoint, Error, LogKey, Payload, Reply, RequestContext};

/// Type-erased HTTP request handler, as stored in a router.
pub type HttpHandler = BoxCloneSyncService<Request, Response, Infallible>;

pub(crate) type HandlerLayer = Arc<dyn Fn(HttpHandler) -> HttpHandler + Send + Sync>;
type DecodeFn<Req> = Arc<dyn Fn(&RequestContext, &RequestHead, Bytes) -> Result<Req, Error> + Send + Sync>;
type EncodeFn<Resp> = Arc<dyn Fn(&RequestContext, Resp) -> Result<Response, Error> + Send + Sync>;

/// Wraps any cloneable tower service over HTTP requests as an [`HttpHandler`].
pub fn into_handler<S>(service: S) -> HttpHandler
where
    S: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse + 'static,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(service.map_response(IntoResponse::into_response))
}

// ---------------------------------------------------------------------------
// RequestHead
// ---------------------------------------------------------------------------

/// The parts of an HTTP request a decoder and the logger binding can see.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestHead {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        extensions: &axum::http::Extensions,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            remote_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// The value of `key` for this request, if present.
    #[must_use]
    pub fn log_value(&self, key: LogKey) -> Option<String> {
        match key {
            LogKey::HttpMethod => Some(self.method.to_string()),
            LogKey::HttpUri => Some(
                self.uri
                    .path_and_query()
                    .map_or_else(|| self.uri.path().to_string(), ToString::to_string),
            ),
            LogKey::HttpPath => Some(self.uri.path().to_string()),
            LogKey::HttpProto => Some(format!("{:?}", self.version)),
            LogKey::HttpRequestHost => self
                .header(header::HOST.as_str())
                .or_else(|| self.uri.host().map(str::to_string)),
            LogKey::HttpRemoteAddr => self.remote_addr.map(|addr| addr.to_string()),
            LogKey::HttpXForwardedFor => self.header("x-forwarded-for"),
            LogKey::HttpXForwardedProto => self.header("x-forwarded-proto"),
            LogKey::HttpUserAgent => self.header(header::USER_AGENT.as_str()),
            LogKey::HttpXRequestId => self.header("x-request-id"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and responses
// ---------------------------------------------------------------------------

/// A request decoder failed.
///
/// Answers 400 unless the decoder's error carries its own status.
pub struct DecodeError {
    inner: Error,
}

impl DecodeError {
    pub fn new(inner: impl Into<Error>) -> Self {
        Self {
            inner: inner.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decoding request: {}", self.inner)
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DecodeError").field(&self.inner).finish()
    }
}

impl std::error::Error for DecodeError {}

impl Classify for DecodeError {
    fn status_code(&self) -> Option<StatusCode> {
        Some(
            self.inner
                .explicit_status_code()
                .unwrap_or(StatusCode::BAD_REQUEST),
        )
    }

    fn cause(&self) -> Option<&dyn Classify> {
        Some(self.inner.as_classify())
    }
}

/// A response that answers with an explicit status instead of 200.
///
/// Use with [`encode_json_with_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse<T> {
    pub status: StatusCode,
    pub body: T,
}

impl<T> StatusResponse<T> {
    pub fn new(body: T, status: StatusCode) -> Self {
        Self { status, body }
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Decodes the body as JSON. An empty body decodes as `null`, so `()` and
/// `Option<T>` requests work for bodiless methods.
///
/// # Errors
///
/// Returns the `serde_json` error when the body does not match `T`.
pub fn decode_json<T: DeserializeOwned>(
    _ctx: &RequestContext,
    _head: &RequestHead,
    body: Bytes,
) -> Result<T, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(serde_json::Value::Null)?);
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Ignores the request entirely and yields `T::default()`.
///
/// # Errors
///
/// Never fails.
pub fn decode_nothing<T: Default>(
    _ctx: &RequestContext,
    _head: &RequestHead,
    _body: Bytes,
) -> Result<T, Error> {
    Ok(T::default())
}

/// Encodes the response as JSON with status 200.
///
/// # Errors
///
/// Returns the `serde_json` error when `T` cannot be serialized.
pub fn encode_json<T: Serialize>(_ctx: &RequestContext, response: T) -> Result<Response, Error> {
    json_response(StatusCode::OK, &response)
}

/// Encodes a [`StatusResponse`] as JSON with its status. 204 and 304 carry no body.
///
/// # Errors
///
/// Returns the `serde_json` error when `T` cannot be serialized.
pub fn encode_json_with_status<T: Serialize>(
    _ctx: &RequestContext,
    response: StatusResponse<T>,
) -> Result<Response, Error> {
    if matches!(
        response.status,
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return Ok(response.status.into_response());
    }
    json_response(response.status, &response.body)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response, Error> {
    let body = serde_json::to_vec(body)?;
    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response())
}

/// Encodes an endpoint error: the status from the error chain and the message as plain text.
#[must_use]
pub fn encode_error(ctx: &RequestContext, err: &Error) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(parent: ctx.span(), status = status.as_u16(), error = %err, "endpoint failed");
    } else {
        tracing::debug!(parent: ctx.span(), status = status.as_u16(), error = %err, "endpoint failed");
    }
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        err.to_string(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// HttpEndpoint
// ---------------------------------------------------------------------------

/// An endpoint hosted on an HTTP transport.
pub struct HttpEndpoint<Req, Resp> {
    methods: Vec<Method>,
    paths: Vec<String>,
    endpoint: Endpoint,
    decoder: DecodeFn<Req>,
    encoder: EncodeFn<Resp>,
    layers: Vec<HandlerLayer>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> HttpEndpoint<Req, Resp>
where
    Req: DeserializeOwned + Payload + Clone,
    Resp: Serialize + Payload,
{
    /// Creates an endpoint with JSON request decoding and JSON response encoding.
    pub fn new<M, P, F, Fut>(methods: M, paths: P, handler: F) -> Self
    where
        M: IntoIterator<Item = Method>,
        P: IntoIterator,
        P::Item: Into<String>,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        Self::with_codec(
            methods,
            paths,
            Endpoint::typed(handler),
            decode_json::<Req>,
            encode_json::<Resp>,
        )
    }
}

impl<Req: Payload, Resp: Payload> HttpEndpoint<Req, Resp> {
    /// Creates an endpoint from a prebuilt [`Endpoint`] and explicit codecs.
    ///
    /// The endpoint must accept `Req` and reply with `Resp`; a mismatch is
    /// answered with a 500.
    pub fn with_codec<M, P, D, E>(
        methods: M,
        paths: P,
        endpoint: Endpoint,
        decoder: D,
        encoder: E,
    ) -> Self
    where
        M: IntoIterator<Item = Method>,
        P: IntoIterator,
        P::Item: Into<String>,
        D: Fn(&RequestContext, &RequestHead, Bytes) -> Result<Req, Error> + Send + Sync + 'static,
        E: Fn(&RequestContext, Resp) -> Result<Response, Error> + Send + Sync + 'static,
    {
        Self {
            methods: methods.into_iter().collect(),
            paths: paths.into_iter().map(Into::into).collect(),
            endpoint,
            decoder: Arc::new(decoder),
            encoder: Arc::new(encoder),
            layers: Vec::new(),
            _types: PhantomData,
        }
    }

    /// Replaces the request decoder.
    #[must_use]
    pub fn decoder<D>(mut self, decoder: D) -> Self
    where
        D: Fn(&RequestContext, &RequestHead, Bytes) -> Result<Req, Error> + Send + Sync + 'static,
    {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Replaces the response encoder.
    #[must_use]
    pub fn encoder<E>(mut self, encoder: E) -> Self
    where
        E: Fn(&RequestContext, Resp) -> Result<Response, Error> + Send + Sync + 'static,
    {
        self.encoder = Arc::new(encoder);
        self
    }

    /// Wraps only this endpoint's HTTP handler with a tower layer.
    ///
    /// The first layer added is the outermost.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<HttpHandler> + Send + Sync + 'static,
        L::Service: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.layers
            .push(Arc::new(move |handler| into_handler(layer.layer(handler))));
        self
    }

    #[must_use]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub(crate) fn erase(self) -> ErasedEndpoint {
        let decoder = self.decoder;
        let encoder = self.encoder;
        let decode = move |ctx: &RequestContext,
                           head: &RequestHead,
                           body: Bytes|
              -> Result<Arc<dyn Payload>, Error> {
            let request = decoder(ctx, head, body).map_err(DecodeError::new)?;
            Ok(Arc::new(request) as Arc<dyn Payload>)
        };
        let encode = move |ctx: &RequestContext, reply: Reply| -> Result<Response, Error> {
            encoder(ctx, reply.downcast::<Resp>()?)
        };
        ErasedEndpoint {
            methods: self.methods,
            paths: self.paths,
            endpoint: self.endpoint,
            decode: Arc::new(decode),
            encode: Arc::new(encode),
            layers: self.layers,
        }
    }
}

impl<Req, Resp> fmt::Debug for HttpEndpoint<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEndpoint")
            .field("methods", &self.methods)
            .field("paths", &self.paths)
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}

/// An [`HttpEndpoint`] with its request and response types erased.
#[derive(Clone)]
pub(crate) struct ErasedEndpoint {
    pub(crate) methods: Vec<Method>,
    pub(crate) paths: Vec<String>,
    pub(crate) endpoint: Endpoint,
    pub(crate) decode: Arc<
        dyn Fn(&RequestContext, &RequestHead, Bytes) -> Result<Arc<dyn Payload>, Error>
            + Send
            + Sync,
    >,
    pub(crate) encode: Arc<dyn Fn(&RequestContext, Reply) -> Result<Response, Error> + Send + Sync>,
    pub(crate) layers: Vec<HandlerLayer>,
}
