//! Request-scoped context: logger binding and cancellation.
//!
//! Each in-flight call carries its own [`RequestContext`], created by the
//! transport from a [`LogContext`]. The context owns a `tracing` span that
//! acts as the request logger, annotated with the configured [`LogKey`]
//! values extracted from the transport's request metadata.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::Span;

// ---------------------------------------------------------------------------
// LogKey
// ---------------------------------------------------------------------------

/// Request metadata that can be attached to every log line of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKey {
    HttpMethod,
    HttpUri,
    HttpPath,
    HttpProto,
    HttpRequestHost,
    HttpRemoteAddr,
    HttpXForwardedFor,
    HttpXForwardedProto,
    HttpUserAgent,
    HttpXRequestId,
}

impl LogKey {
    /// Every supported key, in declaration order.
    pub const ALL: [LogKey; 10] = [
        LogKey::HttpMethod,
        LogKey::HttpUri,
        LogKey::HttpPath,
        LogKey::HttpProto,
        LogKey::HttpRequestHost,
        LogKey::HttpRemoteAddr,
        LogKey::HttpXForwardedFor,
        LogKey::HttpXForwardedProto,
        LogKey::HttpUserAgent,
        LogKey::HttpXRequestId,
    ];

    /// The configuration name of the key (e.g. `"http-method"`).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            LogKey::HttpMethod => "http-method",
            LogKey::HttpUri => "http-uri",
            LogKey::HttpPath => "http-path",
            LogKey::HttpProto => "http-proto",
            LogKey::HttpRequestHost => "http-requesthost",
            LogKey::HttpRemoteAddr => "http-remote-addr",
            LogKey::HttpXForwardedFor => "http-x-forwarded-for",
            LogKey::HttpXForwardedProto => "http-x-forwarded-proto",
            LogKey::HttpUserAgent => "http-user-agent",
            LogKey::HttpXRequestId => "http-x-request-id",
        }
    }

    /// The span field the key is recorded under.
    fn field(self) -> &'static str {
        match self {
            LogKey::HttpMethod => "http.method",
            LogKey::HttpUri => "http.uri",
            LogKey::HttpPath => "http.path",
            LogKey::HttpProto => "http.proto",
            LogKey::HttpRequestHost => "http.host",
            LogKey::HttpRemoteAddr => "http.remote_addr",
            LogKey::HttpXForwardedFor => "http.x_forwarded_for",
            LogKey::HttpXForwardedProto => "http.x_forwarded_proto",
            LogKey::HttpUserAgent => "http.user_agent",
            LogKey::HttpXRequestId => "http.request_id",
        }
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unsupported log key name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log key: {0}")]
pub struct UnknownLogKey(pub String);

impl FromStr for LogKey {
    type Err = UnknownLogKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogKey::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| UnknownLogKey(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// LogContext
// ---------------------------------------------------------------------------

/// The set of log keys bound into every request context.
///
/// Handed to each transport at registration time; the transport calls
/// [`LogContext::bind`] once per request with a lookup over its own metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    keys: Vec<LogKey>,
}

impl LogContext {
    /// Creates a binding for the given keys. Duplicates are ignored.
    pub fn new(keys: impl IntoIterator<Item = LogKey>) -> Self {
        let mut unique = Vec::new();
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        Self { keys: unique }
    }

    /// The configured keys, in configuration order.
    #[must_use]
    pub fn keys(&self) -> &[LogKey] {
        &self.keys
    }

    /// Creates a fresh request context.
    ///
    /// `lookup` is consulted for every configured key; empty values are skipped.
    pub fn bind<F>(&self, cancellation: CancellationToken, lookup: F) -> RequestContext
    where
        F: Fn(LogKey) -> Option<String>,
    {
        let span = tracing::info_span!(
            "request",
            http.method = Empty,
            http.uri = Empty,
            http.path = Empty,
            http.proto = Empty,
            http.host = Empty,
            http.remote_addr = Empty,
            http.x_forwarded_for = Empty,
            http.x_forwarded_proto = Empty,
            http.user_agent = Empty,
            http.request_id = Empty,
        );

        let mut fields = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            if let Some(value) = lookup(*key).filter(|v| !v.is_empty()) {
                span.record(key.field(), value.as_str());
                fields.push((*key, value));
            }
        }

        RequestContext {
            span,
            cancellation,
            fields: fields.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Per-request state threaded explicitly through decoders, middleware, and handlers.
///
/// Cloning is cheap; clones share the span, the cancellation token, and the
/// bound fields. Contexts are never shared between different requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    span: Span,
    cancellation: CancellationToken,
    fields: Arc<[(LogKey, String)]>,
}

impl RequestContext {
    /// Creates a context from an existing span and cancellation token.
    #[must_use]
    pub fn new(span: Span, cancellation: CancellationToken) -> Self {
        Self {
            span,
            cancellation,
            fields: Arc::from(Vec::new()),
        }
    }

    /// A context with a disabled span and its own token, for outbound calls and tests.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Span::none(), CancellationToken::new())
    }

    /// The request logger.
    ///
    /// Log through it with `tracing::info!(parent: ctx.span(), ...)` or by
    /// instrumenting futures with a clone.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The value bound for `key`, if it was configured and present.
    #[must_use]
    pub fn field(&self, key: LogKey) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All bound fields, in configuration order.
    #[must_use]
    pub fn fields(&self) -> &[(LogKey, String)] {
        &self.fields
    }

    /// The token cancelled when the caller gives up or the transport shuts down.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns `true` once the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}
