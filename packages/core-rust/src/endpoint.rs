//! Transport-independent endpoints.
//!
//! An [`Endpoint`] is a single asynchronous operation: it takes a [`Call`]
//! (request context plus an opaque request value) and produces a [`Reply`]
//! or an [`Error`]. Middleware wraps endpoints, transports decode into and
//! encode out of them, and none of those layers needs to know the concrete
//! request or response types.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Service, ServiceExt};

use crate::context::RequestContext;
use crate::error::Error;

/// Boxed, sendable future used at every type-erased seam.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// An opaque request or response value.
///
/// Implemented for every `Debug + Send + Sync + 'static` type.
pub trait Payload: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + fmt::Debug + Send + Sync> Payload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Returned when a payload does not have the type an endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unexpected payload type: expected {expected}, got {actual}")]
pub struct PayloadMismatch {
    pub expected: &'static str,
    pub actual: &'static str,
}

impl crate::error::Classify for PayloadMismatch {}

// ---------------------------------------------------------------------------
// Call / Reply
// ---------------------------------------------------------------------------

/// The input to an endpoint.
///
/// The request value is shared so the call can be cloned and replayed by
/// middleware such as retry.
#[derive(Debug, Clone)]
pub struct Call {
    pub ctx: RequestContext,
    pub request: Arc<dyn Payload>,
}

impl Call {
    pub fn new<T: Payload>(ctx: RequestContext, request: T) -> Self {
        Self {
            ctx,
            request: Arc::new(request),
        }
    }

    /// Borrows the request as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadMismatch`] if the request has another type.
    pub fn request<T: Payload>(&self) -> Result<&T, PayloadMismatch> {
        (*self.request)
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| PayloadMismatch {
                expected: std::any::type_name::<T>(),
                actual: (*self.request).type_name(),
            })
    }
}

/// The output of an endpoint.
#[derive(Debug)]
pub struct Reply(Box<dyn Payload>);

impl Reply {
    pub fn new<T: Payload>(response: T) -> Self {
        Self(Box::new(response))
    }

    /// Borrows the response as `T`, if it has that type.
    #[must_use]
    pub fn downcast_ref<T: Payload>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    /// Takes the response as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadMismatch`] if the response has another type.
    pub fn downcast<T: Payload>(self) -> Result<T, PayloadMismatch> {
        let actual = (*self.0).type_name();
        self.0
            .into_any()
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| PayloadMismatch {
                expected: std::any::type_name::<T>(),
                actual,
            })
    }

    /// The concrete type name of the response.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        (*self.0).type_name()
    }

    /// Borrows the response as a payload.
    #[must_use]
    pub fn payload(&self) -> &dyn Payload {
        &*self.0
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

type EndpointFn = dyn Fn(Call) -> BoxFuture<Result<Reply, Error>> + Send + Sync;

/// A cloneable, type-erased asynchronous operation.
///
/// Implements `tower::Service<Call>`, so any tower `Layer` whose output
/// satisfies the same bounds can wrap it.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointFn>,
}

impl Endpoint {
    /// Creates an endpoint from an async closure over raw calls.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |call| -> BoxFuture<Result<Reply, Error>> { Box::pin(f(call)) }),
        }
    }

    /// Creates an endpoint from a typed handler.
    ///
    /// The request is downcast to `Req` (a mismatch is a terminal error) and
    /// the response is boxed as the reply.
    pub fn typed<Req, Resp, F, Fut>(handler: F) -> Self
    where
        Req: Payload + Clone,
        Resp: Payload,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(move |call: Call| {
            let handler = Arc::clone(&handler);
            async move {
                let request = call.request::<Req>()?.clone();
                let response = handler(call.ctx, request).await?;
                Ok::<_, Error>(Reply::new(response))
            }
        })
    }

    /// Adapts any cloneable tower service over calls.
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<Call, Response = Reply, Error = Error> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Self::new(move |call| {
            let service = service.clone();
            async move { service.oneshot(call).await }
        })
    }

    /// Invokes the endpoint.
    pub fn call(&self, call: Call) -> BoxFuture<Result<Reply, Error>> {
        (self.inner)(call)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

impl Service<Call> for Endpoint {
    type Response = Reply;
    type Error = Error;
    type Future = BoxFuture<Result<Reply, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        Endpoint::call(self, call)
    }
}
