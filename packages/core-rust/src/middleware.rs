//! Ordered middleware composition over [`Endpoint`]s.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tower::{Layer, Service};

use crate::endpoint::{Call, Endpoint, Reply};
use crate::error::Error;

type Wrap = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// An ordered list of endpoint decorators.
///
/// The first middleware added is the outermost: with `[A, B, C]`, a call
/// passes through A, then B, then C, then the endpoint. The chain is built
/// before the server runs and is only ever read afterwards.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Wrap>,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tower layer. It wraps every layer added after it.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<Endpoint> + Send + Sync + 'static,
        L::Service: Service<Call, Response = Reply, Error = Error> + Clone + Send + Sync + 'static,
        <L::Service as Service<Call>>::Future: Send + 'static,
    {
        self.push(layer);
        self
    }

    /// In-place variant of [`MiddlewareChain::layer`].
    pub fn push<L>(&mut self, layer: L)
    where
        L: Layer<Endpoint> + Send + Sync + 'static,
        L::Service: Service<Call, Response = Reply, Error = Error> + Clone + Send + Sync + 'static,
        <L::Service as Service<Call>>::Future: Send + 'static,
    {
        self.layers
            .push(Arc::new(move |inner| Endpoint::from_service(layer.layer(inner))));
    }

    /// Appends a middleware written as an async function of the call and the next endpoint.
    #[must_use]
    pub fn wrap_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Call, Endpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.layers.push(Arc::new(move |next: Endpoint| {
            let f = Arc::clone(&f);
            Endpoint::new(move |call| f(call, next.clone()))
        }));
        self
    }

    /// Wraps `endpoint` with every middleware in the chain.
    #[must_use]
    pub fn apply(&self, endpoint: Endpoint) -> Endpoint {
        self.layers
            .iter()
            .rev()
            .fold(endpoint, |inner, wrap| wrap(inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.layers.len())
            .finish()
    }
}
