//! HTTP transport: serves registered endpoints, health probes, and the debug page.
//!
//! Follows the deferred startup pattern: `new()` only stores configuration,
//! `register_endpoints()` assembles the router, `bind()` (optional) binds the
//! listener, and `start()` serves until stopped. `shutdown()` stops accepting
//! connections and drains in-flight requests within the caller's deadline.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Request};
use axum::handler::Handler;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::Route;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{info, warn};
use trellis_core::{LogContext, MiddlewareChain, Payload, Transport};

use super::config::HttpConfig;
use super::endpoint::{into_handler, HttpEndpoint, HttpHandler};
use super::handlers::{debug_status_handler, default_healthcheck, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::registry::EndpointRegistry;
use super::router::{MethodRouterTable, Router};
use super::shutdown::ShutdownController;

/// Path of the debug status page served when `enable_debug` is set.
pub const DEBUG_STATUS_PATH: &str = "/debug/status";

type AppLayer = Arc<dyn Fn(axum::Router) -> axum::Router + Send + Sync>;

/// Hosts [`HttpEndpoint`]s on an axum server.
pub struct HttpTransport {
    config: Arc<HttpConfig>,
    registry: EndpointRegistry,
    router: Mutex<Option<Box<dyn Router>>>,
    layers: Vec<AppLayer>,
    liveness: Option<HttpHandler>,
    readiness: Option<HttpHandler>,
    not_found: Option<HttpHandler>,
    shutdown: Arc<ShutdownController>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    app: Mutex<Option<axum::Router>>,
    /// Fired by `shutdown()`; stops accepting connections.
    stop: CancellationToken,
    /// Parent of every request token; fired when draining gives up.
    requests: CancellationToken,
}

impl HttpTransport {
    /// Creates a transport without binding any port.
    ///
    /// The configuration is used as given; port 0 binds an OS-assigned port.
    /// Use [`HttpConfig::merged_with_defaults`] for partial configurations.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: EndpointRegistry::new(),
            router: Mutex::new(Some(Box::new(MethodRouterTable::new()))),
            layers: Vec::new(),
            liveness: None,
            readiness: None,
            not_found: None,
            shutdown: Arc::new(ShutdownController::new()),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            app: Mutex::new(None),
            stop: CancellationToken::new(),
            requests: CancellationToken::new(),
        }
    }

    /// Adds an endpoint.
    #[must_use]
    pub fn endpoint<Req: Payload, Resp: Payload>(mut self, endpoint: HttpEndpoint<Req, Resp>) -> Self {
        self.registry.add(endpoint);
        self
    }

    /// Mutable access to the endpoint registry.
    pub fn registry_mut(&mut self) -> &mut EndpointRegistry {
        &mut self.registry
    }

    /// Wraps every route (endpoints, probes, debug page) with a tower layer.
    ///
    /// The first layer added is the outermost. All of them run inside the
    /// request-id, trace, and timeout layers.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<std::convert::Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.layers
            .push(Arc::new(move |router: axum::Router| router.layer(layer.clone())));
        self
    }

    /// Replaces the liveness probe handler.
    #[must_use]
    pub fn liveness<H, T>(mut self, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.liveness = Some(into_handler(handler.with_state(())));
        self
    }

    /// Replaces the readiness probe handler.
    #[must_use]
    pub fn readiness<H, T>(mut self, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.readiness = Some(into_handler(handler.with_state(())));
        self
    }

    /// Handler for requests matching no route. Without one, axum answers 404.
    #[must_use]
    pub fn not_found<H, T>(mut self, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.not_found = Some(into_handler(handler.with_state(())));
        self
    }

    /// Replaces the route table.
    #[must_use]
    pub fn router(self, router: impl Router + 'static) -> Self {
        *self.router.lock() = Some(Box::new(router));
        self
    }

    #[must_use]
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Health state and in-flight tracking of this transport.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// The bound address, once `bind()` or `start()` has bound the listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listener ahead of `start()`.
    ///
    /// Returns the actual address, which differs from the configured one
    /// when port 0 asks for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&self) -> anyhow::Result<SocketAddr> {
        let listener = bind_listener(&self.config).await?;
        let addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(addr);
        Ok(addr)
    }
}

async fn bind_listener(config: &HttpConfig) -> anyhow::Result<TcpListener> {
    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding HTTP listener to {addr}"))?;
    info!(addr = %listener.local_addr()?, "HTTP listener bound");
    Ok(listener)
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn register_endpoints(
        &mut self,
        chain: &MiddlewareChain,
        logging: &LogContext,
    ) -> anyhow::Result<()> {
        let mut router = self
            .router
            .get_mut()
            .take()
            .ok_or_else(|| anyhow!("HTTP endpoints are already registered"))?;
        let config = Arc::clone(&self.config);

        for bound in self.registry.build(chain, logging, &self.requests)? {
            router.handle(&bound.methods, &bound.paths, bound.handler)?;
        }

        let state = AppState {
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&config),
            routes: router.route_count(),
        };
        let liveness = self
            .liveness
            .take()
            .unwrap_or_else(|| into_handler(default_healthcheck.with_state(())));
        let readiness = self
            .readiness
            .take()
            .unwrap_or_else(|| into_handler(readiness_handler.with_state(state.clone())));
        router
            .handle(&[Method::GET], &[config.liveness_path.clone()], liveness)
            .context("registering liveness probe")?;
        router
            .handle(&[Method::GET], &[config.readiness_path.clone()], readiness)
            .context("registering readiness probe")?;
        if config.enable_debug {
            router.handle(
                &[Method::GET],
                &[DEBUG_STATUS_PATH.to_string()],
                into_handler(debug_status_handler.with_state(state)),
            )?;
        }
        if let Some(not_found) = self.not_found.take() {
            router.set_not_found(not_found);
        }

        let routes = router.route_count();
        let mut app = router
            .into_axum()
            .layer(DefaultBodyLimit::max(config.max_body_bytes));
        for layer in self.layers.iter().rev() {
            app = layer(app);
        }
        let app = app.layer(build_http_layers(&config, Arc::clone(&self.shutdown)));

        *self.app.get_mut() = Some(app);
        info!(routes, endpoints = self.registry.len(), "HTTP endpoints registered");
        Ok(())
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let app = self
            .app
            .lock()
            .take()
            .ok_or_else(|| anyhow!("HTTP transport started before endpoints were registered"))?;

        let pre_bound = self.listener.lock().take();
        let listener = match pre_bound {
            Some(listener) => listener,
            None => bind_listener(&self.config).await?,
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        self.shutdown.set_ready();
        info!(%addr, "HTTP transport serving");

        let stop = self.stop.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = stop.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

        info!(%addr, "HTTP transport stopped serving");
        Ok(())
    }

    async fn shutdown(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.shutdown.begin_drain();
        self.stop.cancel();

        if self.shutdown.wait_for_drain(&cancel).await {
            info!("HTTP transport drained");
            return Ok(());
        }

        let remaining = self.shutdown.in_flight_count();
        self.requests.cancel();
        warn!(remaining, "HTTP drain deadline passed; cancelling in-flight requests");
        bail!("HTTP transport shut down with {remaining} requests still in flight")
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("layers", &self.layers.len())
            .field("health", &self.shutdown.health_state())
            .finish_non_exhaustive()
    }
}
