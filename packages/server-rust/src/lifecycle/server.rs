//! Lifecycle manager: runs transports until the first stop trigger, then
//! shuts everything down exactly once.
//!
//! ```text
//! Configured --run--> Running --signal | cancel | start error--> ShuttingDown --> Stopped
//! ```
//!
//! Shutdown order is fixed: hooks in registration order, then every
//! transport's `shutdown` concurrently under one deadline, then the start
//! tasks are cancelled and awaited.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{error, info, warn};
use trellis_core::{Call, Endpoint, Error, LogContext, LogKey, MiddlewareChain, Reply, Transport};

use super::signals::terminate_signal;

/// Extra time a transport gets past the shutdown deadline before it is abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A synchronous, infallible callback run once when shutdown begins.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// Lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Deadline shared by all transport shutdowns.
    pub shutdown_timeout: Duration,
    /// Treat SIGINT and SIGTERM like cancellation.
    pub handle_signals: bool,
    /// Request metadata bound into every request's log span.
    pub log_keys: Vec<LogKey>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            handle_signals: true,
            log_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, `run` not called yet.
    Configured,
    /// Endpoints registered; transports starting or serving.
    Running,
    /// A stop trigger fired; hooks and transport shutdowns in progress.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Read-only view of a server's lifecycle state, usable after `run` consumed it.
#[derive(Debug, Clone)]
pub struct LifecycleHandle(Arc<ArcSwap<LifecycleState>>);

impl LifecycleHandle {
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.0.load()
    }

    fn set(&self, state: LifecycleState) {
        info!(state = state.as_str(), "lifecycle transition");
        self.0.store(Arc::new(state));
    }
}

/// Why `Server::run` failed.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("registering endpoints on the {transport} transport: {source:#}")]
    Register {
        transport: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{transport} transport failed: {source:#}")]
    Start {
        transport: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("shutting down the {transport} transport: {source:#}")]
    Shutdown {
        transport: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{transport} transport did not shut down within {timeout:?}")]
    ShutdownTimeout {
        transport: &'static str,
        timeout: Duration,
    },
}

// ---------------------------------------------------------------------------
// ServerBuilder
// ---------------------------------------------------------------------------

/// Collects transports, middleware, and hooks into a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    transports: Vec<Box<dyn Transport>>,
    chain: MiddlewareChain,
    hooks: Vec<ShutdownHook>,
}

impl ServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Replaces the middleware chain applied to every endpoint of every transport.
    #[must_use]
    pub fn middleware(mut self, chain: MiddlewareChain) -> Self {
        self.chain = chain;
        self
    }

    /// Appends a layer to the middleware chain. The first layer added is the outermost.
    #[must_use]
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<Endpoint> + Send + Sync + 'static,
        L::Service: Service<Call, Response = Reply, Error = Error> + Clone + Send + Sync + 'static,
        <L::Service as Service<Call>>::Future: Send + 'static,
    {
        self.chain.push(layer);
        self
    }

    /// Registers a hook run once, in registration order, before transports shut down.
    #[must_use]
    pub fn shutdown_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    #[must_use]
    pub fn log_keys(mut self, keys: impl IntoIterator<Item = LogKey>) -> Self {
        self.config.log_keys = keys.into_iter().collect();
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            transports: self.transports,
            chain: self.chain,
            hooks: self.hooks,
            state: LifecycleHandle(Arc::new(ArcSwap::from_pointee(LifecycleState::Configured))),
        }
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("transports", &self.transports.len())
            .field("chain", &self.chain)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A configured set of transports, ready to run once.
pub struct Server {
    config: ServerConfig,
    transports: Vec<Box<dyn Transport>>,
    chain: MiddlewareChain,
    hooks: Vec<ShutdownHook>,
    state: LifecycleHandle,
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    #[must_use]
    pub fn state_handle(&self) -> LifecycleHandle {
        self.state.clone()
    }

    /// Registers endpoints, starts every transport, and blocks until shutdown completes.
    ///
    /// Shutdown begins on the first of: SIGINT/SIGTERM (when enabled),
    /// `cancel` firing, or any transport's `start` failing. Later triggers
    /// are absorbed.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Register`] if any transport rejects its endpoints; nothing is started
    /// - [`ServerError::Start`] for the first transport that failed while running
    /// - otherwise the first [`ServerError::Shutdown`] or [`ServerError::ShutdownTimeout`]
    ///
    /// A clean stop by signal or cancellation returns `Ok(())`.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let Server {
            config,
            mut transports,
            chain,
            hooks,
            state,
        } = self;
        let logging = LogContext::new(config.log_keys.iter().copied());

        for transport in &mut transports {
            let name = transport.name();
            if let Err(source) = transport.register_endpoints(&chain, &logging).await {
                error!(transport = name, error = %format!("{source:#}"), "endpoint registration failed");
                state.set(LifecycleState::Stopped);
                return Err(ServerError::Register {
                    transport: name,
                    source,
                });
            }
        }

        let transports: Vec<Arc<dyn Transport>> = transports.into_iter().map(Arc::from).collect();
        state.set(LifecycleState::Running);

        let run_token = cancel.child_token();
        // One slot: the first start failure wins, later ones are dropped without blocking.
        let (stop_tx, mut stop_rx) = mpsc::channel::<ServerError>(1);
        let tasks: Vec<_> = transports
            .iter()
            .map(|transport| {
                let transport = Arc::clone(transport);
                let token = run_token.clone();
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    let name = transport.name();
                    match transport.start(token).await {
                        Ok(()) => info!(transport = name, "transport stopped"),
                        Err(source) => {
                            error!(transport = name, error = %format!("{source:#}"), "transport failed");
                            if stop_tx
                                .try_send(ServerError::Start {
                                    transport: name,
                                    source,
                                })
                                .is_err()
                            {
                                warn!(transport = name, "shutdown already triggered; failure absorbed");
                            }
                        }
                    }
                })
            })
            .collect();
        drop(stop_tx);

        let signal = async {
            if config.handle_signals {
                terminate_signal().await
            } else {
                std::future::pending().await
            }
        };

        let trigger = tokio::select! {
            name = signal => {
                info!(signal = name, "shutting down on signal");
                None
            }
            () = cancel.cancelled() => {
                info!("shutting down on cancellation");
                None
            }
            Some(err) = stop_rx.recv() => Some(err),
        };
        state.set(LifecycleState::ShuttingDown);

        for hook in hooks {
            hook();
        }

        let shutdown_errors = shutdown_all(&transports, config.shutdown_timeout).await;

        run_token.cancel();
        let aborts: Vec<_> = tasks.iter().map(tokio::task::JoinHandle::abort_handle).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks))
            .await
            .is_err()
        {
            warn!(grace = ?SHUTDOWN_GRACE, "transports still starting after shutdown; aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        state.set(LifecycleState::Stopped);
        match trigger.or_else(|| shutdown_errors.into_iter().next()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shuts down every transport concurrently; they share one deadline token.
async fn shutdown_all(transports: &[Arc<dyn Transport>], timeout: Duration) -> Vec<ServerError> {
    let deadline = CancellationToken::new();
    let timer = tokio::spawn({
        let deadline = deadline.clone();
        async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        }
    });

    let results = join_all(transports.iter().map(|transport| {
        let deadline = deadline.clone();
        async move {
            let name = transport.name();
            let limit = timeout.saturating_add(SHUTDOWN_GRACE);
            match tokio::time::timeout(limit, transport.shutdown(deadline)).await {
                Ok(Ok(())) => {
                    info!(transport = name, "transport shut down");
                    Ok(())
                }
                Ok(Err(source)) => {
                    error!(transport = name, error = %format!("{source:#}"), "transport shutdown failed");
                    Err(ServerError::Shutdown {
                        transport: name,
                        source,
                    })
                }
                Err(_) => {
                    error!(transport = name, ?timeout, "transport shutdown timed out");
                    Err(ServerError::ShutdownTimeout {
                        transport: name,
                        timeout,
                    })
                }
            }
        }
    }))
    .await;
    timer.abort();

    results.into_iter().filter_map(Result::err).collect()
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("transports", &self.transports.len())
            .field("hooks", &self.hooks.len())
            .field("state", &self.state.state())
            .finish_non_exhaustive()
    }
}
