//! Built-in HTTP handlers: health probes and the debug status page.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod health;

pub use health::{debug_status_handler, default_healthcheck, readiness_handler};

use std::sync::Arc;

use super::{HttpConfig, ShutdownController};

/// Shared state passed to the built-in handlers via `State` extraction.
///
/// Holds `Arc` references so cloning is cheap.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Health state and in-flight tracking of the transport.
    pub shutdown: Arc<ShutdownController>,
    /// The transport configuration.
    pub config: Arc<HttpConfig>,
    /// Number of (method, path) routes bound from registered endpoints.
    pub routes: usize,
}
