//! Trellis server: resilient endpoint middleware, the HTTP transport, and
//! the lifecycle manager that runs transports until shutdown.

pub mod lifecycle;
pub mod network;
pub mod service;

pub use lifecycle::{Server, ServerBuilder, ServerConfig, ServerError};
pub use network::{HttpConfig, HttpEndpoint, HttpTransport};
pub use service::{build_resilient_chain, Breaker, BreakerConfig, LogLayer, RetryLayer};
