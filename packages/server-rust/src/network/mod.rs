//! HTTP transport: endpoints, routing, probes, middleware, and shutdown control.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod handlers;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod transport;

pub use client::{ClientError, HttpClient};
pub use config::HttpConfig;
pub use endpoint::{
    decode_json, decode_nothing, encode_error, encode_json, encode_json_with_status, into_handler,
    DecodeError, HttpEndpoint, HttpHandler, RequestHead, StatusResponse,
};
pub use handlers::AppState;
pub use middleware::build_http_layers;
pub use registry::{BoundHandler, EndpointRegistry, RegistryError};
pub use router::{MethodRouterTable, RouteError, Router};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use transport::{HttpTransport, DEBUG_STATUS_PATH};
