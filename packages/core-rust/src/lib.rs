//! Trellis core: error classification, status mapping, and the endpoint,
//! middleware, and transport contracts shared by every transport.

pub mod context;
pub mod endpoint;
pub mod error;
pub mod middleware;
pub mod status;
pub mod transport;

pub use context::{LogContext, LogKey, RequestContext, UnknownLogKey};
pub use endpoint::{BoxFuture, Call, Endpoint, Payload, PayloadMismatch, Reply};
pub use error::{mark_retryable, Classification, Classify, Error, ResultExt, MAX_CAUSE_DEPTH};
pub use middleware::MiddlewareChain;
pub use status::{classify_status, status_code_of, StatusError};
pub use transport::Transport;
