//! Process lifecycle: start transports, wait for a stop trigger, shut down once.
//!
//! - `server`: `ServerBuilder`, `Server::run`, and the lifecycle state machine
//! - `signals`: SIGINT/SIGTERM as a cancellation source

pub mod server;
pub mod signals;

pub use server::{
    LifecycleHandle, LifecycleState, Server, ServerBuilder, ServerConfig, ServerError, ShutdownHook,
};
pub use signals::terminate_signal;
