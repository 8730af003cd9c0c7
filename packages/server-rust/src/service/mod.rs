//! Endpoint resilience: circuit breaking and the middleware layers built on it.
//!
//! 1. **Breaker** (`breaker`): consecutive-failure circuit breaker and its admission contract
//! 2. **Middleware** (`middleware`): Tower layers over `Endpoint` (retry, circuit breaker, logging)

pub mod breaker;
pub mod middleware;

pub use breaker::{
    Breaker, BreakerConfig, BreakerRejection, BreakerState, CallOutcome, CircuitBreaker, Permit,
    Ticket,
};
pub use middleware::{
    build_resilient_chain, CircuitBreakerLayer, ExponentialBackoff, FixedBackoff, LogLayer,
    RetriesExhausted, RetryLayer,
};
