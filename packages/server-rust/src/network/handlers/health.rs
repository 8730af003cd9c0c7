//! Health probe and debug status handlers.
//!
//! Both probes answer `200 OK` with an `"OK"` body by default. The readiness
//! probe additionally reports 503 whenever the transport is not serving, so
//! orchestrators stop routing traffic to a draining instance.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Default liveness probe: always `200 OK` with body `"OK"`.
pub async fn default_healthcheck() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Default readiness probe: `200 OK` while ready, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shutdown.health_state() == HealthState::Ready {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

/// Runtime status as JSON, served at `GET /debug/status` when debugging is enabled.
pub async fn debug_status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.shutdown.uptime().as_secs(),
        "routes": state.routes,
        "request_timeout_secs": state.config.request_timeout.as_secs(),
        "max_body_bytes": state.config.max_body_bytes,
    }))
}
