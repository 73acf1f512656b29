//! Health check HTTP route handlers
//!
//! Provides endpoints for checking that the relay is up:
//! - `GET /health` - Simple liveness check (returns 200 OK)
//! - `GET /health/live` - Kubernetes-style liveness probe
//! - `GET /health/ready` - Readiness check with registry statistics

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::websocket::SessionRegistry;

/// Shared application state for health check handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<SessionRegistry>,
}

impl HealthState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

/// Readiness response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Sessions currently tracked, including ones without a primary
    pub sessions: usize,
    pub connected_primaries: usize,
}

/// Create health check router
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(simple_health))
        .route("/live", get(liveness_probe))
        .route("/ready", get(readiness_probe))
        .with_state(state)
}

/// Simple health check - always returns OK if the server is running
async fn simple_health() -> &'static str {
    "OK"
}

/// Liveness probe for Kubernetes
///
/// Returns 200 if the server process is running and can handle requests.
async fn liveness_probe() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness probe
///
/// The relay has no external dependencies, so it is ready whenever it is
/// serving; the body reports how busy the registry is.
async fn readiness_probe(State(state): State<HealthState>) -> impl IntoResponse {
    Json(ReadinessResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.session_count(),
        connected_primaries: state.registry.connected_primaries(),
    })
}
