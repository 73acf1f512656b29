//! Tandem relay
//!
//! Pairs a media player (the primary) with any number of remote controls
//! (observers) over WebSocket. The player's state is mirrored to every
//! remote, and remote commands are forwarded to the player.

pub mod clock;
pub mod config;
pub mod error;
pub mod routes;
pub mod websocket;

pub use error::{RelayError, RelayResult};

use axum::{extract::Extension, routing::get, Router};
use tower_http::trace::TraceLayer;

use routes::{health_router, HealthState};
use websocket::{ws_handler, RelayContext};

/// Build the HTTP router: `/`, `/ws` and the `/health` routes
pub fn build_router(context: RelayContext) -> Router {
    let health_state = HealthState::new(context.registry.clone());

    Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_handler))
        // Nested health routes: /health, /health/live, /health/ready
        .nest("/health", health_router(health_state))
        .layer(Extension(context))
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    "Tandem relay"
}
