//! API route definitions

use super::handlers::{self, PubSubState};
use super::ws_handlers;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: PubSubState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Change events from the host request pipeline
        .route("/internal/events", post(handlers::ingest_event))
        // ====================================================================
        // WebSocket (real-time change events)
        // ====================================================================
        .route("/ws", get(ws_handlers::ws_events))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
