use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Toggle
        .route("/agent/start", post(handlers::start_agent))
        .route("/agent/stop", post(handlers::stop_agent))
        // Status readout
        .route("/agent/status", get(handlers::get_status))
        // Allow a browser page to drive the toggle
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
