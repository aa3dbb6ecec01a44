//! HTTP control API
//!
//! The start/stop toggle and status readout over HTTP:
//! - POST /agent/start - Start a session (no-op while running)
//! - POST /agent/stop - Stop the session (no-op while stopped)
//! - GET /agent/status - Current state and session stats
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
