use super::state::AppState;
use crate::session::{AgentState, AgentStatus, SessionStats};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub status: AgentState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SessionStats>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn agent_unavailable(action: &str, e: anyhow::Error) -> axum::response::Response {
    error!("Failed to {} agent: {}", action, e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: format!("Failed to {} agent: {}", action, e),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /agent/start
/// Start a session; repeated starts leave the running session alone
pub async fn start_agent(State(state): State<AppState>) -> impl IntoResponse {
    let was_running = state.agent.state() == AgentState::Running;

    match state.agent.start().await {
        Ok(AgentStatus { status, stats }) => {
            let message = if was_running {
                "Agent already running".to_string()
            } else {
                info!("Agent started via HTTP");
                "Agent started".to_string()
            };
            (StatusCode::OK, Json(ControlResponse { status, message, stats })).into_response()
        }
        Err(e) => agent_unavailable("start", e),
    }
}

/// POST /agent/stop
/// Stop the running session; stopping while stopped is harmless
pub async fn stop_agent(State(state): State<AppState>) -> impl IntoResponse {
    match state.agent.stop().await {
        Ok(AgentStatus { status, stats }) => {
            info!("Agent stopped via HTTP");
            (
                StatusCode::OK,
                Json(ControlResponse {
                    status,
                    message: "Agent stopped".to_string(),
                    stats,
                }),
            )
                .into_response()
        }
        Err(e) => agent_unavailable("stop", e),
    }
}

/// GET /agent/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.agent.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => agent_unavailable("query", e),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
