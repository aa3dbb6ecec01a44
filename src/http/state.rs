use crate::session::AgentHandle;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Control handle of the single agent
    pub agent: AgentHandle,
}

impl AppState {
    pub fn new(agent: AgentHandle) -> Self {
        Self { agent }
    }
}
