use thiserror::Error;

/// Failures reported by the capture, transport and playback components.
///
/// None of these change the agent's running/stopped state. They are logged
/// where they happen and the user recovers by stopping and starting again.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The capture device was denied, missing or could not be opened
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The connection could not be established or dropped unexpectedly
    #[error("connection error: {0}")]
    Connection(String),

    /// The playback buffer rejected a chunk
    #[error("playback buffer rejected chunk: {0}")]
    BufferAppend(String),

    /// Capture sessions produce one live sequence and cannot be restarted
    #[error("capture session already started")]
    AlreadyStarted,
}

impl AgentError {
    pub fn device(reason: impl std::fmt::Display) -> Self {
        Self::DeviceUnavailable(reason.to_string())
    }

    pub fn connection(reason: impl std::fmt::Display) -> Self {
        Self::Connection(reason.to_string())
    }

    pub fn buffer(reason: impl std::fmt::Display) -> Self {
        Self::BufferAppend(reason.to_string())
    }
}
