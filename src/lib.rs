pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendConfig, AudioBackendFactory, AudioChunk, AudioFile, AudioFrame, AudioSource,
    CaptureDevice, ChunkConfig, ChunkEncoder, ChunkFormat, DeviceConstraints, OutputSink,
    StreamFormat,
};
pub use config::Config;
pub use error::AgentError;
pub use http::{create_router, AppState};
pub use session::{
    Agent, AgentHandle, AgentState, AgentStatus, AppendOutcome, CaptureSession, MediaBuffer,
    PlatformFactory, PlaybackSession, SessionConfig, SessionFactory, SessionStats,
};
pub use transport::{Connection, ConnectionState, Connector, WebSocketConnector};
