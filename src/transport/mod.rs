//! Bidirectional audio transport
//!
//! One binary-framed connection per session. Outbound chunks are written in
//! the order they are sent; inbound binary frames are handed to the
//! registered receive handler in wire order. Text frames are diagnostic
//! only and are logged, never forwarded.

mod client;
mod state;

pub use client::{WebSocketConnection, WebSocketConnector};
pub use state::{ConnectionState, SharedState};

use crate::audio::AudioChunk;
use crate::error::AgentError;

/// Callback invoked once per inbound binary frame
pub type ReceiveHandler = Box<dyn FnMut(AudioChunk) + Send + 'static>;

/// An open connection to the agent server
pub trait Connection: Send {
    /// Queue a chunk for transmission.
    ///
    /// Returns false when the chunk was dropped because the connection is
    /// not open. Nothing is buffered for later delivery.
    fn send(&mut self, chunk: AudioChunk) -> bool;

    /// Register the handler for inbound audio, replacing any previous one
    fn on_receive(&mut self, handler: ReceiveHandler);

    /// Close the connection, discarding anything in flight. Idempotent.
    fn close(&mut self);

    fn state(&self) -> ConnectionState;
}

/// Establishes connections to an endpoint
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Fails with [`AgentError::Connection`] when the endpoint is
    /// unreachable or rejects the handshake. No retry.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, AgentError>;
}
