//! Session management
//!
//! This module wires the three per-session components together:
//! - `CaptureSession`: microphone (or file) input encoded into timed chunks
//! - the transport connection carrying chunks both ways
//! - `PlaybackSession`: inbound chunks appended to a decoding buffer
//!
//! `Agent` owns them for the lifetime of one start/stop session.

mod agent;
mod capture;
mod config;
mod factory;
mod playback;
mod stats;

pub use agent::{Agent, AgentHandle, AgentState, AgentStatus};
pub use capture::CaptureSession;
pub use config::SessionConfig;
pub use factory::{PlatformFactory, SessionFactory};
pub use playback::{AppendOutcome, DecodingBuffer, MediaBuffer, PlaybackSession};
pub use stats::SessionStats;
