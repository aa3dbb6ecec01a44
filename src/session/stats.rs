use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for a single start/stop session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// When the session was stopped, if it has been
    pub stopped_at: Option<DateTime<Utc>>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Non-empty chunks produced by capture
    pub chunks_captured: u64,

    /// Chunks handed to an open connection
    pub chunks_sent: u64,

    /// Chunks dropped because no connection was open
    pub chunks_dropped: u64,

    /// Binary frames received from the server
    pub frames_received: u64,

    /// Frames accepted by the playback buffer
    pub frames_appended: u64,

    /// Frames dropped because the playback buffer was busy
    pub frames_dropped_busy: u64,

    /// Frames rejected by the playback buffer or arriving without playback
    pub frames_rejected: u64,
}

impl SessionStats {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            stopped_at: None,
            duration_secs: 0.0,
            chunks_captured: 0,
            chunks_sent: 0,
            chunks_dropped: 0,
            frames_received: 0,
            frames_appended: 0,
            frames_dropped_busy: 0,
            frames_rejected: 0,
        }
    }

    /// Copy with the duration brought up to date
    pub fn snapshot(&self) -> Self {
        let mut stats = self.clone();
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        stats.duration_secs = end.signed_duration_since(self.started_at).num_milliseconds() as f64 / 1000.0;
        stats
    }

    pub fn finish(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
            *self = self.snapshot();
        }
    }
}
