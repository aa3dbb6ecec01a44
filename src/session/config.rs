use std::time::Duration;

use crate::audio::{ChunkConfig, DeviceConstraints};
use crate::config::{Config, DEFAULT_ENDPOINT};

/// Configuration for one start/stop session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server endpoint, e.g. "ws://localhost:8000/ws"
    pub endpoint: String,

    /// Options passed to the capture device
    pub constraints: DeviceConstraints,

    /// Outbound chunk interval and container
    pub chunk: ChunkConfig,

    /// Upper bound on the connection handshake
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            constraints: DeviceConstraints::default(),
            chunk: ChunkConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            endpoint: cfg.server.endpoint.clone(),
            constraints: DeviceConstraints {
                audio: true,
                device_name: cfg.capture.device_name.clone(),
            },
            chunk: ChunkConfig {
                interval_ms: cfg.capture.interval_ms,
                format: cfg.capture.format,
            },
            connect_timeout: Duration::from_millis(cfg.server.connect_timeout_ms),
        }
    }
}
