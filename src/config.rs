use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::ChunkFormat;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-agent".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket endpoint of the voice agent server
    pub endpoint: String,
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSourceKind {
    Microphone,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSourceKind,
    /// WAV file replayed as the microphone when `source = "file"`
    pub input_file: Option<String>,
    pub loop_input: bool,
    /// Length of each outbound chunk
    pub interval_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: ChunkFormat,
    /// Preferred input device name (cpal only)
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSourceKind::Microphone,
            input_file: None,
            loop_input: false,
            interval_ms: 200,
            sample_rate: 16000,
            channels: 1,
            format: ChunkFormat::Opus,
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Container/codec of inbound audio chunks
    pub mime_type: String,
    /// Render received audio into this WAV file instead of the speaker
    pub output_file: Option<String>,
    /// Stream parameters for raw PCM inbound audio
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mime_type: ChunkFormat::Opus.mime_type().to_string(),
            output_file: None,
            sample_rate: 16000,
            channels: 1,
        }
    }
}

impl Config {
    /// Load defaults, then the optional config file, then `VOICE_AGENT__*`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("VOICE_AGENT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_client() {
        let cfg = Config::default();
        assert_eq!(cfg.server.endpoint, "ws://localhost:8000/ws");
        assert_eq!(cfg.capture.interval_ms, 200);
        assert_eq!(cfg.capture.source, CaptureSourceKind::Microphone);
        assert_eq!(cfg.capture.format, ChunkFormat::Opus);
        assert_eq!(cfg.playback.mime_type, "audio/webm; codecs=opus");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load("does/not/exist/voice-agent").unwrap();
        assert_eq!(cfg.service.http.port, 3030);
        assert!(cfg.service.http.enabled);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
[server]
endpoint = "ws://example.test:9000/ws"

[capture]
source = "file"
input_file = "in.wav"
format = "pcm"
"#,
        )
        .unwrap();

        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.server.endpoint, "ws://example.test:9000/ws");
        assert_eq!(cfg.server.connect_timeout_ms, 5000);
        assert_eq!(cfg.capture.source, CaptureSourceKind::File);
        assert_eq!(cfg.capture.input_file.as_deref(), Some("in.wav"));
        assert_eq!(cfg.capture.format, ChunkFormat::Pcm);
        assert_eq!(cfg.capture.interval_ms, 200);
    }
}
