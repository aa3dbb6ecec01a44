use std::time::Duration;

use super::playback::{DecodingBuffer, MediaBuffer};
use crate::audio::{
    AudioBackendConfig, AudioBackendFactory, AudioSource, CaptureDevice, OutputSink,
    StreamFormat, WavFileSink,
};
use crate::config::{CaptureSourceKind, Config};
use crate::error::AgentError;
use crate::transport::{Connection, Connector, WebSocketConnector};

/// Builds the three per-session components
///
/// Called once per start; every session gets fresh, exclusively owned
/// handles.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    fn capture_device(&self) -> Result<Box<dyn CaptureDevice>, AgentError>;

    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, AgentError>;

    fn media_buffer(&self) -> Result<Box<dyn MediaBuffer>, AgentError>;
}

/// Factory backed by real devices, files and WebSockets, per configuration
pub struct PlatformFactory {
    config: Config,
    connector: WebSocketConnector,
}

impl PlatformFactory {
    pub fn new(config: Config) -> Self {
        let connector =
            WebSocketConnector::new(Duration::from_millis(config.server.connect_timeout_ms));
        Self { config, connector }
    }

    fn output_sink(&self) -> Box<dyn OutputSink> {
        if let Some(path) = &self.config.playback.output_file {
            return Box::new(WavFileSink::new(path));
        }

        #[cfg(feature = "device")]
        {
            Box::new(crate::audio::SpeakerSink::new())
        }

        #[cfg(not(feature = "device"))]
        {
            tracing::warn!("No playback output configured; received audio will be discarded");
            Box::new(crate::audio::NullSink::default())
        }
    }
}

#[async_trait::async_trait]
impl SessionFactory for PlatformFactory {
    fn capture_device(&self) -> Result<Box<dyn CaptureDevice>, AgentError> {
        let capture = &self.config.capture;

        let source = match capture.source {
            CaptureSourceKind::Microphone => AudioSource::Microphone,
            CaptureSourceKind::File => AudioSource::File {
                path: capture
                    .input_file
                    .clone()
                    .ok_or_else(|| AgentError::device("file capture needs capture.input_file"))?,
                looping: capture.loop_input,
            },
        };

        let backend_config = AudioBackendConfig {
            target_sample_rate: capture.sample_rate,
            target_channels: capture.channels,
            ..AudioBackendConfig::default()
        };

        AudioBackendFactory::create(source, backend_config)
            .map_err(|e| AgentError::device(format!("{:#}", e)))
    }

    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, AgentError> {
        self.connector.connect(endpoint).await
    }

    fn media_buffer(&self) -> Result<Box<dyn MediaBuffer>, AgentError> {
        let playback = &self.config.playback;
        let format = StreamFormat::new(&playback.mime_type, playback.sample_rate, playback.channels);

        Ok(Box::new(DecodingBuffer::new(self.output_sink(), format)?))
    }
}
