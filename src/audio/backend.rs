use anyhow::Result;
use tokio::sync::mpsc;

use super::file::FileBackend;
use crate::error::AgentError;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / (self.sample_rate as f64 * self.channels as f64)
    }
}

/// Options recognised when requesting an input device
#[derive(Debug, Clone)]
pub struct DeviceConstraints {
    /// Whether audio input is requested at all
    pub audio: bool,
    /// Preferred device, `None` for the platform default
    pub device_name: Option<String>,
}

impl Default for DeviceConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            device_name: None,
        }
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Target sample rate
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono, 2 = stereo)
    pub target_channels: u16,
    /// Buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            target_channels: 1,
            buffer_duration_ms: 20,
        }
    }
}

/// Audio capture device
///
/// Implementations:
/// - Microphone: cpal default or named input device (`device` feature)
/// - File: replays a WAV file as a live input (headless runs and tests)
#[async_trait::async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device and start delivering frames
    ///
    /// Fails with [`AgentError::DeviceUnavailable`] when the device is
    /// missing, denied or the constraints request no audio.
    async fn open(
        &mut self,
        constraints: &DeviceConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, AgentError>;

    /// Release the device. Calling it on a closed device does nothing.
    async fn close(&mut self);

    /// Check if the device is currently capturing
    fn is_open(&self) -> bool;

    /// Get device name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Microphone input (requires the `device` feature)
    Microphone,
    /// WAV file replayed in real time
    File { path: String, looping: bool },
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create a capture device for the given source
    pub fn create(
        source: AudioSource,
        config: AudioBackendConfig,
    ) -> Result<Box<dyn CaptureDevice>> {
        match source {
            AudioSource::Microphone => {
                #[cfg(feature = "device")]
                {
                    use super::device::MicrophoneBackend;
                    Ok(Box::new(MicrophoneBackend::new(config)))
                }

                #[cfg(not(feature = "device"))]
                {
                    let _ = config;
                    anyhow::bail!(
                        "Microphone capture requires the `device` feature; use a file source instead"
                    )
                }
            }

            AudioSource::File { path, looping } => {
                Ok(Box::new(FileBackend::new(path, config).looping(looping)))
            }
        }
    }
}
