use anyhow::{Context, Result};
use hound::WavReader;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackendConfig, AudioFrame, CaptureDevice, DeviceConstraints};
use super::resample::FrameConverter;
use crate::error::AgentError;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            anyhow::bail!(
                "Unsupported WAV format: {}-bit {:?} (expected 16-bit PCM)",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 /
            (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Resample and remix the whole file to the given format
    pub fn converted(self, sample_rate: u32, channels: u16) -> Result<Self> {
        let mut converter = FrameConverter::new(sample_rate, channels);
        if converter.is_passthrough(self.sample_rate, self.channels) {
            return Ok(self);
        }

        let frame = AudioFrame {
            samples: self.samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_ms: 0,
        };
        let converted = converter
            .convert_all(&frame)
            .with_context(|| format!("Failed to convert {} to {}Hz", self.path, sample_rate))?;

        debug!(
            "Converted {}: {}Hz/{}ch -> {}Hz/{}ch",
            self.path, frame.sample_rate, frame.channels, converted.sample_rate, converted.channels
        );

        Ok(Self {
            path: self.path,
            duration_seconds: self.duration_seconds,
            sample_rate: converted.sample_rate,
            channels: converted.channels,
            samples: converted.samples,
        })
    }

    /// Split the file into consecutive frames of `frame_ms` each
    pub fn frames(&self, frame_ms: u64) -> Vec<AudioFrame> {
        let per_frame = ((self.sample_rate as u64 * frame_ms / 1000) as usize
            * self.channels as usize)
            .max(self.channels as usize)
            .max(1);

        self.samples
            .chunks(per_frame)
            .enumerate()
            .map(|(i, samples)| AudioFrame {
                samples: samples.to_vec(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                timestamp_ms: i as u64 * frame_ms,
            })
            .collect()
    }
}

/// Capture device that replays a WAV file at real-time pace
pub struct FileBackend {
    path: String,
    config: AudioBackendConfig,
    looping: bool,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn new(path: impl Into<String>, config: AudioBackendConfig) -> Self {
        Self {
            path: path.into(),
            config,
            looping: false,
            task: None,
        }
    }

    /// Restart from the beginning when the file ends
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

#[async_trait::async_trait]
impl CaptureDevice for FileBackend {
    async fn open(
        &mut self,
        constraints: &DeviceConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, AgentError> {
        if !constraints.audio {
            return Err(AgentError::device("constraints request no audio input"));
        }
        if self.task.is_some() {
            return Err(AgentError::device(format!("{} is already open", self.path)));
        }

        let file = AudioFile::open(&self.path)
            .and_then(|file| {
                file.converted(self.config.target_sample_rate, self.config.target_channels)
            })
            .map_err(|e| AgentError::device(format!("{:#}", e)))?;
        let frame_ms = self.config.buffer_duration_ms.max(1);
        let frames = file.frames(frame_ms);
        let looping = self.looping;
        let (tx, rx) = mpsc::channel(64);

        info!(
            "Replaying {} as capture input ({}Hz, {} frames of {}ms, loop={})",
            file.path,
            file.sample_rate,
            frames.len(),
            frame_ms,
            looping
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(frame_ms));
            let mut offset_ms = 0u64;

            loop {
                for frame in &frames {
                    ticker.tick().await;
                    let mut frame = frame.clone();
                    frame.timestamp_ms += offset_ms;
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                if !looping || frames.is_empty() {
                    break;
                }
                offset_ms += frames.len() as u64 * frame_ms;
            }

            debug!("File capture reached end of input");
        }));

        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("File capture closed: {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
