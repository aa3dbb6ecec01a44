use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{info, warn};

use super::backend::AudioFrame;

/// Output device that renders decoded audio
///
/// Writes happen off the async runtime, on the blocking pool.
pub trait OutputSink: Send {
    /// Begin rendering; called before the first write
    fn play(&mut self) -> Result<()>;

    /// Render one decoded frame
    fn write(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Halt output and release the device. Calling it twice does nothing.
    fn halt(&mut self);

    /// Get sink name for logging
    fn name(&self) -> &str;
}

/// Discards audio; used when no output device is available
#[derive(Debug, Default)]
pub struct NullSink {
    pub samples_written: usize,
}

impl OutputSink for NullSink {
    fn play(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        self.samples_written += frame.samples.len();
        Ok(())
    }

    fn halt(&mut self) {}

    fn name(&self) -> &str {
        "null"
    }
}

/// Renders received audio into a WAV file
///
/// The file is created lazily on the first frame so the WAV header can use
/// the stream's actual sample rate and channel count.
pub struct WavFileSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    spec: Option<hound::WavSpec>,
    halted: bool,
}

impl WavFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            spec: None,
            halted: false,
        }
    }

    fn finalize(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV output {}: {}", self.path.display(), e);
            }
        }
    }
}

impl OutputSink for WavFileSink {
    fn play(&mut self) -> Result<()> {
        info!("Rendering playback into {}", self.path.display());
        Ok(())
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.halted {
            return Ok(());
        }

        let spec = hound::WavSpec {
            channels: frame.channels,
            sample_rate: frame.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        if let Some(current) = self.spec {
            if current != spec {
                warn!(
                    "Dropping frame with mismatched format ({}Hz/{}ch, output is {}Hz/{}ch)",
                    spec.sample_rate, spec.channels, current.sample_rate, current.channels
                );
                return Ok(());
            }
        }

        if self.writer.is_none() {
            let writer = hound::WavWriter::create(&self.path, spec)
                .with_context(|| format!("Failed to create WAV file: {:?}", self.path))?;
            self.writer = Some(writer);
            self.spec = Some(spec);
        }

        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
        }

        Ok(())
    }

    fn halt(&mut self) {
        if !self.halted {
            self.halted = true;
            self.finalize();
        }
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        self.finalize();
    }
}
