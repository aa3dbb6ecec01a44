use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::backend::AudioFrame;
#[cfg(feature = "opus")]
use super::webm::WebmOpusWriter;

/// One opaque unit of encoded audio, sent or received as a single frame.
///
/// Ordering is implied by the order chunks are produced or delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
}

impl AudioChunk {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Container used for outbound chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormat {
    /// Self-contained RIFF/WAV (16-bit PCM) per chunk
    Wav,
    /// Headerless little-endian 16-bit PCM
    Pcm,
    /// Live WebM stream with one Opus track; chunks are consecutive pieces
    Opus,
}

impl ChunkFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ChunkFormat::Wav => "audio/wav",
            ChunkFormat::Pcm => "audio/pcm",
            ChunkFormat::Opus => "audio/webm; codecs=opus",
        }
    }

    /// Encode interleaved samples into one self-contained payload.
    ///
    /// No samples means an empty payload, for every format. An Opus payload
    /// is a complete WebM stream of its own; [`ChunkEncoder`] continues one
    /// stream across chunks instead.
    pub fn encode(&self, samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            ChunkFormat::Pcm => Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect()),
            ChunkFormat::Wav => {
                let spec = hound::WavSpec {
                    channels,
                    sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };

                let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
                {
                    let mut writer = hound::WavWriter::new(&mut cursor, spec)
                        .context("Failed to create WAV chunk writer")?;
                    for &sample in samples {
                        writer
                            .write_sample(sample)
                            .context("Failed to write sample to WAV chunk")?;
                    }
                    writer.finalize().context("Failed to finalize WAV chunk")?;
                }

                Ok(cursor.into_inner())
            }
            #[cfg(feature = "opus")]
            ChunkFormat::Opus => WebmOpusWriter::new(sample_rate, channels)?.write(samples),
            #[cfg(not(feature = "opus"))]
            ChunkFormat::Opus => anyhow::bail!("Opus chunks need the `opus` feature"),
        }
    }
}

/// Chunk configuration
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Duration of each chunk in milliseconds (default: 200)
    pub interval_ms: u64,
    /// Container for encoded chunks
    pub format: ChunkFormat,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            format: ChunkFormat::Wav,
        }
    }
}

/// Segments captured frames into fixed-interval encoded chunks
pub struct ChunkEncoder {
    config: ChunkConfig,
    pending: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    chunk_index: usize,
    #[cfg(feature = "opus")]
    stream: Option<WebmOpusWriter>,
}

impl ChunkEncoder {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            sample_rate: 0,
            channels: 0,
            chunk_index: 0,
            #[cfg(feature = "opus")]
            stream: None,
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Buffer a frame; returns an encoded chunk once a full interval is buffered.
    ///
    /// A change of sample rate or channel count flushes what was buffered
    /// under the old parameters first.
    pub fn push(&mut self, frame: AudioFrame) -> Result<Option<AudioChunk>> {
        let mut flushed = None;

        if !self.pending.is_empty()
            && (frame.sample_rate != self.sample_rate || frame.channels != self.channels)
        {
            flushed = Some(self.flush()?);
        }

        self.sample_rate = frame.sample_rate;
        self.channels = frame.channels;
        self.pending.extend_from_slice(&frame.samples);

        if flushed.is_some() {
            return Ok(flushed);
        }

        if self.pending_ms() >= self.config.interval_ms as f64 {
            return self.flush().map(Some);
        }

        Ok(None)
    }

    /// Encode whatever is buffered, possibly producing an empty chunk
    pub fn flush(&mut self) -> Result<AudioChunk> {
        let samples = std::mem::take(&mut self.pending);
        let format = self.config.format;
        let data = match format {
            #[cfg(feature = "opus")]
            ChunkFormat::Opus if !samples.is_empty() => {
                self.opus_stream()?.write(&samples)?
            }
            _ => format.encode(&samples, self.sample_rate, self.channels)?,
        };

        debug!(
            "Encoded chunk {}: {} samples -> {} bytes ({})",
            self.chunk_index,
            samples.len(),
            data.len(),
            self.config.format.mime_type()
        );
        self.chunk_index += 1;

        Ok(AudioChunk::new(data))
    }

    /// Writer for the current Opus stream. A format change starts a new
    /// stream with its own header.
    #[cfg(feature = "opus")]
    fn opus_stream(&mut self) -> Result<&mut WebmOpusWriter> {
        let (rate, channels) = (self.sample_rate, self.channels);
        let reusable = self
            .stream
            .as_ref()
            .map(|w| w.sample_rate() == rate && w.channels() == channels)
            .unwrap_or(false);

        if !reusable {
            debug!("Starting WebM/Opus stream ({}Hz, {} channels)", rate, channels);
            self.stream = Some(WebmOpusWriter::new(rate, channels)?);
        }

        self.stream
            .as_mut()
            .context("Opus stream missing after creation")
    }

    /// Duration of buffered audio in milliseconds
    pub fn pending_ms(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.pending.len() as f64 * 1000.0 / (self.sample_rate as f64 * self.channels as f64)
    }

    /// Consume frames until the source ends or the receiver goes away.
    ///
    /// Zero-size chunks are dropped here. Audio still buffered when the
    /// frame source ends is discarded.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        chunks: mpsc::Sender<AudioChunk>,
    ) {
        info!(
            "Chunk encoder started ({}ms chunks, {})",
            self.config.interval_ms,
            self.config.format.mime_type()
        );

        while let Some(frame) = frames.recv().await {
            match self.push(frame) {
                Ok(Some(chunk)) if chunk.is_empty() => {
                    debug!("Dropping empty chunk");
                }
                Ok(Some(chunk)) => {
                    if chunks.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Failed to encode audio chunk: {:#}", e),
            }
        }

        info!("Chunk encoder stopped after {} chunks", self.chunk_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: usize, timestamp_ms: u64) -> AudioFrame {
        AudioFrame {
            samples: vec![7; samples],
            sample_rate: 16000,
            channels: 1,
            timestamp_ms,
        }
    }

    #[test]
    fn empty_samples_encode_to_nothing() {
        assert!(ChunkFormat::Wav.encode(&[], 16000, 1).unwrap().is_empty());
        assert!(ChunkFormat::Pcm.encode(&[], 16000, 1).unwrap().is_empty());
    }

    #[test]
    fn pcm_is_little_endian() {
        let data = ChunkFormat::Pcm.encode(&[1, -2], 16000, 1).unwrap();
        assert_eq!(data, vec![1, 0, 0xfe, 0xff]);
    }

    #[test]
    fn emits_once_interval_is_buffered() {
        let mut encoder = ChunkEncoder::new(ChunkConfig {
            interval_ms: 200,
            format: ChunkFormat::Pcm,
        });

        // 100ms frames at 16kHz
        assert!(encoder.push(frame(1600, 0)).unwrap().is_none());
        let chunk = encoder.push(frame(1600, 100)).unwrap().unwrap();
        assert_eq!(chunk.len(), 3200 * 2);
        assert_eq!(encoder.pending_ms(), 0.0);
    }

    #[test]
    fn format_change_flushes_previous_audio() {
        let mut encoder = ChunkEncoder::new(ChunkConfig {
            interval_ms: 200,
            format: ChunkFormat::Pcm,
        });

        encoder.push(frame(160, 0)).unwrap();
        let stereo = AudioFrame {
            samples: vec![1; 320],
            sample_rate: 16000,
            channels: 2,
            timestamp_ms: 10,
        };
        let chunk = encoder.push(stereo).unwrap().unwrap();
        assert_eq!(chunk.len(), 320);
        assert_eq!(encoder.pending_ms(), 10.0);
    }

    #[cfg(feature = "opus")]
    #[test]
    fn opus_chunks_continue_one_stream() {
        let mut encoder = ChunkEncoder::new(ChunkConfig {
            interval_ms: 200,
            format: ChunkFormat::Opus,
        });

        let first = encoder.push(frame(3200, 0)).unwrap().unwrap();
        let second = encoder.push(frame(3200, 200)).unwrap().unwrap();

        // EBML header only at the start of the stream; later chunks are clusters
        assert_eq!(&first.data[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(&second.data[..4], &[0x1F, 0x43, 0xB6, 0x75]);
    }
}
