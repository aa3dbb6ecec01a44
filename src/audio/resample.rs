//! Sample rate and channel conversion for audio frames
//!
//! Rate conversion uses rubato's synchronous FFT resampler. Resampler state
//! carries across frames, so a stream converted frame by frame has no gaps
//! at frame boundaries.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};
use tracing::debug;

use super::backend::AudioFrame;

/// Resampler input block length
const BLOCK_MS: u32 = 10;

/// Number of sub-chunks for the FFT resampler (1 = lowest latency)
const SUB_CHUNKS: usize = 1;

/// Converts a stream of frames to a fixed sample rate and channel count
///
/// A target of zero keeps the source's rate or channel count.
pub struct FrameConverter {
    target_rate: u32,
    target_channels: u16,
    resampler: Option<StreamResampler>,
}

impl FrameConverter {
    pub fn new(target_rate: u32, target_channels: u16) -> Self {
        Self {
            target_rate,
            target_channels,
            resampler: None,
        }
    }

    /// Point the converter at a new output format, dropping buffered state
    pub fn retarget(&mut self, target_rate: u32, target_channels: u16) {
        if target_rate != self.target_rate || target_channels != self.target_channels {
            self.target_rate = target_rate;
            self.target_channels = target_channels;
            self.resampler = None;
        }
    }

    /// Whether frames of this format pass through untouched
    pub fn is_passthrough(&self, sample_rate: u32, channels: u16) -> bool {
        (self.target_rate == 0 || self.target_rate == sample_rate)
            && (self.target_channels == 0 || self.target_channels == channels)
    }

    /// Convert one frame. Output may be shorter than the input while the
    /// resampler fills its first block.
    pub fn convert(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        let channels = if self.target_channels == 0 {
            frame.channels
        } else {
            self.target_channels
        };
        let samples = remix(&frame.samples, frame.channels, channels);

        if channels == 0
            || self.target_rate == 0
            || frame.sample_rate == 0
            || frame.sample_rate == self.target_rate
        {
            self.resampler = None;
            return Ok(AudioFrame {
                samples,
                sample_rate: frame.sample_rate,
                channels,
                timestamp_ms: frame.timestamp_ms,
            });
        }

        let resampler = match self.resampler.take() {
            Some(r) if r.from_rate == frame.sample_rate && r.channels == channels as usize => r,
            _ => StreamResampler::new(frame.sample_rate, self.target_rate, channels as usize)?,
        };
        let resampler = self.resampler.insert(resampler);

        Ok(AudioFrame {
            samples: resampler.push(&samples)?,
            sample_rate: self.target_rate,
            channels,
            timestamp_ms: frame.timestamp_ms,
        })
    }

    /// Drain audio still held by the resampler
    pub fn flush(&mut self) -> Result<Vec<i16>> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.flush(),
            None => Ok(Vec::new()),
        }
    }

    /// Convert a whole clip in one pass
    pub fn convert_all(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        let mut converted = self.convert(frame)?;
        converted.samples.extend(self.flush()?);
        Ok(converted)
    }
}

struct StreamResampler {
    from_rate: u32,
    channels: usize,
    inner: FftFixedIn<f32>,
    /// Per-channel input waiting for a full block
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        let block = (from_rate * BLOCK_MS / 1000).max(1) as usize;
        let inner = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            block,
            SUB_CHUNKS,
            channels,
        )
        .with_context(|| format!("Failed to create {}Hz -> {}Hz resampler", from_rate, to_rate))?;

        debug!("Resampling {}Hz -> {}Hz ({} channels)", from_rate, to_rate, channels);

        Ok(Self {
            from_rate,
            channels,
            inner,
            pending: vec![Vec::new(); channels],
        })
    }

    fn push(&mut self, interleaved: &[i16]) -> Result<Vec<i16>> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(sample as f32 / 32768.0);
            }
        }

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }

            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..needed).collect())
                .collect();
            let resampled = self
                .inner
                .process(&block, None)
                .context("Resampling failed")?;
            interleave(&resampled, &mut out);
        }

        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<i16>> {
        let mut out = Vec::new();
        if self.pending[0].is_empty() {
            return Ok(out);
        }

        let rest = std::mem::replace(&mut self.pending, vec![Vec::new(); self.channels]);
        let resampled = self
            .inner
            .process_partial(Some(&rest), None)
            .context("Resampling failed")?;
        interleave(&resampled, &mut out);
        Ok(out)
    }
}

fn interleave(channels: &[Vec<f32>], out: &mut Vec<i16>) {
    let frames = channels.first().map(Vec::len).unwrap_or(0);
    out.reserve(frames * channels.len());
    for i in 0..frames {
        for ch in channels {
            out.push((ch[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
        }
    }
}

/// Change the channel count of interleaved samples.
///
/// Folding to mono averages each frame; widening repeats the last source
/// channel.
pub fn remix(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let from = from as usize;
    let to = to as usize;
    let mut out = Vec::with_capacity(samples.len() / from * to);

    for frame in samples.chunks_exact(from) {
        if to == 1 {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            out.push((sum / from as i32) as i16);
        } else {
            for ch in 0..to {
                out.push(frame[ch.min(from - 1)]);
            }
        }
    }

    out
}
