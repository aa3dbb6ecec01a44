// Live audio through cpal: microphone capture and speaker output
//
// cpal streams are not Send on every platform, so each stream lives on its
// own thread and is dropped there when that thread is told to stop.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::backend::{AudioBackendConfig, AudioFrame, CaptureDevice, DeviceConstraints};
use super::resample::FrameConverter;
use super::sink::OutputSink;
use crate::error::AgentError;

/// Owns a stream thread; dropping it stops and joins the thread
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Build a stream on a fresh thread and wait until it is playing
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(anyhow!("failed to start stream: {}", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stopped; the stream is dropped on this thread
                let _ = stop_rx.recv();
                drop(stream);
            })
            .context("Failed to spawn audio thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("audio thread exited during setup"))??;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("no input device found on the default audio host")),
        Some(wanted) => host
            .input_devices()
            .context("Failed to enumerate input devices")?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| anyhow!("input device '{}' not found", wanted)),
    }
}

/// Microphone capture device
pub struct MicrophoneBackend {
    config: AudioBackendConfig,
    stream: Option<StreamThread>,
}

impl MicrophoneBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureDevice for MicrophoneBackend {
    async fn open(
        &mut self,
        constraints: &DeviceConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, AgentError> {
        if !constraints.audio {
            return Err(AgentError::device("constraints request no audio input"));
        }
        if self.stream.is_some() {
            return Err(AgentError::device("microphone is already open"));
        }

        let (tx, rx) = mpsc::channel(256);
        let device_name = constraints.device_name.clone();
        let target_rate = self.config.target_sample_rate;
        let target_channels = self.config.target_channels;

        let thread = tokio::task::spawn_blocking(move || {
            StreamThread::spawn("voice-agent-capture", move || {
                let host = cpal::default_host();
                let device = find_input_device(&host, device_name.as_deref())?;
                let supported = device
                    .default_input_config()
                    .context("Failed to query default input config")?;

                let sample_rate = supported.sample_rate().0;
                let channels = supported.channels();
                let stream_config: cpal::StreamConfig = supported.into();
                let started = Instant::now();
                let mut converter = FrameConverter::new(target_rate, target_channels);

                info!(
                    "Opening input device '{}' ({}Hz, {} channels)",
                    device.name().unwrap_or_default(),
                    sample_rate,
                    channels
                );

                let stream = device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            let raw = AudioFrame {
                                samples: data.iter().copied().map(to_i16).collect(),
                                sample_rate,
                                channels,
                                timestamp_ms: started.elapsed().as_millis() as u64,
                            };
                            match converter.convert(&raw) {
                                Ok(frame) if frame.samples.is_empty() => {}
                                // Never block the audio callback; drop when the consumer lags
                                Ok(frame) => {
                                    let _ = tx.try_send(frame);
                                }
                                Err(e) => error!("Failed to convert captured audio: {:#}", e),
                            }
                        },
                        |err| error!("Input stream error: {}", err),
                        None,
                    )
                    .context("Failed to build input stream")?;

                Ok(stream)
            })
        })
        .await
        .map_err(AgentError::device)?
        .map_err(|e| AgentError::device(format!("{:#}", e)))?;

        self.stream = Some(thread);
        info!("Microphone capture started");

        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("Microphone capture stopped");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Speaker output through the default cpal output device
pub struct SpeakerSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    stream: Option<StreamThread>,
    /// Converts decoded audio to the device's rate and channel count
    converter: FrameConverter,
}

impl SpeakerSink {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stream: None,
            converter: FrameConverter::new(0, 0),
        }
    }

    fn open(&mut self) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        let (format_tx, format_rx) = std_mpsc::channel();

        let thread = StreamThread::spawn("voice-agent-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| anyhow!("no output device found on the default audio host"))?;
            let supported = device
                .default_output_config()
                .context("Failed to query default output config")?;
            let _ = format_tx.send((supported.sample_rate().0, supported.channels()));
            let config: cpal::StreamConfig = supported.into();

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match queue.lock() {
                        Ok(mut queue) => {
                            for out in data.iter_mut() {
                                *out = queue.pop_front().unwrap_or(0.0);
                            }
                        }
                        Err(_) => data.iter_mut().for_each(|s| *s = 0.0),
                    },
                    |err| error!("Output stream error: {}", err),
                    None,
                )
                .context("Failed to build output stream")?;

            Ok(stream)
        })?;

        let (sample_rate, channels) = format_rx
            .recv()
            .map_err(|_| anyhow!("output device format unavailable"))?;
        self.converter.retarget(sample_rate, channels);
        self.stream = Some(thread);

        info!("Speaker output started ({}Hz, {} channels)", sample_rate, channels);
        Ok(())
    }
}

impl Default for SpeakerSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for SpeakerSink {
    fn play(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.open()?;
        }
        Ok(())
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }

        let frame = self.converter.convert(frame)?;
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("playback queue poisoned"))?;
        queue.extend(frame.samples.iter().map(|&s| s as f32 / i16::MAX as f32));

        Ok(())
    }

    fn halt(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            if let Ok(mut queue) = self.queue.lock() {
                queue.clear();
            }
            info!("Speaker output stopped");
        }
    }

    fn name(&self) -> &str {
        "cpal speaker"
    }
}
