use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audio::{AudioChunk, CaptureDevice, ChunkConfig, ChunkEncoder, DeviceConstraints};
use crate::error::AgentError;

/// Turns a live capture device into a sequence of encoded chunks
///
/// A session produces one live sequence; once started it cannot be started
/// again, only stopped.
pub struct CaptureSession {
    device: Box<dyn CaptureDevice>,
    chunk_config: ChunkConfig,
    encoder_task: Option<JoinHandle<()>>,
    started: bool,
}

impl CaptureSession {
    pub fn new(device: Box<dyn CaptureDevice>, chunk_config: ChunkConfig) -> Self {
        Self {
            device,
            chunk_config,
            encoder_task: None,
            started: false,
        }
    }

    /// Open the device and start producing chunks, roughly one per interval
    pub async fn start(
        &mut self,
        constraints: &DeviceConstraints,
    ) -> Result<mpsc::Receiver<AudioChunk>, AgentError> {
        if self.started {
            return Err(AgentError::AlreadyStarted);
        }
        self.started = true;

        info!(
            "Starting capture on {} ({}ms chunks)",
            self.device.name(),
            self.chunk_config.interval_ms
        );

        let frames = self.device.open(constraints).await?;
        let (chunk_tx, chunk_rx) = mpsc::channel(32);
        let encoder = ChunkEncoder::new(self.chunk_config.clone());

        self.encoder_task = Some(tokio::spawn(encoder.run(frames, chunk_tx)));

        Ok(chunk_rx)
    }

    /// Stop capturing and release the device. Does nothing when not running.
    pub async fn stop(&mut self) {
        if let Some(task) = self.encoder_task.take() {
            task.abort();
        }

        if self.device.is_open() {
            self.device.close().await;
            info!("Capture stopped, {} released", self.device.name());
        }
    }

    pub fn is_running(&self) -> bool {
        self.encoder_task.is_some()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(task) = self.encoder_task.take() {
            task.abort();
        }
    }
}
