// Shared mocks for the capture, transport and playback seams
//
// Each mock records what was done to it in a log shared with the test, so
// opens, closes, sends and appends can be asserted after the fact.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_agent::audio::{AudioChunk, AudioFrame, CaptureDevice, DeviceConstraints};
use voice_agent::session::{MediaBuffer, SessionFactory};
use voice_agent::transport::{Connection, ConnectionState, ReceiveHandler};
use voice_agent::AgentError;

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn mono_frame(samples: usize, timestamp_ms: u64) -> AudioFrame {
    AudioFrame {
        samples: vec![100; samples],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms,
    }
}

// ============================================================================
// Capture device
// ============================================================================

#[derive(Default)]
pub struct DeviceLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

impl DeviceLog {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Device that yields a fixed list of frames and then stays live
pub struct MockDevice {
    log: Arc<DeviceLog>,
    frames: Vec<AudioFrame>,
    fail: bool,
    live: Option<mpsc::Sender<AudioFrame>>,
}

impl MockDevice {
    pub fn new(log: Arc<DeviceLog>, frames: Vec<AudioFrame>) -> Self {
        Self {
            log,
            frames,
            fail: false,
            live: None,
        }
    }

    /// Device whose open is always denied
    pub fn denied(log: Arc<DeviceLog>) -> Self {
        Self {
            fail: true,
            ..Self::new(log, Vec::new())
        }
    }
}

#[async_trait::async_trait]
impl CaptureDevice for MockDevice {
    async fn open(
        &mut self,
        constraints: &DeviceConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, AgentError> {
        if self.fail {
            return Err(AgentError::device("permission denied"));
        }
        if !constraints.audio {
            return Err(AgentError::device("no audio requested"));
        }

        self.log.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.frames.len().max(1));
        for frame in &self.frames {
            tx.try_send(frame.clone()).expect("mock channel sized for all frames");
        }
        self.live = Some(tx);
        Ok(rx)
    }

    async fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.live = None;
    }

    fn is_open(&self) -> bool {
        self.live.is_some()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Default)]
pub struct ConnectionLog {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub sent: Mutex<Vec<AudioChunk>>,
    handler: Mutex<Option<ReceiveHandler>>,
}

impl ConnectionLog {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<AudioChunk> {
        self.sent.lock().unwrap().clone()
    }

    /// Play a server frame into the registered handler
    pub fn deliver(&self, chunk: AudioChunk) -> bool {
        match self.handler.lock().unwrap().as_mut() {
            Some(handler) => {
                handler(chunk);
                true
            }
            None => false,
        }
    }
}

pub struct MockConnection {
    log: Arc<ConnectionLog>,
    state: ConnectionState,
}

impl MockConnection {
    pub fn new(log: Arc<ConnectionLog>) -> Self {
        log.connects.fetch_add(1, Ordering::SeqCst);
        Self {
            log,
            state: ConnectionState::Open,
        }
    }
}

impl Connection for MockConnection {
    fn send(&mut self, chunk: AudioChunk) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        self.log.sent.lock().unwrap().push(chunk);
        true
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        *self.log.handler.lock().unwrap() = Some(handler);
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Closed;
        *self.log.handler.lock().unwrap() = None;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

// ============================================================================
// Media buffer
// ============================================================================

#[derive(Default)]
pub struct BufferLog {
    pub appended: Mutex<Vec<AudioChunk>>,
    pub closes: AtomicUsize,
    pub busy: AtomicBool,
    pub reject: AtomicBool,
}

impl BufferLog {
    pub fn appended(&self) -> Vec<AudioChunk> {
        self.appended.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

pub struct MockBuffer {
    log: Arc<BufferLog>,
}

impl MockBuffer {
    pub fn new(log: Arc<BufferLog>) -> Self {
        Self { log }
    }
}

impl MediaBuffer for MockBuffer {
    fn is_updating(&self) -> bool {
        self.log.busy.load(Ordering::SeqCst)
    }

    fn append(&mut self, chunk: AudioChunk) -> Result<(), AgentError> {
        if self.log.reject.load(Ordering::SeqCst) {
            return Err(AgentError::buffer("malformed data"));
        }
        self.log.appended.lock().unwrap().push(chunk);
        Ok(())
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Factory
// ============================================================================

#[derive(Default)]
pub struct MockFactory {
    pub device: Arc<DeviceLog>,
    pub connection: Arc<ConnectionLog>,
    pub buffer: Arc<BufferLog>,
    pub frames: Vec<AudioFrame>,
    pub fail_connect: bool,
    /// Hold every connect attempt this long before answering
    pub connect_delay: Option<Duration>,
    pub deny_device: bool,
}

impl MockFactory {
    pub fn with_frames(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl SessionFactory for MockFactory {
    fn capture_device(&self) -> Result<Box<dyn CaptureDevice>, AgentError> {
        if self.deny_device {
            return Ok(Box::new(MockDevice::denied(Arc::clone(&self.device))));
        }
        Ok(Box::new(MockDevice::new(
            Arc::clone(&self.device),
            self.frames.clone(),
        )))
    }

    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, AgentError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect {
            return Err(AgentError::connection(format!("{} refused", endpoint)));
        }
        Ok(Box::new(MockConnection::new(Arc::clone(&self.connection))))
    }

    fn media_buffer(&self) -> Result<Box<dyn MediaBuffer>, AgentError> {
        Ok(Box::new(MockBuffer::new(Arc::clone(&self.buffer))))
    }
}
