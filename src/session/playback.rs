use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::audio::{
    chunk_channel, decode_stream, AudioChunk, AudioFrame, ChunkSender, OutputSink, StreamFormat,
};
use crate::error::AgentError;

/// Streaming buffer that accepts encoded chunks and renders them
pub trait MediaBuffer: Send {
    /// True while a previous append is still being processed
    fn is_updating(&self) -> bool;

    /// Start processing a chunk. Fails with [`AgentError::BufferAppend`]
    /// when the buffer is busy, closed or the chunk is unusable.
    fn append(&mut self, chunk: AudioChunk) -> Result<(), AgentError>;

    /// Release the buffer and halt output. Idempotent.
    fn close(&mut self);
}

/// Result of offering a chunk to playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Buffer was busy with an earlier chunk; this one is discarded
    DroppedBusy,
    /// Buffer refused the chunk
    Rejected,
    /// Playback was already stopped
    Stopped,
}

/// Plays inbound chunks in arrival order
pub struct PlaybackSession {
    buffer: Option<Box<dyn MediaBuffer>>,
}

impl PlaybackSession {
    /// Take ownership of a buffer; playback begins with the first append
    pub fn start(buffer: Box<dyn MediaBuffer>) -> Self {
        info!("Playback ready");
        Self {
            buffer: Some(buffer),
        }
    }

    /// Append a chunk unless the buffer is busy. Busy means dropped, not queued.
    pub fn append(&mut self, chunk: AudioChunk) -> AppendOutcome {
        let Some(buffer) = self.buffer.as_mut() else {
            return AppendOutcome::Stopped;
        };

        if buffer.is_updating() {
            debug!("Dropping {}-byte chunk: playback buffer busy", chunk.len());
            return AppendOutcome::DroppedBusy;
        }

        match buffer.append(chunk) {
            Ok(()) => AppendOutcome::Appended,
            Err(e) => {
                error!("Error appending to playback buffer: {}", e);
                AppendOutcome::Rejected
            }
        }
    }

    /// Release the buffer and halt output. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.close();
            info!("Playback stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.buffer.is_none()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Media buffer that decodes one continuous stream into an output sink
///
/// Appended chunks feed a single decoder running on its own thread, so
/// decoder state carries across chunks. The buffer reports itself as
/// updating until the decoder has consumed every appended byte.
pub struct DecodingBuffer {
    input: Option<ChunkSender>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    closed: Arc<AtomicBool>,
}

impl DecodingBuffer {
    pub fn new(sink: Box<dyn OutputSink>, format: StreamFormat) -> Result<Self, AgentError> {
        info!("Decoding buffer for {} bound to {} output", format.mime_type, sink.name());

        let (input, source) = chunk_channel();
        let sink = Arc::new(Mutex::new(sink));
        let closed = Arc::new(AtomicBool::new(false));

        let worker_sink = Arc::clone(&sink);
        let worker_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name("voice-agent-decoder".to_string())
            .spawn(move || {
                let mut playing = false;
                decode_stream(source, &format, |frame| {
                    render(&worker_sink, &worker_closed, &mut playing, &frame)
                });
                debug!("Decoder for {} finished", format.mime_type);
            })
            .map_err(|e| AgentError::buffer(format!("failed to start decoder: {}", e)))?;

        Ok(Self {
            input: Some(input),
            sink,
            closed,
        })
    }
}

/// Write one decoded frame; false once the buffer is closed
fn render(
    sink: &Mutex<Box<dyn OutputSink>>,
    closed: &AtomicBool,
    playing: &mut bool,
    frame: &AudioFrame,
) -> bool {
    let mut sink = match sink.lock() {
        Ok(sink) => sink,
        Err(_) => {
            error!("Output sink poisoned");
            return false;
        }
    };
    if closed.load(Ordering::SeqCst) {
        return false;
    }

    if !*playing {
        *playing = true;
        if let Err(e) = sink.play() {
            error!("Failed to start {} output: {:#}", sink.name(), e);
        }
    }
    if let Err(e) = sink.write(frame) {
        error!("{}", AgentError::buffer(format!("{:#}", e)));
    }
    true
}

impl MediaBuffer for DecodingBuffer {
    fn is_updating(&self) -> bool {
        self.input
            .as_ref()
            .map(|input| input.backlog() > 0)
            .unwrap_or(false)
    }

    fn append(&mut self, chunk: AudioChunk) -> Result<(), AgentError> {
        let Some(input) = self.input.as_ref() else {
            return Err(AgentError::buffer("buffer is closed"));
        };
        if chunk.is_empty() {
            return Err(AgentError::buffer("empty chunk"));
        }
        if input.backlog() > 0 {
            return Err(AgentError::buffer("previous append still in progress"));
        }

        input.send(chunk.data)
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Ends the stream; the decoder exits once it sees the end
        self.input = None;

        match self.sink.lock() {
            Ok(mut sink) => sink.halt(),
            Err(poisoned) => poisoned.into_inner().halt(),
        }
    }
}

impl Drop for DecodingBuffer {
    fn drop(&mut self) {
        self.close();
    }
}
