pub mod backend;
pub mod chunk;
pub mod decode;
pub mod file;
pub mod resample;
pub mod sink;
#[cfg(feature = "opus")]
pub mod webm;

#[cfg(feature = "device")]
pub mod device;

pub use backend::{
    AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, CaptureDevice,
    DeviceConstraints,
};
pub use chunk::{AudioChunk, ChunkConfig, ChunkEncoder, ChunkFormat};
pub use decode::{
    chunk_channel, decode_chunk, decode_stream, ChunkSender, ChunkSource, PcmStream, StreamFormat,
};
pub use file::{AudioFile, FileBackend};
pub use resample::FrameConverter;
pub use sink::{NullSink, OutputSink, WavFileSink};
#[cfg(feature = "opus")]
pub use webm::WebmOpusWriter;

#[cfg(feature = "device")]
pub use device::{MicrophoneBackend, SpeakerSink};
