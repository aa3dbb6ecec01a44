//! Streaming decode of inbound audio
//!
//! Inbound frames are consecutive pieces of one stream, cut wherever the
//! sender flushed. [`ChunkSource`] joins the pieces into a blocking byte
//! source and [`decode_stream`] keeps one demuxer and decoder alive across
//! them, so a header, packet or sample split over two frames is decoded once
//! both halves have arrived.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, error, warn};

use super::backend::AudioFrame;
use crate::error::AgentError;

/// Opus always decodes at 48kHz
#[cfg(feature = "opus")]
const OPUS_SAMPLE_RATE: u32 = 48000;

/// Longest Opus packet (120ms at 48kHz), per channel
#[cfg(feature = "opus")]
const OPUS_MAX_FRAME: usize = 5760;

/// How inbound chunks are interpreted
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// MIME type of the inbound stream, e.g. `audio/webm; codecs=opus`
    pub mime_type: String,
    /// Sample rate assumed for headerless PCM
    pub sample_rate: u32,
    /// Channel count assumed for headerless PCM
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(mime_type: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            mime_type: mime_type.into(),
            sample_rate,
            channels,
        }
    }

    /// Media type without parameters, lowercased (`audio/webm; codecs=opus` -> `audio/webm`)
    pub fn essence(&self) -> String {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    fn is_raw_pcm(&self) -> bool {
        matches!(self.essence().as_str(), "audio/pcm" | "audio/l16" | "audio/raw")
    }

    fn hint(&self) -> Hint {
        let mut hint = Hint::new();
        hint.mime_type(&self.essence());

        let extension = match self.essence().as_str() {
            "audio/wav" | "audio/wave" | "audio/x-wav" => Some("wav"),
            "audio/webm" => Some("webm"),
            "audio/ogg" => Some("ogg"),
            "audio/mpeg" => Some("mp3"),
            "audio/flac" => Some("flac"),
            "audio/mp4" | "audio/aac" => Some("m4a"),
            _ => None,
        };
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }
        hint
    }
}

/// Create a connected sender and byte source
pub fn chunk_channel() -> (ChunkSender, ChunkSource) {
    let (tx, rx) = std_mpsc::channel();
    let backlog = Arc::new(AtomicUsize::new(0));

    let sender = ChunkSender {
        tx,
        backlog: Arc::clone(&backlog),
    };
    let source = ChunkSource {
        state: Arc::new(Mutex::new(SourceState {
            rx,
            current: Vec::new(),
            offset: 0,
            handed_out: 0,
            backlog,
        })),
        ended: Arc::new(AtomicBool::new(false)),
    };

    (sender, source)
}

/// Feeds bytes to a [`ChunkSource`]. Dropping it ends the stream.
pub struct ChunkSender {
    tx: std_mpsc::Sender<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
}

impl ChunkSender {
    pub fn send(&self, data: Vec<u8>) -> Result<(), AgentError> {
        let len = data.len();
        self.backlog.fetch_add(len, Ordering::SeqCst);

        if self.tx.send(data).is_err() {
            self.backlog.fetch_sub(len, Ordering::SeqCst);
            return Err(AgentError::buffer("decoder has stopped"));
        }
        Ok(())
    }

    /// Bytes sent but not yet consumed by the decoder
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }
}

/// Blocking, non-seekable byte source over sent chunks
///
/// Reads wait for the next chunk and return end of stream once the sender
/// is gone. Bytes stay in the backlog until the reader asks for more, which
/// a decoder only does once it has used up everything read so far.
#[derive(Clone)]
pub struct ChunkSource {
    state: Arc<Mutex<SourceState>>,
    ended: Arc<AtomicBool>,
}

struct SourceState {
    rx: std_mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
    handed_out: usize,
    backlog: Arc<AtomicUsize>,
}

impl SourceState {
    /// Unread bytes of the current chunk, waiting for a new one when drained
    fn fill(&mut self) -> Option<&[u8]> {
        if self.handed_out > 0 {
            self.backlog.fetch_sub(self.handed_out, Ordering::SeqCst);
            self.handed_out = 0;
        }

        while self.offset >= self.current.len() {
            self.current = self.rx.recv().ok()?;
            self.offset = 0;
        }
        Some(&self.current[self.offset..])
    }

    fn consume(&mut self, n: usize) {
        self.offset += n;
        self.handed_out += n;
    }
}

impl ChunkSource {
    /// True once the sender is gone and every chunk has been read
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Rest of the current chunk, or the next chunk once it arrives
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let chunk = match state.fill() {
            Some(bytes) => bytes.to_vec(),
            None => {
                self.ended.store(true, Ordering::SeqCst);
                return None;
            }
        };
        state.consume(chunk.len());
        Some(chunk)
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Read for ChunkSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        let n = match state.fill() {
            Some(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                n
            }
            None => {
                self.ended.store(true, Ordering::SeqCst);
                return Ok(0);
            }
        };
        state.consume(n);
        Ok(n)
    }
}

impl Seek for ChunkSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "chunk stream is not seekable",
        ))
    }
}

impl MediaSource for ChunkSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Headerless little-endian 16-bit PCM split at arbitrary byte offsets
pub struct PcmStream {
    sample_rate: u32,
    channels: u16,
    carry: Vec<u8>,
}

impl PcmStream {
    pub fn new(format: &StreamFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels.max(1),
            carry: Vec::new(),
        }
    }

    /// Append bytes and return every complete sample frame. A trailing
    /// partial frame is kept for the next call.
    pub fn push(&mut self, data: &[u8]) -> Option<AudioFrame> {
        self.carry.extend_from_slice(data);

        let frame_bytes = 2 * self.channels as usize;
        let usable = self.carry.len() - self.carry.len() % frame_bytes;
        if usable == 0 {
            return None;
        }

        let bytes: Vec<u8> = self.carry.drain(..usable).collect();
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        Some(AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_ms: 0,
        })
    }

    /// Bytes waiting for the rest of their sample frame
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }
}

/// Decode a stream until the source ends or `emit` returns false.
///
/// Containers may follow one another; each is probed in turn. Data that
/// cannot be decoded is reported and skipped, and decoding resumes at the
/// next recognisable container.
pub fn decode_stream<F>(mut source: ChunkSource, format: &StreamFormat, mut emit: F)
where
    F: FnMut(AudioFrame) -> bool,
{
    if format.is_raw_pcm() {
        let mut pcm = PcmStream::new(format);
        while let Some(data) = source.next_chunk() {
            if let Some(frame) = pcm.push(&data) {
                if !emit(frame) {
                    return;
                }
            }
        }
        if pcm.pending_bytes() > 0 {
            debug!("Discarding {} trailing PCM bytes", pcm.pending_bytes());
        }
        return;
    }

    loop {
        match decode_containers(&source, format, &mut emit) {
            Ok(()) => return,
            Err(_) if source.is_ended() => return,
            Err(e) => error!("{}", AgentError::buffer(format!("{:#}", e))),
        }
    }
}

/// Decode one self-contained payload into a single frame
pub fn decode_chunk(data: &[u8], format: &StreamFormat) -> Result<AudioFrame> {
    if data.is_empty() {
        bail!("empty chunk");
    }

    let (sender, mut source) = chunk_channel();
    sender.send(data.to_vec())?;
    drop(sender);

    if format.is_raw_pcm() {
        let mut pcm = PcmStream::new(format);
        let frame = source.next_chunk().and_then(|data| pcm.push(&data));
        if pcm.pending_bytes() > 0 {
            bail!("PCM chunk ends mid-sample ({} bytes)", data.len());
        }
        return frame.ok_or_else(|| anyhow!("PCM chunk holds no whole sample"));
    }

    let mut joined: Option<AudioFrame> = None;
    decode_containers(&source, format, &mut |frame: AudioFrame| {
        match joined.as_mut() {
            Some(all) => all.samples.extend_from_slice(&frame.samples),
            None => joined = Some(frame),
        }
        true
    })?;

    joined.ok_or_else(|| anyhow!("{} chunk holds no audio", format.mime_type))
}

enum Flow {
    Stop,
    NextContainer,
}

/// Decode consecutive containers from one byte stream. Returns an error
/// when the stream cannot be read any further from its current position.
fn decode_containers<F>(source: &ChunkSource, format: &StreamFormat, emit: &mut F) -> Result<()>
where
    F: FnMut(AudioFrame) -> bool,
{
    let mut mss = MediaSourceStream::new(Box::new(source.clone()), Default::default());

    loop {
        let probed = match symphonia::default::get_probe().format(
            &format.hint(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(probed) => probed,
            Err(_) if source.is_ended() => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Unrecognised {} data", format.mime_type))
            }
        };

        let mut reader = probed.format;
        match decode_packets(reader.as_mut(), emit)? {
            Flow::Stop => return Ok(()),
            Flow::NextContainer if source.is_ended() => return Ok(()),
            Flow::NextContainer => mss = reader.into_inner(),
        }
    }
}

fn decode_packets<F>(reader: &mut dyn FormatReader, emit: &mut F) -> Result<Flow>
where
    F: FnMut(AudioFrame) -> bool,
{
    let track = reader
        .default_track()
        .ok_or_else(|| anyhow!("stream contains no audio track"))?;
    let track_id = track.id;
    let mut decoder = TrackDecoder::new(&track.codec_params)?;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Flow::NextContainer);
            }
            Err(e) => return Err(e).context("Failed to read packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        if let Some(frame) = decoder.decode(&packet)? {
            if !frame.samples.is_empty() && !emit(frame) {
                return Ok(Flow::Stop);
            }
        }
    }
}

enum TrackDecoder {
    Codec(Box<dyn Decoder>),
    #[cfg(feature = "opus")]
    Opus(OpusTrack),
}

impl TrackDecoder {
    fn new(params: &CodecParameters) -> Result<Self> {
        if params.codec == CODEC_TYPE_OPUS {
            #[cfg(feature = "opus")]
            return OpusTrack::new(params).map(TrackDecoder::Opus);

            #[cfg(not(feature = "opus"))]
            bail!("Opus playback needs the `opus` feature");
        }

        symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map(TrackDecoder::Codec)
            .context("Unsupported codec")
    }

    /// Decode one packet; `None` when the packet was skipped
    fn decode(&mut self, packet: &Packet) -> Result<Option<AudioFrame>> {
        match self {
            TrackDecoder::Codec(decoder) => match decoder.decode(packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);

                    Ok(Some(AudioFrame {
                        samples: buf.samples().to_vec(),
                        sample_rate: spec.rate,
                        channels: spec.channels.count() as u16,
                        timestamp_ms: 0,
                    }))
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping undecodable packet: {}", e);
                    Ok(None)
                }
                Err(e) => Err(e).context("Failed to decode packet"),
            },
            #[cfg(feature = "opus")]
            TrackDecoder::Opus(track) => Ok(track.decode(packet)),
        }
    }
}

/// Opus track from a Matroska/WebM stream
#[cfg(feature = "opus")]
struct OpusTrack {
    decoder: opus::Decoder,
    channels: u16,
    pcm: Vec<i16>,
}

#[cfg(feature = "opus")]
impl OpusTrack {
    fn new(params: &CodecParameters) -> Result<Self> {
        // Channel count from the track, else byte 9 of the OpusHead
        let channels = params
            .channels
            .map(|c| c.count())
            .or_else(|| params.channel_layout.map(|l| l.into_channels().count()))
            .or_else(|| {
                params
                    .extra_data
                    .as_deref()
                    .and_then(|head| head.get(9))
                    .map(|&c| c as usize)
            })
            .unwrap_or(1);

        let (layout, channels) = if channels >= 2 {
            (opus::Channels::Stereo, 2)
        } else {
            (opus::Channels::Mono, 1)
        };

        let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, layout)
            .context("Failed to create Opus decoder")?;
        debug!("Opus track: {} channel(s)", channels);

        Ok(Self {
            decoder,
            channels,
            pcm: vec![0; OPUS_MAX_FRAME * channels as usize],
        })
    }

    fn decode(&mut self, packet: &Packet) -> Option<AudioFrame> {
        match self.decoder.decode(packet.buf(), &mut self.pcm, false) {
            Ok(per_channel) => Some(AudioFrame {
                samples: self.pcm[..per_channel * self.channels as usize].to_vec(),
                sample_rate: OPUS_SAMPLE_RATE,
                channels: self.channels,
                timestamp_ms: 0,
            }),
            Err(e) => {
                warn!("Skipping undecodable Opus packet: {}", e);
                None
            }
        }
    }
}
