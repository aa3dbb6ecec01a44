//! Live WebM/Opus stream writer for outbound chunks
//!
//! The first piece carries the EBML header, an open-ended Segment and the
//! track description. Every piece after that is one or more complete
//! Clusters, so the concatenated pieces form one valid live WebM stream, the
//! way a browser MediaRecorder emits it.

use anyhow::{bail, Context, Result};
use opus::{Application, Channels, Encoder};

/// Sample rates the Opus encoder accepts
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Length of each Opus packet
const FRAME_MS: u32 = 20;

/// Upper bound for one encoded packet
const MAX_PACKET_BYTES: usize = 4000;

/// Block timestamps are i16 offsets from their cluster
const MAX_BLOCKS_PER_CLUSTER: usize = 1000;

const EBML: u32 = 0x1A45_DFA3;
const EBML_VERSION: u32 = 0x4286;
const EBML_READ_VERSION: u32 = 0x42F7;
const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const DOC_TYPE: u32 = 0x4282;
const DOC_TYPE_VERSION: u32 = 0x4287;
const DOC_TYPE_READ_VERSION: u32 = 0x4285;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
const MUXING_APP: u32 = 0x4D80;
const WRITING_APP: u32 = 0x5741;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CODEC_PRIVATE: u32 = 0x63A2;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;
const CLUSTER: u32 = 0x1F43_B675;
const TIMESTAMP: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

/// Size marker for an element whose length is not known up front
const UNKNOWN_SIZE: u8 = 0xFF;

/// Encodes interleaved samples as consecutive pieces of a WebM/Opus stream
pub struct WebmOpusWriter {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    /// Samples short of a whole Opus frame, held for the next call
    pending: Vec<i16>,
    header_written: bool,
    packets_written: u64,
}

impl WebmOpusWriter {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if !OPUS_RATES.contains(&sample_rate) {
            bail!("Opus cannot encode {}Hz audio", sample_rate);
        }
        let layout = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => bail!("Opus chunks carry 1 or 2 channels, not {}", n),
        };

        let encoder = Encoder::new(sample_rate, layout, Application::Voip)
            .context("Failed to create Opus encoder")?;

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            pending: Vec::new(),
            header_written: false,
            packets_written: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Encode samples into the next piece of the stream
    pub fn write(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(samples);

        let frame_len = (self.sample_rate * FRAME_MS / 1000) as usize * self.channels as usize;
        let mut packets = Vec::new();
        let mut buf = vec![0u8; MAX_PACKET_BYTES];

        while self.pending.len() >= frame_len {
            let frame: Vec<i16> = self.pending.drain(..frame_len).collect();
            let len = self
                .encoder
                .encode(&frame, &mut buf)
                .context("Opus encode failed")?;
            packets.push(buf[..len].to_vec());
        }

        let mut out = Vec::new();
        if !self.header_written {
            self.write_header(&mut out);
            self.header_written = true;
        }
        for blocks in packets.chunks(MAX_BLOCKS_PER_CLUSTER) {
            self.write_cluster(blocks, &mut out);
        }

        Ok(out)
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        let mut ebml = Vec::new();
        uint(&mut ebml, EBML_VERSION, 1);
        uint(&mut ebml, EBML_READ_VERSION, 1);
        uint(&mut ebml, EBML_MAX_ID_LENGTH, 4);
        uint(&mut ebml, EBML_MAX_SIZE_LENGTH, 8);
        element(&mut ebml, DOC_TYPE, b"webm");
        uint(&mut ebml, DOC_TYPE_VERSION, 4);
        uint(&mut ebml, DOC_TYPE_READ_VERSION, 2);
        element(out, EBML, &ebml);

        write_id(out, SEGMENT);
        out.push(UNKNOWN_SIZE);

        let mut info = Vec::new();
        uint(&mut info, TIMESTAMP_SCALE, 1_000_000);
        element(&mut info, MUXING_APP, b"voice-agent");
        element(&mut info, WRITING_APP, b"voice-agent");
        element(out, INFO, &info);

        let mut audio = Vec::new();
        // Opus in Matroska always declares 48kHz
        element(&mut audio, SAMPLING_FREQUENCY, &48000f64.to_be_bytes());
        uint(&mut audio, CHANNELS, self.channels as u64);

        let mut entry = Vec::new();
        uint(&mut entry, TRACK_NUMBER, 1);
        uint(&mut entry, TRACK_UID, 1);
        uint(&mut entry, TRACK_TYPE, 2);
        element(&mut entry, CODEC_ID, b"A_OPUS");
        element(&mut entry, CODEC_PRIVATE, &self.opus_head());
        element(&mut entry, AUDIO, &audio);

        let mut tracks = Vec::new();
        element(&mut tracks, TRACK_ENTRY, &entry);
        element(out, TRACKS, &tracks);
    }

    /// Identification header, RFC 7845 section 5.1
    fn opus_head(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(self.channels as u8);
        head.extend_from_slice(&0u16.to_le_bytes());
        head.extend_from_slice(&self.sample_rate.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);
        head
    }

    fn write_cluster(&mut self, packets: &[Vec<u8>], out: &mut Vec<u8>) {
        let mut cluster = Vec::new();
        uint(&mut cluster, TIMESTAMP, self.packets_written * FRAME_MS as u64);

        for (i, packet) in packets.iter().enumerate() {
            let mut block = Vec::with_capacity(packet.len() + 4);
            // Track 1 as a one-byte vint
            block.push(0x81);
            block.extend_from_slice(&((i as u32 * FRAME_MS) as i16).to_be_bytes());
            // Keyframe
            block.push(0x80);
            block.extend_from_slice(packet);
            element(&mut cluster, SIMPLE_BLOCK, &block);
        }

        element(out, CLUSTER, &cluster);
        self.packets_written += packets.len() as u64;
    }
}

fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

fn write_size(out: &mut Vec<u8>, len: u64) {
    // All-ones values are reserved for unknown sizes
    let mut width = 1;
    while width < 8 && len >= (1u64 << (7 * width)) - 1 {
        width += 1;
    }
    let marked = len | (1u64 << (7 * width));
    out.extend_from_slice(&marked.to_be_bytes()[8 - width..]);
}

fn element(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    write_id(out, id);
    write_size(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    element(out, id, &bytes[skip..]);
}
