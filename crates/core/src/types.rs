// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types that flow through the playback pipeline.
//!
//! - [`EncodedPacket`]: demuxed elementary-stream unit, tagged with kind and timestamp
//! - [`Frame`]: decoded unit ([`AudioFrame`] or [`VideoFrame`]) with an `Arc`-shared payload
//! - [`StreamInfo`]: what a source exposes once connected
//! - Identifiers for sessions and renderers

use crate::frame_pool::FrameBuffer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Elementary stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Codec identifiers the demuxers can tag packets with.
///
/// Only the raw formats are decoded by the built-in decoders; compressed codecs need a
/// host-registered decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    H264,
    Hevc,
    Aac,
    Mp3,
    PcmS16Le,
    PcmF32Le,
    /// Uncompressed pictures; the pixel layout travels in the stream descriptor.
    RawVideo(PixelFormat),
    Other(String),
}

/// Pixel layout of raw video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    I420,
    Rgba,
}

impl PixelFormat {
    /// Byte size of one picture.
    pub const fn frame_size(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            Self::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            Self::Rgba => w * h * 4,
        }
    }
}

/// A demuxed elementary-stream unit.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub kind: MediaKind,
    pub stream_index: usize,
    pub codec: CodecId,
    /// Source presentation timestamp in microseconds.
    pub timestamp_us: u64,
    pub duration_us: Option<u64>,
    pub keyframe: bool,
    pub data: bytes::Bytes,
}

/// Description of one elementary stream exposed by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: MediaKind,
    pub codec: CodecId,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// What a source reports once connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub streams: Vec<StreamDescriptor>,
    /// Whether `seek` can reposition the source.
    pub seekable: bool,
    /// Total duration for finite sources.
    pub duration_us: Option<u64>,
}

impl StreamInfo {
    pub fn has(&self, kind: MediaKind) -> bool {
        self.streams.iter().any(|s| s.kind == kind)
    }
}

/// Decoded audio, interleaved f32 samples.
///
/// The payload sits behind an `Arc`, so cloning a frame is a refcount bump.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_us: u64,
    pub samples: Arc<FrameBuffer<f32>>,
}

impl AudioFrame {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        timestamp_us: u64,
        samples: FrameBuffer<f32>,
    ) -> Self {
        Self { sample_rate, channels, timestamp_us, samples: Arc::new(samples) }
    }

    pub fn samples(&self) -> &[f32] {
        self.samples.as_slice()
    }

    /// Number of sample frames (samples / channels).
    pub fn num_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration in microseconds; zero when the sample rate is unknown.
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.num_frames() as u64 * 1_000_000) / u64::from(self.sample_rate)
    }
}

/// Decoded picture.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_us: u64,
    pub duration_us: Option<u64>,
    pub pixels: Arc<FrameBuffer<u8>>,
}

impl VideoFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp_us: u64,
        pixels: FrameBuffer<u8>,
    ) -> Self {
        Self { width, height, format, timestamp_us, duration_us: None, pixels: Arc::new(pixels) }
    }

    #[must_use]
    pub const fn with_duration(mut self, duration_us: u64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub const fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A decoded unit travelling through the frame queue.
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub const fn timestamp_us(&self) -> u64 {
        match self {
            Self::Audio(f) => f.timestamp_us,
            Self::Video(f) => f.timestamp_us,
        }
    }

    /// Presentation duration, when it can be derived.
    pub fn duration_us(&self) -> Option<u64> {
        match self {
            Self::Audio(f) => Some(f.duration_us()),
            Self::Video(f) => f.duration_us,
        }
    }
}

/// Opaque, process-unique session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

/// Opaque, process-unique renderer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RendererId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RENDERER_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl RendererId {
    pub fn next() -> Self {
        Self(NEXT_RENDERER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl std::fmt::Display for RendererId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "renderer-{}", self.0)
    }
}
