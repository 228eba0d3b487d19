// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Test utilities for ingest, decode, render and capture tests.
//!
//! Also compiled with the `test-utils` feature so engine integration tests can drive a
//! session with scripted sources.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

use crate::capture::CameraEventsHandler;
use crate::ingest::{ByteStream, MediaSource, OpenContext, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use mediacore_core::{
    CodecId, EncodedPacket, MediaCoreError, MediaKind, PixelFormat, Result, SourceUri,
    StreamDescriptor, StreamInfo,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds FLV byte streams tag by tag.
pub struct FlvBuilder {
    out: Vec<u8>,
}

impl FlvBuilder {
    pub fn new(has_audio: bool, has_video: bool) -> Self {
        let flags = (u8::from(has_audio) << 2) | u8::from(has_video);
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"FLV");
        out.push(1);
        out.push(flags);
        out.extend_from_slice(&9u32.to_be_bytes());
        // PreviousTagSize0
        out.extend_from_slice(&0u32.to_be_bytes());
        Self { out }
    }

    fn tag(mut self, tag_type: u8, ts_ms: u32, body: &[u8]) -> Self {
        let size = u32::try_from(body.len()).unwrap();
        self.out.push(tag_type);
        self.out.extend_from_slice(&size.to_be_bytes()[1..]);
        let ts = ts_ms.to_be_bytes();
        self.out.extend_from_slice(&ts[1..]);
        self.out.push(ts[0]);
        self.out.extend_from_slice(&[0, 0, 0]);
        self.out.extend_from_slice(body);
        self.out.extend_from_slice(&(size + 11).to_be_bytes());
        self
    }

    /// Linear PCM, little endian, 44.1 kHz, 16-bit, stereo.
    pub fn pcm_audio(self, ts_ms: u32, data: &[u8]) -> Self {
        let mut body = vec![0x3F];
        body.extend_from_slice(data);
        self.tag(8, ts_ms, &body)
    }

    /// AVC NALU tag with a zero composition offset.
    pub fn h264_video(self, ts_ms: u32, keyframe: bool, data: &[u8]) -> Self {
        let mut body = vec![if keyframe { 0x17 } else { 0x27 }, 0x01, 0, 0, 0];
        body.extend_from_slice(data);
        self.tag(9, ts_ms, &body)
    }

    /// AVC decoder configuration record (contents are not inspected by the demuxer).
    pub fn h264_sequence_header(self, ts_ms: u32) -> Self {
        self.tag(9, ts_ms, &[0x17, 0x00, 0, 0, 0, 0x01, 0x64, 0x00, 0x1F])
    }

    /// `onMetaData`-style script tag.
    pub fn script(self, ts_ms: u32) -> Self {
        self.tag(18, ts_ms, &[0x02, 0x00, 0x0A, b'o', b'n', b'M', b'e', b't', b'a', b'D', b'a', b't', b'a'])
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}

pub const TS_PMT_PID: u16 = 0x1000;
pub const TS_VIDEO_PID: u16 = 0x100;
pub const TS_AUDIO_PID: u16 = 0x101;

/// Builds MPEG-TS byte streams: PAT and PMT up front, then one PES per call.
pub struct TsBuilder {
    out: Vec<u8>,
    continuity: std::collections::HashMap<u16, u8>,
}

impl TsBuilder {
    /// H.264 on [`TS_VIDEO_PID`] and ADTS AAC on [`TS_AUDIO_PID`].
    pub fn new(has_audio: bool, has_video: bool) -> Self {
        let mut builder = Self { out: Vec::new(), continuity: std::collections::HashMap::new() };
        let pmt_pid = TS_PMT_PID.to_be_bytes();
        builder.section(0, &[0x00, 0x01, 0xc1, 0x00, 0x00, 0x00, 0x01, 0xe0 | pmt_pid[0], pmt_pid[1]], 0x00);

        let pcr = if has_video { TS_VIDEO_PID } else { TS_AUDIO_PID }.to_be_bytes();
        let mut pmt = vec![0x00, 0x01, 0xc1, 0x00, 0x00, 0xe0 | pcr[0], pcr[1], 0xf0, 0x00];
        for (present, stream_type, pid) in [(has_video, 0x1b, TS_VIDEO_PID), (has_audio, 0x0f, TS_AUDIO_PID)] {
            if present {
                let pid = pid.to_be_bytes();
                pmt.extend_from_slice(&[stream_type, 0xe0 | pid[0], pid[1], 0xf0, 0x00]);
            }
        }
        builder.section(TS_PMT_PID, &pmt, 0x02);
        builder
    }

    fn section(&mut self, pid: u16, body: &[u8], table_id: u8) {
        let len = u16::try_from(body.len() + 4).unwrap().to_be_bytes();
        let mut section = vec![table_id, 0xb0 | len[0], len[1]];
        section.extend_from_slice(body);
        let crc = crate::ingest::ts::crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        self.packetize(pid, &payload, false);
    }

    fn pes(mut self, pid: u16, stream_id: u8, pts_ms: u32, random_access: bool, data: &[u8], bounded: bool) -> Self {
        let pts = u64::from(pts_ms) * 90;
        let mut pes = vec![0x00, 0x00, 0x01, stream_id];
        let len = if bounded { u16::try_from(8 + data.len()).unwrap() } else { 0 };
        pes.extend_from_slice(&len.to_be_bytes());
        pes.extend_from_slice(&[0x80, 0x80, 0x05]);
        pes.extend_from_slice(&[
            0x21 | ((pts >> 29) as u8 & 0x0e),
            (pts >> 22) as u8,
            ((pts >> 14) as u8 & 0xfe) | 0x01,
            (pts >> 7) as u8,
            ((pts << 1) as u8 & 0xfe) | 0x01,
        ]);
        pes.extend_from_slice(data);
        self.packetize(pid, &pes, random_access);
        self
    }

    /// Annex B access unit in an unbounded PES.
    pub fn h264(self, pts_ms: u32, keyframe: bool, annex_b: &[u8]) -> Self {
        self.pes(TS_VIDEO_PID, 0xe0, pts_ms, keyframe, annex_b, false)
    }

    /// One raw AAC frame behind an ADTS header (LC, 44.1 kHz, stereo).
    pub fn aac(self, pts_ms: u32, raw: &[u8]) -> Self {
        let frame_len = raw.len() + 7;
        let mut frame = vec![
            0xff,
            0xf1,
            (1 << 6) | (4 << 2),
            (2 << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            ((frame_len as u8 & 0x07) << 5) | 0x1f,
            0xfc,
        ];
        frame.extend_from_slice(raw);
        self.pes(TS_AUDIO_PID, 0xc0, pts_ms, false, &frame, true)
    }

    /// Splits `data` into 188-byte packets, padding the last one with adaptation stuffing.
    fn packetize(&mut self, pid: u16, data: &[u8], random_access: bool) {
        let pid_bytes = pid.to_be_bytes();
        let mut rest = data;
        let mut first = true;
        while first || !rest.is_empty() {
            let flag_random_access = first && random_access;
            let needs_adaptation = flag_random_access || rest.len() < 184;
            let take = if needs_adaptation {
                rest.len().min(183 - usize::from(flag_random_access))
            } else {
                184
            };
            let cc = self.continuity.entry(pid).or_insert(0);
            let counter = *cc;
            *cc = (*cc + 1) & 0x0f;

            self.out.push(0x47);
            self.out.push(if first { 0x40 } else { 0x00 } | (pid_bytes[0] & 0x1f));
            self.out.push(pid_bytes[1]);
            self.out.push(if needs_adaptation { 0x30 } else { 0x10 } | counter);
            if needs_adaptation {
                let adaptation_len = 183 - take;
                self.out.push(adaptation_len as u8);
                if adaptation_len > 0 {
                    self.out.push(if flag_random_access { 0x40 } else { 0x00 });
                    self.out.extend(std::iter::repeat(0xff).take(adaptation_len - 1));
                }
            }
            self.out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            first = false;
        }
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}

/// In-memory rewindable byte stream, served in fixed-size chunks.
pub struct MemoryByteStream {
    data: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl MemoryByteStream {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self { data: Bytes::from(data), chunk_size: chunk_size.max(1), offset: 0 }
    }
}

#[async_trait]
impl ByteStream for MemoryByteStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(Some(chunk))
    }

    fn can_rewind(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> Result<()> {
        self.offset = 0;
        Ok(())
    }
}

/// Audio packet duration produced by [`ScriptStep::audio_packets`].
pub const SCRIPT_AUDIO_PACKET_US: u64 = 20_000;
/// Video packet duration produced by [`ScriptStep::video_packets`].
pub const SCRIPT_VIDEO_PACKET_US: u64 = 40_000;
pub const SCRIPT_SAMPLE_RATE: u32 = 48_000;
pub const SCRIPT_CHANNELS: u16 = 2;
pub const SCRIPT_VIDEO_SIZE: (u32, u32) = (16, 16);

/// One step of a scripted connection.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// `count` 20 ms F32LE stereo packets starting at `start_us`.
    Audio { start_us: u64, count: usize },
    /// `count` 40 ms raw RGBA 16x16 pictures starting at `start_us`.
    Video { start_us: u64, count: usize },
    /// The source goes quiet for this long before delivering the following steps.
    Stall(Duration),
    /// Clean end of stream.
    End,
    /// Transient network failure.
    Fail,
}

#[derive(Debug, Clone)]
enum ScriptItem {
    Packet(EncodedPacket),
    Stall(Duration),
    End,
    Fail,
}

impl ScriptStep {
    pub const fn audio_packets(start_us: u64, count: usize) -> Self {
        Self::Audio { start_us, count }
    }

    pub const fn video_packets(start_us: u64, count: usize) -> Self {
        Self::Video { start_us, count }
    }
}

fn audio_descriptor(index: usize) -> StreamDescriptor {
    StreamDescriptor {
        index,
        kind: MediaKind::Audio,
        codec: CodecId::PcmF32Le,
        sample_rate: Some(SCRIPT_SAMPLE_RATE),
        channels: Some(SCRIPT_CHANNELS),
        width: None,
        height: None,
    }
}

fn video_descriptor(index: usize) -> StreamDescriptor {
    StreamDescriptor {
        index,
        kind: MediaKind::Video,
        codec: CodecId::RawVideo(PixelFormat::Rgba),
        sample_rate: None,
        channels: None,
        width: Some(SCRIPT_VIDEO_SIZE.0),
        height: Some(SCRIPT_VIDEO_SIZE.1),
    }
}

/// Expands a script into packets interleaved by timestamp, followed by the terminal step.
///
/// A stall splits the script: packets before it are all delivered before the pause.
fn expand(steps: &[ScriptStep]) -> (StreamInfo, VecDeque<ScriptItem>) {
    let has_audio = steps.iter().any(|s| matches!(s, ScriptStep::Audio { .. }));
    let has_video = steps.iter().any(|s| matches!(s, ScriptStep::Video { .. }));
    let mut streams = Vec::new();
    if has_audio || !has_video {
        streams.push(audio_descriptor(streams.len()));
    }
    if has_video {
        streams.push(video_descriptor(streams.len()));
    }
    let index_of = |kind| streams.iter().position(|s: &StreamDescriptor| s.kind == kind).unwrap_or(0);
    let audio_index = index_of(MediaKind::Audio);
    let video_index = index_of(MediaKind::Video);

    let audio_bytes = (SCRIPT_AUDIO_PACKET_US * u64::from(SCRIPT_SAMPLE_RATE) / 1_000_000) as usize
        * SCRIPT_CHANNELS as usize
        * 4;
    let video_bytes = PixelFormat::Rgba.frame_size(SCRIPT_VIDEO_SIZE.0, SCRIPT_VIDEO_SIZE.1);

    let mut ordered = VecDeque::new();
    let mut pending: Vec<EncodedPacket> = Vec::new();
    let mut terminal = Vec::new();
    let flush = |pending: &mut Vec<EncodedPacket>, ordered: &mut VecDeque<ScriptItem>| {
        pending.sort_by_key(|p| p.timestamp_us);
        ordered.extend(pending.drain(..).map(ScriptItem::Packet));
    };
    for step in steps {
        match *step {
            ScriptStep::Audio { start_us, count } => {
                for i in 0..count as u64 {
                    pending.push(EncodedPacket {
                        kind: MediaKind::Audio,
                        stream_index: audio_index,
                        codec: CodecId::PcmF32Le,
                        timestamp_us: start_us + i * SCRIPT_AUDIO_PACKET_US,
                        duration_us: Some(SCRIPT_AUDIO_PACKET_US),
                        keyframe: true,
                        data: Bytes::from(vec![0u8; audio_bytes]),
                    });
                }
            },
            ScriptStep::Video { start_us, count } => {
                for i in 0..count as u64 {
                    pending.push(EncodedPacket {
                        kind: MediaKind::Video,
                        stream_index: video_index,
                        codec: CodecId::RawVideo(PixelFormat::Rgba),
                        timestamp_us: start_us + i * SCRIPT_VIDEO_PACKET_US,
                        duration_us: Some(SCRIPT_VIDEO_PACKET_US),
                        keyframe: true,
                        data: Bytes::from(vec![0x80u8; video_bytes]),
                    });
                }
            },
            ScriptStep::Stall(pause) => {
                flush(&mut pending, &mut ordered);
                ordered.push_back(ScriptItem::Stall(pause));
            },
            ScriptStep::End => terminal.push(ScriptItem::End),
            ScriptStep::Fail => terminal.push(ScriptItem::Fail),
        }
    }
    flush(&mut pending, &mut ordered);
    ordered.extend(terminal);

    (StreamInfo { streams, seekable: true, duration_us: None }, ordered)
}

/// Transport whose successive `open` calls play successive scripts.
///
/// Once every script has been consumed, `open` fails with a transient network error.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    opens: std::sync::atomic::AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self { scripts: Mutex::new(scripts.into()), opens: std::sync::atomic::AtomicUsize::new(0) }
    }

    /// Number of `open` calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _uri: &SourceUri, _ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        self.opens.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let script = self.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            return Err(MediaCoreError::Network("scripted transport exhausted".to_string()));
        };
        let (info, items) = expand(&script);
        Ok(Box::new(ScriptedSource { all: items.clone(), items, info }))
    }
}

struct ScriptedSource {
    info: StreamInfo,
    all: VecDeque<ScriptItem>,
    items: VecDeque<ScriptItem>,
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        loop {
            match self.items.pop_front() {
                Some(ScriptItem::Packet(packet)) => return Ok(Some(packet)),
                Some(ScriptItem::Stall(pause)) => tokio::time::sleep(pause).await,
                Some(ScriptItem::Fail) => {
                    return Err(MediaCoreError::Network("scripted connection reset".to_string()))
                },
                Some(ScriptItem::End) | None => return Ok(None),
            }
        }
    }

    async fn seek(&mut self, position_us: u64) -> Result<()> {
        let last_ts = self
            .all
            .iter()
            .filter_map(|item| match item {
                ScriptItem::Packet(p) => Some(p.timestamp_us),
                _ => None,
            })
            .max();
        if last_ts.is_some_and(|last| position_us > last) {
            return Err(MediaCoreError::InvalidArgument(format!("seek to {position_us} us is past the end")));
        }
        self.items = self
            .all
            .iter()
            .filter(|item| match item {
                ScriptItem::Packet(p) => p.timestamp_us >= position_us,
                ScriptItem::Stall(_) => false,
                ScriptItem::End | ScriptItem::Fail => true,
            })
            .cloned()
            .collect();
        Ok(())
    }
}

/// Transport whose `open` never completes (unreachable host).
pub struct StallingTransport;

#[async_trait]
impl Transport for StallingTransport {
    async fn open(&self, _uri: &SourceUri, _ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        std::future::pending::<()>().await;
        Err(MediaCoreError::Network("unreachable".to_string()))
    }
}

/// Camera events captured in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    Opening(String),
    FirstFrame,
    Closed,
    Error(String),
    Disconnected,
    Freezed(String),
}

/// [`CameraEventsHandler`] that records every callback.
#[derive(Default)]
pub struct RecordingCameraEvents {
    events: Mutex<Vec<CameraEvent>>,
}

impl RecordingCameraEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CameraEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: CameraEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CameraEventsHandler for RecordingCameraEvents {
    fn on_camera_opening(&self, device_name: &str) {
        self.push(CameraEvent::Opening(device_name.to_string()));
    }

    fn on_first_frame_available(&self) {
        self.push(CameraEvent::FirstFrame);
    }

    fn on_camera_closed(&self) {
        self.push(CameraEvent::Closed);
    }

    fn on_camera_error(&self, message: &str) {
        self.push(CameraEvent::Error(message.to_string()));
    }

    fn on_camera_disconnected(&self) {
        self.push(CameraEvent::Disconnected);
    }

    fn on_camera_freezed(&self, message: &str) {
        self.push(CameraEvent::Freezed(message.to_string()));
    }
}

/// Serves static bodies on a loopback port. Returns the base URL, or `None` when the
/// sandbox does not permit binding.
#[cfg(test)]
pub async fn serve_routes(routes: Vec<(&'static str, &'static str, Vec<u8>)>) -> Option<String> {
    use axum::{http::header, routing::get, Router};

    let mut app = Router::new();
    for (path, content_type, body) in routes {
        app = app.route(
            path,
            get(move || {
                let body = body.clone();
                async move { ([(header::CONTENT_TYPE, content_type)], body) }
            }),
        );
    }

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind test HTTP listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Some(format!("http://{addr}"))
}
