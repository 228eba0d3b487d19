// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `synthetic://` test-signal source.
//!
//! Produces a 440 Hz sine (PCM f32le, 20 ms packets) and a moving-bar raw video stream.
//! Query parameters:
//!
//! | param | default | |
//! |---|---|---|
//! | `duration_ms` | endless | end of stream after this much media |
//! | `fps` | 25 | video frame rate |
//! | `width`, `height` | 320, 240 | video size |
//! | `format` | `i420` | `i420` or `rgba` |
//! | `sample_rate`, `channels` | 48000, 2 | audio layout |
//! | `audio`, `video` | true | enable each stream |
//! | `live` | false | pace packets in real time (not seekable) |

use super::{MediaSource, OpenContext, Transport};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use mediacore_core::{
    CodecId, EncodedPacket, MediaCoreError, MediaKind, PixelFormat, Result, SourceUri,
    StreamDescriptor, StreamInfo,
};
use std::f32::consts::TAU;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

const AUDIO_PACKET_US: u64 = 20_000;
const TONE_HZ: f32 = 440.0;

/// Transport for `synthetic://`.
pub struct SyntheticTransport;

#[async_trait]
impl Transport for SyntheticTransport {
    async fn open(&self, uri: &SourceUri, _ctx: &OpenContext) -> Result<Box<dyn MediaSource>> {
        let params = SyntheticParams::from_uri(uri)?;
        Ok(Box::new(SyntheticSource::new(params)))
    }
}

/// Parsed query parameters.
#[derive(Debug, Clone)]
pub struct SyntheticParams {
    pub duration_us: Option<u64>,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio: bool,
    pub video: bool,
    pub live: bool,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            duration_us: None,
            fps: 25,
            width: 320,
            height: 240,
            format: PixelFormat::I420,
            sample_rate: 48_000,
            channels: 2,
            audio: true,
            video: true,
            live: false,
        }
    }
}

fn param<T: FromStr>(uri: &SourceUri, key: &str, default: T) -> Result<T> {
    uri.query_param(key).map_or(Ok(default), |raw| {
        raw.parse().map_err(|_| {
            MediaCoreError::InvalidArgument(format!("synthetic source: bad value for {key}: {raw}"))
        })
    })
}

impl SyntheticParams {
    /// # Errors
    ///
    /// `InvalidArgument` for unparsable or zero-valued parameters.
    pub fn from_uri(uri: &SourceUri) -> Result<Self> {
        let d = Self::default();
        let format = match uri.query_param("format").as_deref() {
            None | Some("i420") => PixelFormat::I420,
            Some("rgba") => PixelFormat::Rgba,
            Some(other) => {
                return Err(MediaCoreError::InvalidArgument(format!(
                    "synthetic source: unknown format {other}"
                )))
            },
        };
        let duration_ms: Option<u64> = match uri.query_param("duration_ms") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                MediaCoreError::InvalidArgument(format!("synthetic source: bad duration_ms {raw}"))
            })?),
            None => None,
        };
        let params = Self {
            duration_us: duration_ms.map(|ms| ms * 1000),
            fps: param(uri, "fps", d.fps)?,
            width: param(uri, "width", d.width)?,
            height: param(uri, "height", d.height)?,
            format,
            sample_rate: param(uri, "sample_rate", d.sample_rate)?,
            channels: param(uri, "channels", d.channels)?,
            audio: param(uri, "audio", d.audio)?,
            video: param(uri, "video", d.video)?,
            live: param(uri, "live", d.live)?,
        };
        if params.fps == 0 || params.width == 0 || params.height == 0 {
            return Err(MediaCoreError::InvalidArgument(
                "synthetic source: fps, width and height must be > 0".to_string(),
            ));
        }
        if params.sample_rate == 0 || params.channels == 0 {
            return Err(MediaCoreError::InvalidArgument(
                "synthetic source: sample_rate and channels must be > 0".to_string(),
            ));
        }
        if !params.audio && !params.video {
            return Err(MediaCoreError::InvalidArgument(
                "synthetic source: at least one of audio/video must be enabled".to_string(),
            ));
        }
        Ok(params)
    }

    fn frame_interval_us(&self) -> u64 {
        1_000_000 / u64::from(self.fps)
    }
}

/// See the module docs.
pub struct SyntheticSource {
    params: SyntheticParams,
    info: StreamInfo,
    next_audio_us: u64,
    next_video_us: u64,
    audio_index: usize,
    video_index: usize,
    /// Wall-clock anchor for live pacing: media time `anchor_media_us` at `anchor`.
    anchor: Instant,
    anchor_media_us: u64,
}

impl SyntheticSource {
    pub fn new(params: SyntheticParams) -> Self {
        let mut streams = Vec::new();
        if params.audio {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Audio,
                codec: CodecId::PcmF32Le,
                sample_rate: Some(params.sample_rate),
                channels: Some(params.channels),
                width: None,
                height: None,
            });
        }
        if params.video {
            streams.push(StreamDescriptor {
                index: streams.len(),
                kind: MediaKind::Video,
                codec: CodecId::RawVideo(params.format),
                sample_rate: None,
                channels: None,
                width: Some(params.width),
                height: Some(params.height),
            });
        }
        let audio_index = streams.iter().position(|s| s.kind == MediaKind::Audio).unwrap_or(0);
        let video_index = streams.iter().position(|s| s.kind == MediaKind::Video).unwrap_or(0);
        let info =
            StreamInfo { streams, seekable: !params.live, duration_us: params.duration_us };

        Self {
            params,
            info,
            next_audio_us: 0,
            next_video_us: 0,
            audio_index,
            video_index,
            anchor: Instant::now(),
            anchor_media_us: 0,
        }
    }

    fn ended(&self, ts: u64) -> bool {
        self.params.duration_us.is_some_and(|d| ts >= d)
    }

    #[allow(clippy::cast_precision_loss)]
    fn audio_packet(&mut self) -> EncodedPacket {
        let ts = self.next_audio_us;
        let rate = u64::from(self.params.sample_rate);
        let first_sample = ts * rate / 1_000_000;
        let samples = rate * AUDIO_PACKET_US / 1_000_000;
        let channels = usize::from(self.params.channels);

        let mut data = BytesMut::with_capacity(samples as usize * channels * 4);
        for n in 0..samples {
            let t = (first_sample + n) as f32 / self.params.sample_rate as f32;
            let value = (TAU * TONE_HZ * t).sin() * 0.25;
            for _ in 0..channels {
                data.put_f32_le(value);
            }
        }
        self.next_audio_us += AUDIO_PACKET_US;

        EncodedPacket {
            kind: MediaKind::Audio,
            stream_index: self.audio_index,
            codec: CodecId::PcmF32Le,
            timestamp_us: ts,
            duration_us: Some(AUDIO_PACKET_US),
            keyframe: true,
            data: data.freeze(),
        }
    }

    fn video_packet(&mut self) -> EncodedPacket {
        let ts = self.next_video_us;
        let interval = self.params.frame_interval_us();
        let frame_no = ts / interval;
        let data = moving_bar(self.params.format, self.params.width, self.params.height, frame_no);
        self.next_video_us += interval;

        EncodedPacket {
            kind: MediaKind::Video,
            stream_index: self.video_index,
            codec: CodecId::RawVideo(self.params.format),
            timestamp_us: ts,
            duration_us: Some(interval),
            keyframe: true,
            data,
        }
    }
}

/// A white vertical bar sweeping across a dark frame.
fn moving_bar(format: PixelFormat, width: u32, height: u32, frame_no: u64) -> Bytes {
    let w = width as usize;
    let h = height as usize;
    let bar_w = (w / 16).max(1);
    #[allow(clippy::cast_possible_truncation)]
    let bar_x = ((frame_no as usize) * bar_w) % w;
    let in_bar = |x: usize| x >= bar_x && x < bar_x + bar_w;

    match format {
        PixelFormat::I420 => {
            let mut data = vec![128u8; format.frame_size(width, height)];
            for y in 0..h {
                for x in 0..w {
                    data[y * w + x] = if in_bar(x) { 235 } else { 16 };
                }
            }
            Bytes::from(data)
        },
        PixelFormat::Rgba => {
            let mut data = Vec::with_capacity(w * h * 4);
            for _ in 0..h {
                for x in 0..w {
                    let v = if in_bar(x) { 255 } else { 24 };
                    data.extend_from_slice(&[v, v, v, 255]);
                }
            }
            Bytes::from(data)
        },
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        let audio_due = self.params.audio && !self.ended(self.next_audio_us);
        let video_due = self.params.video && !self.ended(self.next_video_us);
        let use_audio = match (audio_due, video_due) {
            (false, false) => return Ok(None),
            (true, false) => true,
            (false, true) => false,
            (true, true) => self.next_audio_us <= self.next_video_us,
        };

        if self.params.live {
            let ts = if use_audio { self.next_audio_us } else { self.next_video_us };
            let offset = Duration::from_micros(ts.saturating_sub(self.anchor_media_us));
            tokio::time::sleep_until(self.anchor + offset).await;
        }

        Ok(Some(if use_audio { self.audio_packet() } else { self.video_packet() }))
    }

    async fn seek(&mut self, position_us: u64) -> Result<()> {
        if self.params.live {
            return Err(MediaCoreError::Unsupported("live synthetic source".to_string()));
        }
        self.next_audio_us = position_us - position_us % AUDIO_PACKET_US;
        let interval = self.params.frame_interval_us();
        self.next_video_us = position_us.div_ceil(interval) * interval;
        self.anchor = Instant::now();
        self.anchor_media_us = position_us;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open(uri: &str) -> SyntheticSource {
        SyntheticSource::new(SyntheticParams::from_uri(&SourceUri::parse(uri).unwrap()).unwrap())
    }

    #[tokio::test]
    async fn interleaves_in_timestamp_order_and_ends() {
        let mut source = open("synthetic://t?duration_ms=200&fps=10&width=16&height=8");
        let mut last = 0;
        let (mut audio, mut video) = (0, 0);
        while let Some(p) = source.next_packet().await.unwrap() {
            assert!(p.timestamp_us >= last);
            last = p.timestamp_us;
            match p.kind {
                MediaKind::Audio => {
                    audio += 1;
                    // 20 ms at 48 kHz stereo f32.
                    assert_eq!(p.data.len(), 960 * 2 * 4);
                },
                MediaKind::Video => {
                    video += 1;
                    assert_eq!(p.data.len(), PixelFormat::I420.frame_size(16, 8));
                },
            }
        }
        assert_eq!(audio, 10);
        assert_eq!(video, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_mode_paces_in_real_time() {
        let mut source = open("synthetic://t?live=true&video=false");
        let start = Instant::now();
        for _ in 0..6 {
            source.next_packet().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!source.stream_info().seekable);
    }

    #[tokio::test]
    async fn seek_aligns_to_packet_grid() {
        let mut source = open("synthetic://t?audio=false&fps=25");
        source.seek(1_010_000).await.unwrap();
        let p = source.next_packet().await.unwrap().unwrap();
        assert_eq!(p.timestamp_us, 1_040_000);
    }

    #[test]
    fn rejects_bad_params() {
        let uri = SourceUri::parse("synthetic://t?fps=0").unwrap();
        assert!(SyntheticParams::from_uri(&uri).is_err());
        let uri = SourceUri::parse("synthetic://t?audio=false&video=false").unwrap();
        assert!(SyntheticParams::from_uri(&uri).is_err());
    }
}
