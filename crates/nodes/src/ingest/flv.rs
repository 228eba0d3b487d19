// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FLV container demuxer.
//!
//! ```text
//! | FLV header (9 bytes) | PreviousTagSize0 (4) | Tag1 | PreviousTagSize1 | Tag2 | ...
//!
//! Tag: | type (1) | data size (3) | timestamp (3) | timestamp ext (1) | stream id (3) | data |
//!
//! Audio data: | SoundFormat (4 bits) | SoundRate (2) | SoundSize (1) | SoundType (1) | ...
//! Video data: | FrameType (4 bits) | CodecID (4) | [AVCPacketType (1) | CTS (3)] | ...
//! ```
//!
//! Codec configuration records (AVC/HEVC sequence headers, AAC AudioSpecificConfig) register
//! the stream but are not emitted as packets. Script tags (`onMetaData`) are skipped.

use super::demux::Demuxer;
use bytes::{Buf, Bytes, BytesMut};
use mediacore_core::{
    CodecId, EncodedPacket, MediaCoreError, MediaKind, Result, StreamDescriptor,
};
use smallvec::SmallVec;

const FLV_SIGNATURE: &[u8; 3] = b"FLV";
const FLV_HEADER_LEN: usize = 9;
const PREVIOUS_TAG_SIZE_LEN: usize = 4;
const TAG_HEADER_LEN: usize = 11;
/// Largest tag body accepted (24-bit size field, sanity-capped).
const MAX_TAG_SIZE: usize = 16 * 1024 * 1024;

mod tag_type {
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const SCRIPT: u8 = 18;
}

mod sound_format {
    pub const PCM_PLATFORM: u8 = 0;
    pub const MP3: u8 = 2;
    pub const PCM_LE: u8 = 3;
    pub const AAC: u8 = 10;
    pub const MP3_8K: u8 = 14;
}

mod video_codec {
    pub const AVC: u8 = 7;
    pub const HEVC: u8 = 12;
}

const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_END_OF_SEQUENCE: u8 = 2;
const AAC_SEQUENCE_HEADER: u8 = 0;
const VIDEO_INFO_FRAME: u8 = 5;

const SOUND_RATES: [u32; 4] = [5_512, 11_025, 22_050, 44_100];

/// See the module docs.
#[derive(Debug, Default)]
pub struct FlvDemuxer {
    buf: BytesMut,
    header_parsed: bool,
    has_audio: bool,
    has_video: bool,
    streams: Vec<StreamDescriptor>,
    audio_index: Option<usize>,
    video_index: Option<usize>,
}

impl FlvDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_header(&mut self) -> Result<bool> {
        if self.buf.len() < FLV_HEADER_LEN {
            return Ok(false);
        }
        if &self.buf[..3] != FLV_SIGNATURE {
            return Err(MediaCoreError::Unsupported("not an FLV stream".to_string()));
        }
        let flags = self.buf[4];
        let data_offset =
            u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
        let data_offset = data_offset.max(FLV_HEADER_LEN);
        if self.buf.len() < data_offset + PREVIOUS_TAG_SIZE_LEN {
            return Ok(false);
        }
        self.has_audio = flags & 0x04 != 0;
        self.has_video = flags & 0x01 != 0;
        self.buf.advance(data_offset + PREVIOUS_TAG_SIZE_LEN);
        self.header_parsed = true;
        tracing::trace!(audio = self.has_audio, video = self.has_video, "FLV header parsed");
        Ok(true)
    }

    fn stream_index(&mut self, kind: MediaKind, make: impl FnOnce(usize) -> StreamDescriptor) -> usize {
        let slot = match kind {
            MediaKind::Audio => &mut self.audio_index,
            MediaKind::Video => &mut self.video_index,
        };
        if let Some(index) = *slot {
            return index;
        }
        let index = self.streams.len();
        *slot = Some(index);
        self.streams.push(make(index));
        index
    }

    fn audio_packet(&mut self, timestamp_us: u64, data: Bytes) -> Option<EncodedPacket> {
        let first = *data.first()?;
        let format = first >> 4;
        let sample_rate = SOUND_RATES[usize::from((first >> 2) & 0x03)];
        let sixteen_bit = (first >> 1) & 0x01 == 1;
        let channels: u16 = if first & 0x01 == 1 { 2 } else { 1 };

        let (codec, header_len) = match format {
            sound_format::PCM_PLATFORM | sound_format::PCM_LE if sixteen_bit => {
                (CodecId::PcmS16Le, 1)
            },
            sound_format::PCM_PLATFORM | sound_format::PCM_LE => {
                (CodecId::Other("pcm_u8".to_string()), 1)
            },
            sound_format::MP3 | sound_format::MP3_8K => (CodecId::Mp3, 1),
            sound_format::AAC => (CodecId::Aac, 2),
            other => (CodecId::Other(format!("flv_audio_{other}")), 1),
        };

        let sample_rate = if format == sound_format::MP3_8K { 8_000 } else { sample_rate };
        let stream_index = self.stream_index(MediaKind::Audio, |index| StreamDescriptor {
            index,
            kind: MediaKind::Audio,
            codec: codec.clone(),
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            width: None,
            height: None,
        });

        if format == sound_format::AAC && data.get(1) == Some(&AAC_SEQUENCE_HEADER) {
            return None;
        }
        if data.len() < header_len {
            return None;
        }

        Some(EncodedPacket {
            kind: MediaKind::Audio,
            stream_index,
            codec,
            timestamp_us,
            duration_us: None,
            keyframe: true,
            data: data.slice(header_len..),
        })
    }

    fn video_packet(&mut self, timestamp_us: u64, data: Bytes) -> Option<EncodedPacket> {
        let first = *data.first()?;
        let frame_type = first >> 4;
        let codec_id = first & 0x0f;
        if frame_type == VIDEO_INFO_FRAME {
            return None;
        }

        let codec = match codec_id {
            video_codec::AVC => CodecId::H264,
            video_codec::HEVC => CodecId::Hevc,
            other => CodecId::Other(format!("flv_video_{other}")),
        };
        let stream_index = self.stream_index(MediaKind::Video, |index| StreamDescriptor {
            index,
            kind: MediaKind::Video,
            codec: codec.clone(),
            sample_rate: None,
            channels: None,
            width: None,
            height: None,
        });

        let (timestamp_us, payload) = if matches!(codec, CodecId::H264 | CodecId::Hevc) {
            if data.len() < 5 {
                return None;
            }
            match data[1] {
                AVC_SEQUENCE_HEADER | AVC_END_OF_SEQUENCE => return None,
                _ => {},
            }
            // Composition time offset: signed 24-bit milliseconds.
            let raw = (i32::from(data[2]) << 16) | (i32::from(data[3]) << 8) | i32::from(data[4]);
            let cts_ms = (raw << 8) >> 8;
            let pts = i64::try_from(timestamp_us).unwrap_or(i64::MAX) + i64::from(cts_ms) * 1000;
            (u64::try_from(pts).unwrap_or(0), data.slice(5..))
        } else {
            (timestamp_us, data.slice(1..))
        };

        Some(EncodedPacket {
            kind: MediaKind::Video,
            stream_index,
            codec,
            timestamp_us,
            duration_us: None,
            keyframe: frame_type == 1,
            data: payload,
        })
    }
}

impl Demuxer for FlvDemuxer {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        if !self.header_parsed && !self.parse_header()? {
            return Ok(None);
        }

        loop {
            if self.buf.len() < TAG_HEADER_LEN {
                return Ok(None);
            }
            let header = &self.buf[..TAG_HEADER_LEN];
            let tag = header[0] & 0x1f;
            let encrypted = header[0] & 0x20 != 0;
            let size = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
            let timestamp_ms = (u32::from(header[7]) << 24)
                | (u32::from(header[4]) << 16)
                | (u32::from(header[5]) << 8)
                | u32::from(header[6]);

            if size > MAX_TAG_SIZE {
                return Err(MediaCoreError::DecodeFailure(format!("FLV tag too large: {size} bytes")));
            }
            let total = TAG_HEADER_LEN + size + PREVIOUS_TAG_SIZE_LEN;
            if self.buf.len() < total {
                return Ok(None);
            }

            let mut tag_bytes = self.buf.split_to(total).freeze();
            tag_bytes.advance(TAG_HEADER_LEN);
            let body = tag_bytes.slice(..size);
            let timestamp_us = u64::from(timestamp_ms) * 1000;

            if encrypted {
                tracing::debug!("Skipping encrypted FLV tag");
                continue;
            }

            let packet = match tag {
                tag_type::AUDIO => self.audio_packet(timestamp_us, body),
                tag_type::VIDEO => self.video_packet(timestamp_us, body),
                tag_type::SCRIPT => None,
                other => {
                    tracing::trace!(tag = other, "Skipping unknown FLV tag");
                    None
                },
            };
            if packet.is_some() {
                return Ok(packet);
            }
        }
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn announced_kinds(&self) -> Option<SmallVec<[MediaKind; 2]>> {
        if !self.header_parsed {
            return None;
        }
        let mut kinds = SmallVec::new();
        if self.has_audio {
            kinds.push(MediaKind::Audio);
        }
        if self.has_video {
            kinds.push(MediaKind::Video);
        }
        Some(kinds)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.header_parsed = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::FlvBuilder;

    fn demux_all(data: &[u8], chunk: usize) -> (FlvDemuxer, Vec<EncodedPacket>) {
        let mut demuxer = FlvDemuxer::new();
        let mut packets = Vec::new();
        for piece in data.chunks(chunk) {
            demuxer.push(piece);
            while let Some(p) = demuxer.next_packet().unwrap() {
                packets.push(p);
            }
        }
        (demuxer, packets)
    }

    #[test]
    fn parses_pcm_and_h264_tags_across_chunk_boundaries() {
        let data = FlvBuilder::new(true, true)
            .h264_sequence_header(0)
            .pcm_audio(0, &[1, 2, 3, 4])
            .h264_video(40, true, b"frame")
            .build();
        let (demuxer, packets) = demux_all(&data, 3);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].codec, CodecId::PcmS16Le);
        assert_eq!(&packets[0].data[..], &[1, 2, 3, 4]);
        assert_eq!(packets[1].codec, CodecId::H264);
        assert_eq!(packets[1].timestamp_us, 40_000);
        assert!(packets[1].keyframe);
        assert_eq!(&packets[1].data[..], b"frame");

        // Video registered from the sequence header, before the first audio tag.
        assert_eq!(demuxer.streams()[0].kind, MediaKind::Video);
        let audio = &demuxer.streams()[1];
        assert_eq!(audio.sample_rate, Some(44_100));
        assert_eq!(audio.channels, Some(2));
    }

    #[test]
    fn extended_timestamp_uses_upper_byte() {
        let ts_ms = 0x0100_0000 + 5;
        let data = FlvBuilder::new(true, false).pcm_audio(ts_ms, &[0; 4]).build();
        let (_, packets) = demux_all(&data, 1024);
        assert_eq!(packets[0].timestamp_us, u64::from(ts_ms) * 1000);
    }

    #[test]
    fn rejects_non_flv() {
        let mut demuxer = FlvDemuxer::new();
        demuxer.push(b"GIF89a....");
        assert!(demuxer.next_packet().is_err());
    }

    #[test]
    fn announced_kinds_follow_header_flags() {
        let mut demuxer = FlvDemuxer::new();
        assert!(demuxer.announced_kinds().is_none());
        demuxer.push(&FlvBuilder::new(false, true).build());
        assert!(demuxer.next_packet().unwrap().is_none());
        assert_eq!(demuxer.announced_kinds().unwrap().as_slice(), &[MediaKind::Video]);
    }
}
