// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in decoders for uncompressed payloads.

use super::registry::{DecodedFrames, Decoder};
use mediacore_core::{
    AudioBufferPool, AudioFrame, CodecId, EncodedPacket, Frame, MediaCoreError, PixelFormat,
    Result, StreamDescriptor, VideoBufferPool, VideoFrame,
};
use smallvec::smallvec;

/// Copies raw I420/RGBA pictures into pooled buffers.
pub struct RawVideoDecoder {
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_size: usize,
    pool: VideoBufferPool,
}

impl RawVideoDecoder {
    /// # Errors
    ///
    /// `Unsupported` if the stream is not raw video or does not carry its dimensions.
    pub fn new(stream: &StreamDescriptor, pool: VideoBufferPool) -> Result<Self> {
        let CodecId::RawVideo(format) = stream.codec else {
            return Err(MediaCoreError::Unsupported(format!(
                "raw video decoder cannot handle {:?}",
                stream.codec
            )));
        };
        let (Some(width), Some(height)) = (stream.width, stream.height) else {
            return Err(MediaCoreError::Unsupported(
                "raw video stream without dimensions".to_string(),
            ));
        };
        Ok(Self { format, width, height, frame_size: format.frame_size(width, height), pool })
    }
}

impl Decoder for RawVideoDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<DecodedFrames> {
        if packet.data.len() != self.frame_size {
            return Err(MediaCoreError::DecodeFailure(format!(
                "expected {} bytes for {}x{} {:?}, got {}",
                self.frame_size,
                self.width,
                self.height,
                self.format,
                packet.data.len()
            )));
        }
        let pixels = self.pool.copy_from_slice(&packet.data);
        let mut frame =
            VideoFrame::new(self.width, self.height, self.format, packet.timestamp_us, pixels);
        if let Some(duration) = packet.duration_us {
            frame = frame.with_duration(duration);
        }
        Ok(smallvec![Frame::Video(frame)])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleFormat {
    S16Le,
    F32Le,
}

impl SampleFormat {
    const fn bytes(self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::F32Le => 4,
        }
    }
}

/// Converts linear PCM to interleaved f32.
pub struct PcmDecoder {
    format: SampleFormat,
    sample_rate: u32,
    channels: u16,
    pool: AudioBufferPool,
}

impl PcmDecoder {
    /// # Errors
    ///
    /// `Unsupported` for non-PCM codecs or a stream without rate/channel layout.
    pub fn new(stream: &StreamDescriptor, pool: AudioBufferPool) -> Result<Self> {
        let format = match stream.codec {
            CodecId::PcmS16Le => SampleFormat::S16Le,
            CodecId::PcmF32Le => SampleFormat::F32Le,
            ref other => {
                return Err(MediaCoreError::Unsupported(format!(
                    "PCM decoder cannot handle {other:?}"
                )))
            },
        };
        let (Some(sample_rate), Some(channels)) = (stream.sample_rate, stream.channels) else {
            return Err(MediaCoreError::Unsupported("PCM stream without layout".to_string()));
        };
        if sample_rate == 0 || channels == 0 {
            return Err(MediaCoreError::Unsupported(format!(
                "invalid PCM layout {sample_rate} Hz x {channels}"
            )));
        }
        Ok(Self { format, sample_rate, channels, pool })
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<DecodedFrames> {
        let frame_bytes = self.format.bytes() * usize::from(self.channels);
        if packet.data.is_empty() || packet.data.len() % frame_bytes != 0 {
            return Err(MediaCoreError::DecodeFailure(format!(
                "PCM payload of {} bytes is not a multiple of {frame_bytes}",
                packet.data.len()
            )));
        }

        let count = packet.data.len() / self.format.bytes();
        let mut samples = self.pool.get(count);
        let out = samples.as_mut_slice();
        match self.format {
            SampleFormat::S16Le => {
                for (dst, src) in out.iter_mut().zip(packet.data.chunks_exact(2)) {
                    *dst = f32::from(i16::from_le_bytes([src[0], src[1]])) / 32_768.0;
                }
            },
            SampleFormat::F32Le => {
                for (dst, src) in out.iter_mut().zip(packet.data.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                }
            },
        }
        let frame = AudioFrame::new(self.sample_rate, self.channels, packet.timestamp_us, samples);
        Ok(smallvec![Frame::Audio(frame)])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mediacore_core::{AllocationCounter, MediaKind};

    fn audio_stream(codec: CodecId) -> StreamDescriptor {
        StreamDescriptor {
            index: 0,
            kind: MediaKind::Audio,
            codec,
            sample_rate: Some(48_000),
            channels: Some(2),
            width: None,
            height: None,
        }
    }

    fn packet(codec: CodecId, kind: MediaKind, data: Vec<u8>) -> EncodedPacket {
        EncodedPacket {
            kind,
            stream_index: 0,
            codec,
            timestamp_us: 1_000,
            duration_us: Some(40_000),
            keyframe: true,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn s16_is_scaled_to_unit_range() {
        let counter = AllocationCounter::new();
        let mut dec =
            PcmDecoder::new(&audio_stream(CodecId::PcmS16Le), AudioBufferPool::audio_default(counter.clone()))
                .unwrap();
        let data: Vec<u8> = [i16::MIN, 0, 16_384, 0].iter().flat_map(|s| s.to_le_bytes()).collect();
        let frames = dec.decode(&packet(CodecId::PcmS16Le, MediaKind::Audio, data)).unwrap();
        let Frame::Audio(audio) = &frames[0] else { panic!("expected audio") };
        assert_eq!(audio.samples(), &[-1.0, 0.0, 0.5, 0.0]);
        assert_eq!(audio.num_frames(), 2);
        assert_eq!(counter.live(), 1);
        drop(frames);
        assert_eq!(counter.live(), 0);
    }

    #[test]
    fn truncated_pcm_is_a_decode_failure() {
        let mut dec = PcmDecoder::new(
            &audio_stream(CodecId::PcmF32Le),
            AudioBufferPool::audio_default(AllocationCounter::new()),
        )
        .unwrap();
        let result = dec.decode(&packet(CodecId::PcmF32Le, MediaKind::Audio, vec![0; 6]));
        assert!(matches!(result, Err(MediaCoreError::DecodeFailure(_))));
    }

    #[test]
    fn raw_video_checks_size_and_keeps_duration() {
        let stream = StreamDescriptor {
            index: 1,
            kind: MediaKind::Video,
            codec: CodecId::RawVideo(PixelFormat::I420),
            sample_rate: None,
            channels: None,
            width: Some(4),
            height: Some(2),
        };
        let mut dec =
            RawVideoDecoder::new(&stream, VideoBufferPool::video_default(AllocationCounter::new()))
                .unwrap();
        let codec = CodecId::RawVideo(PixelFormat::I420);

        let frames = dec.decode(&packet(codec.clone(), MediaKind::Video, vec![7; 12])).unwrap();
        let Frame::Video(video) = &frames[0] else { panic!("expected video") };
        assert_eq!(video.resolution(), (4, 2));
        assert_eq!(video.duration_us, Some(40_000));
        assert_eq!(video.pixels(), &[7; 12]);

        assert!(dec.decode(&packet(codec, MediaKind::Video, vec![0; 5])).is_err());
    }

    #[test]
    fn raw_video_requires_dimensions() {
        let stream = StreamDescriptor {
            index: 0,
            kind: MediaKind::Video,
            codec: CodecId::RawVideo(PixelFormat::Rgba),
            sample_rate: None,
            channels: None,
            width: None,
            height: None,
        };
        let pool = VideoBufferPool::video_default(AllocationCounter::new());
        assert!(RawVideoDecoder::new(&stream, pool).is_err());
    }
}
