// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

use super::raw::{PcmDecoder, RawVideoDecoder};
use mediacore_core::{
    AudioBufferPool, CodecId, EncodedPacket, Frame, PixelFormat, Result, StreamDescriptor,
    VideoBufferPool,
};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Frames produced by one packet. Almost always zero or one.
pub type DecodedFrames = SmallVec<[Frame; 2]>;

/// Turns packets of one elementary stream into frames.
pub trait Decoder: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the packet cannot be decoded. The caller skips the packet.
    fn decode(&mut self, packet: &EncodedPacket) -> Result<DecodedFrames>;

    /// Drops internal state (reference pictures, partial samples) after a seek.
    /// Returns any frames still held back.
    fn flush(&mut self) -> DecodedFrames {
        DecodedFrames::new()
    }
}

/// Per-session resources available to decoder factories.
#[derive(Clone)]
pub struct DecodeContext {
    pub audio_pool: AudioBufferPool,
    pub video_pool: VideoBufferPool,
}

pub type DecoderFactory =
    Arc<dyn Fn(&StreamDescriptor, &DecodeContext) -> Result<Box<dyn Decoder>> + Send + Sync>;

/// Decoders keyed by codec. Hosts register compressed codecs here.
pub struct DecoderRegistry {
    factories: HashMap<CodecId, DecoderFactory>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Raw video (I420, RGBA) and linear PCM (S16LE, F32LE).
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for format in [PixelFormat::I420, PixelFormat::Rgba] {
            registry.register(CodecId::RawVideo(format), Arc::new(raw_video));
        }
        for codec in [CodecId::PcmS16Le, CodecId::PcmF32Le] {
            registry.register(codec, Arc::new(pcm));
        }
        registry
    }

    /// Registers (or replaces) the decoder for `codec`.
    pub fn register(&mut self, codec: CodecId, factory: DecoderFactory) {
        tracing::debug!(codec = ?codec, "Registering decoder");
        self.factories.insert(codec, factory);
    }

    pub fn supports(&self, codec: &CodecId) -> bool {
        self.factories.contains_key(codec)
    }

    /// Builds a decoder for `stream`; `None` if no decoder is registered for its codec.
    pub fn create(
        &self,
        stream: &StreamDescriptor,
        ctx: &DecodeContext,
    ) -> Option<Result<Box<dyn Decoder>>> {
        self.factories.get(&stream.codec).map(|factory| factory(stream, ctx))
    }
}

fn raw_video(stream: &StreamDescriptor, ctx: &DecodeContext) -> Result<Box<dyn Decoder>> {
    Ok(Box::new(RawVideoDecoder::new(stream, ctx.video_pool.clone())?))
}

fn pcm(stream: &StreamDescriptor, ctx: &DecodeContext) -> Result<Box<dyn Decoder>> {
    Ok(Box::new(PcmDecoder::new(stream, ctx.audio_pool.clone())?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediacore_core::{AllocationCounter, MediaKind};

    #[test]
    fn builtins_cover_raw_formats_only() {
        let registry = DecoderRegistry::with_builtins();
        assert!(registry.supports(&CodecId::PcmS16Le));
        assert!(registry.supports(&CodecId::RawVideo(PixelFormat::I420)));
        assert!(!registry.supports(&CodecId::H264));
        assert!(!registry.supports(&CodecId::Aac));
    }

    #[test]
    fn host_can_register_codec() {
        struct Silence;
        impl Decoder for Silence {
            fn decode(&mut self, _packet: &EncodedPacket) -> Result<DecodedFrames> {
                Ok(DecodedFrames::new())
            }
        }

        let mut registry = DecoderRegistry::empty();
        registry.register(
            CodecId::Aac,
            Arc::new(|_: &StreamDescriptor, _: &DecodeContext| -> Result<Box<dyn Decoder>> {
                Ok(Box::new(Silence))
            }),
        );
        let counter = AllocationCounter::new();
        let ctx = DecodeContext {
            audio_pool: AudioBufferPool::audio_default(counter.clone()),
            video_pool: VideoBufferPool::video_default(counter),
        };
        let desc = StreamDescriptor {
            index: 0,
            kind: MediaKind::Audio,
            codec: CodecId::Aac,
            sample_rate: Some(44_100),
            channels: Some(2),
            width: None,
            height: None,
        };
        assert!(registry.create(&desc, &ctx).unwrap().is_ok());
        let h264 = StreamDescriptor { codec: CodecId::H264, kind: MediaKind::Video, ..desc };
        assert!(registry.create(&h264, &ctx).is_none());
    }
}
