// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Container demuxing over byte-stream transports.
//!
//! A [`ByteStream`] yields raw container bytes (file, HTTP body, TCP socket). A [`Demuxer`]
//! turns those bytes into [`EncodedPacket`]s. [`DemuxSource`] glues the two together into a
//! [`MediaSource`](super::MediaSource), probing the stream layout while the session is still
//! `Connecting`.

use super::MediaSource;
use async_trait::async_trait;
use bytes::Bytes;
use mediacore_core::{
    EncodedPacket, MediaCoreError, MediaKind, Result, StreamDescriptor, StreamInfo,
};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Packets read ahead while discovering the stream layout.
const DISCOVERY_MAX_PACKETS: usize = 64;
/// Bytes read ahead while discovering the stream layout.
const DISCOVERY_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Pull-based source of container bytes.
#[async_trait]
pub trait ByteStream: Send + Sync {
    /// Next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Whether [`ByteStream::rewind`] is supported.
    fn can_rewind(&self) -> bool {
        false
    }

    /// Restart reading from the first byte.
    async fn rewind(&mut self) -> Result<()> {
        Err(MediaCoreError::Unsupported("stream cannot be rewound".to_string()))
    }

    /// Round-trip time, for transports that measure it.
    fn rtt_ms(&self) -> Option<u64> {
        None
    }
}

/// Push-based container parser.
pub trait Demuxer: Send + Sync {
    /// Appends container bytes.
    fn push(&mut self, data: &[u8]);

    /// Next complete packet; `Ok(None)` means more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a valid container of this type.
    fn next_packet(&mut self) -> Result<Option<EncodedPacket>>;

    /// Streams discovered so far.
    fn streams(&self) -> &[StreamDescriptor];

    /// Kinds the container header declares, once the header has been parsed.
    fn announced_kinds(&self) -> Option<SmallVec<[MediaKind; 2]>>;

    /// Drops buffered bytes and parse position (seek / segment boundary).
    /// Discovered streams are kept.
    fn reset(&mut self);

    /// End of input: releases packets held back waiting for a terminator.
    fn finish(&mut self) {}
}

pub type DemuxerFactory = Arc<dyn Fn() -> Box<dyn Demuxer> + Send + Sync>;

struct DemuxerEntry {
    factory: DemuxerFactory,
    magic: &'static [u8],
}

/// Demuxers keyed by container name (also the file extension).
pub struct DemuxerRegistry {
    entries: HashMap<String, DemuxerEntry>,
}

impl Default for DemuxerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl DemuxerRegistry {
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Registry with the built-in FLV and MPEG-TS demuxers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("flv", b"FLV", Arc::new(|| Box::new(super::flv::FlvDemuxer::new())));
        registry.register("ts", &[super::ts::SYNC_BYTE], Arc::new(|| Box::new(super::ts::TsDemuxer::new())));
        registry
    }

    /// Registers (or replaces) a demuxer. `magic` is the leading signature used for sniffing.
    pub fn register(&mut self, container: &str, magic: &'static [u8], factory: DemuxerFactory) {
        tracing::debug!(container, "Registering demuxer");
        self.entries.insert(container.to_ascii_lowercase(), DemuxerEntry { factory, magic });
    }

    pub fn supports(&self, container: &str) -> bool {
        self.entries.contains_key(&container.to_ascii_lowercase())
    }

    pub fn create(&self, container: &str) -> Option<Box<dyn Demuxer>> {
        self.entries.get(&container.to_ascii_lowercase()).map(|e| (e.factory)())
    }

    /// Container whose signature prefixes `head`.
    pub fn sniff(&self, head: &[u8]) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, e)| !e.magic.is_empty() && head.starts_with(e.magic))
            .map(|(name, _)| name.clone())
    }
}

/// [`MediaSource`] that demuxes a [`ByteStream`].
pub struct DemuxSource {
    stream: Box<dyn ByteStream>,
    demuxer: Box<dyn Demuxer>,
    pending: VecDeque<EncodedPacket>,
    info: StreamInfo,
    /// Packets before this position are discarded (after a seek).
    skip_until_us: Option<u64>,
    eof: bool,
}

impl DemuxSource {
    /// Reads ahead until every announced stream has been seen, then returns the source.
    ///
    /// `container` selects the demuxer; when `None` the first chunk is sniffed.
    ///
    /// # Errors
    ///
    /// `Unsupported` if no demuxer matches, `Network`/`Io` from the byte stream, or a demuxer
    /// error if the container is malformed.
    pub async fn open(
        mut stream: Box<dyn ByteStream>,
        registry: &DemuxerRegistry,
        container: Option<&str>,
    ) -> Result<Self> {
        let mut first = None;
        let mut demuxer = match container {
            Some(name) => registry.create(name).ok_or_else(|| {
                MediaCoreError::Unsupported(format!("no demuxer for container '{name}'"))
            })?,
            None => {
                let chunk = stream.next_chunk().await?.ok_or_else(|| {
                    MediaCoreError::Network("source closed before any data".to_string())
                })?;
                let name = registry.sniff(&chunk).ok_or_else(|| {
                    MediaCoreError::Unsupported("unrecognised container".to_string())
                })?;
                first = Some(chunk);
                registry.create(&name).ok_or_else(|| {
                    MediaCoreError::Unsupported(format!("no demuxer for container '{name}'"))
                })?
            },
        };
        if let Some(chunk) = first {
            demuxer.push(&chunk);
        }

        let seekable = stream.can_rewind();
        let mut source = Self {
            stream,
            demuxer,
            pending: VecDeque::new(),
            info: StreamInfo::default(),
            skip_until_us: None,
            eof: false,
        };
        source.discover_streams().await?;
        source.info.seekable = seekable;
        Ok(source)
    }

    async fn discover_streams(&mut self) -> Result<()> {
        let mut bytes_read = 0usize;
        loop {
            while let Some(packet) = self.demuxer.next_packet()? {
                self.pending.push_back(packet);
            }
            if self.layout_complete() || self.pending.len() >= DISCOVERY_MAX_PACKETS {
                break;
            }
            if bytes_read >= DISCOVERY_MAX_BYTES {
                break;
            }
            match self.stream.next_chunk().await? {
                Some(chunk) => {
                    bytes_read += chunk.len();
                    self.demuxer.push(&chunk);
                },
                None => {
                    self.demuxer.finish();
                    while let Some(packet) = self.demuxer.next_packet()? {
                        self.pending.push_back(packet);
                    }
                    self.eof = true;
                    break;
                },
            }
        }

        let streams = self.demuxer.streams().to_vec();
        if streams.is_empty() {
            return Err(MediaCoreError::Unsupported(
                "no playable streams found in source".to_string(),
            ));
        }
        tracing::debug!(streams = streams.len(), buffered = self.pending.len(), "Discovered source layout");
        self.info.streams = streams;
        Ok(())
    }

    fn layout_complete(&self) -> bool {
        self.demuxer.announced_kinds().is_some_and(|kinds| {
            kinds.iter().all(|kind| self.demuxer.streams().iter().any(|s| s.kind == *kind))
        })
    }
}

#[async_trait]
impl MediaSource for DemuxSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        loop {
            let packet = match self.pending.pop_front() {
                Some(packet) => Some(packet),
                None => self.demuxer.next_packet()?,
            };
            if let Some(packet) = packet {
                if self.skip_until_us.is_some_and(|pos| packet.timestamp_us < pos) {
                    continue;
                }
                self.skip_until_us = None;
                return Ok(Some(packet));
            }
            if self.eof {
                return Ok(None);
            }
            match self.stream.next_chunk().await? {
                Some(chunk) => self.demuxer.push(&chunk),
                None => {
                    self.demuxer.finish();
                    self.eof = true;
                },
            }
        }
    }

    async fn seek(&mut self, position_us: u64) -> Result<()> {
        self.stream.rewind().await?;
        self.demuxer.reset();
        self.pending.clear();
        self.eof = false;
        self.skip_until_us = Some(position_us);
        Ok(())
    }

    fn rtt_ms(&self) -> Option<u64> {
        self.stream.rtt_ms()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{FlvBuilder, MemoryByteStream, TsBuilder};

    #[tokio::test]
    async fn sniffs_flv_and_discovers_both_streams() {
        let data = FlvBuilder::new(true, true)
            .pcm_audio(0, &[0u8; 64])
            .h264_video(0, true, b"idr")
            .pcm_audio(20, &[0u8; 64])
            .build();
        let registry = DemuxerRegistry::with_builtins();
        let mut source =
            DemuxSource::open(Box::new(MemoryByteStream::new(data, 7)), &registry, None)
                .await
                .unwrap();

        assert!(source.stream_info().has(MediaKind::Audio));
        assert!(source.stream_info().has(MediaKind::Video));
        assert!(source.stream_info().seekable);

        let mut count = 0;
        while source.next_packet().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn sniffs_mpegts_and_releases_trailing_video_at_eof() {
        let data = TsBuilder::new(true, true)
            .h264(0, true, &[0x65, 1, 2, 3])
            .aac(0, &[0x21; 32])
            .h264(40, false, &[0x41, 4, 5, 6])
            .build();
        let registry = DemuxerRegistry::with_builtins();
        assert_eq!(registry.sniff(&data).as_deref(), Some("ts"));
        let mut source =
            DemuxSource::open(Box::new(MemoryByteStream::new(data, 100)), &registry, None)
                .await
                .unwrap();
        assert!(source.stream_info().has(MediaKind::Audio));
        assert!(source.stream_info().has(MediaKind::Video));

        let mut video = Vec::new();
        while let Some(packet) = source.next_packet().await.unwrap() {
            if packet.kind == MediaKind::Video {
                video.push(packet.timestamp_us);
            }
        }
        // The last video PES has no length and no successor; only end of input completes it.
        assert_eq!(video, vec![0, 40_000]);
    }

    #[tokio::test]
    async fn seek_skips_earlier_packets() {
        let mut builder = FlvBuilder::new(true, false);
        for i in 0..10 {
            builder = builder.pcm_audio(i * 100, &[0u8; 32]);
        }
        let registry = DemuxerRegistry::with_builtins();
        let mut source = DemuxSource::open(
            Box::new(MemoryByteStream::new(builder.build(), 64)),
            &registry,
            Some("flv"),
        )
        .await
        .unwrap();

        source.seek(500_000).await.unwrap();
        let first = source.next_packet().await.unwrap().unwrap();
        assert_eq!(first.timestamp_us, 500_000);
    }

    #[tokio::test]
    async fn unknown_container_is_unsupported() {
        let registry = DemuxerRegistry::with_builtins();
        let result = DemuxSource::open(
            Box::new(MemoryByteStream::new(b"#EXTM3U\n".to_vec(), 64)),
            &registry,
            None,
        )
        .await;
        assert!(matches!(result, Err(MediaCoreError::Unsupported(_))));
    }
}
