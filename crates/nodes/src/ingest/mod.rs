// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Source ingest: transports, demuxers and the ingest task.
//!
//! A [`Transport`] opens a [`MediaSource`] for a URI scheme. The ingest task drives the
//! source through the [`IngestState`] machine, forwards packets to the decode stage over a
//! bounded channel, and reports progress to the playout actor as [`IngestEvent`]s.
//!
//! Built-in schemes:
//! - `synthetic://` deterministic test signal
//! - `file://` local FLV or MPEG-TS
//! - `http://`, `https://` HTTP-FLV, MPEG-TS or HLS (`.m3u8`, FLV or TS segments)
//! - `rtmp://` RTMP play sessions

use async_trait::async_trait;
use mediacore_core::{
    EncodedPacket, IngestConfig, IngestState, MediaCoreError, Result, SourceUri, StreamInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod demux;
pub mod file;
pub mod flv;
pub mod hls;
pub mod http;
pub mod rtmp;
pub mod synthetic;
pub mod ts;
mod task;

pub use demux::{ByteStream, DemuxSource, Demuxer, DemuxerFactory, DemuxerRegistry};
pub use task::{IngestHandle, IngestTask};

/// An opened source producing demuxed packets.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn stream_info(&self) -> &StreamInfo;

    /// Next packet in arrival order, or `None` at end of stream.
    async fn next_packet(&mut self) -> Result<Option<EncodedPacket>>;

    /// Repositions so the next packet is at or after `position_us`.
    async fn seek(&mut self, position_us: u64) -> Result<()> {
        let _ = position_us;
        Err(MediaCoreError::Unsupported("source is not seekable".to_string()))
    }

    fn rtt_ms(&self) -> Option<u64> {
        None
    }
}

/// Shared inputs for opening a source.
#[derive(Clone)]
pub struct OpenContext {
    pub config: IngestConfig,
    pub demuxers: Arc<DemuxerRegistry>,
}

/// Opens sources for one or more URI schemes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens `uri`. Runs under the connect timeout; everything up to the first playable
    /// packet (DNS, TCP/TLS, manifest fetch, probing) belongs here.
    async fn open(&self, uri: &SourceUri, ctx: &OpenContext) -> Result<Box<dyn MediaSource>>;
}

/// Transports keyed by URI scheme. Host-extensible.
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self { transports: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("synthetic", Arc::new(synthetic::SyntheticTransport));
        registry.register("file", Arc::new(file::FileTransport));
        let http: Arc<dyn Transport> = Arc::new(http::HttpTransport);
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("rtmp", Arc::new(rtmp::RtmpTransport));
        tracing::debug!(schemes = registry.transports.len(), "Registered built-in transports");
        registry
    }

    /// Registers (or replaces) the transport for `scheme`.
    pub fn register(&mut self, scheme: &str, transport: Arc<dyn Transport>) {
        self.transports.insert(scheme.to_ascii_lowercase(), transport);
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.transports.contains_key(&scheme.to_ascii_lowercase())
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(&scheme.to_ascii_lowercase()).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.transports.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

/// Ingest → decode channel item.
#[derive(Debug)]
pub enum PipelinePacket {
    /// Stream layout, sent after every (re)connect before any packet.
    Streams(StreamInfo),
    Packet(EncodedPacket),
    /// Source repositioned for seek `generation`: discard decoder state and queued frames.
    Flush { generation: u64 },
    EndOfStream,
}

/// Control sent from playout to the ingest task.
#[derive(Debug, Clone, Copy)]
pub enum IngestControl {
    /// `generation` is echoed back in the matching `Flush` marker.
    Seek { position_us: u64, generation: u64 },
}

/// Ingest → playout progress report.
#[derive(Debug)]
pub enum IngestEvent {
    State(IngestState),
    /// Source opened; sent on first connect and after each reconnect.
    Connected(StreamInfo),
    Reconnecting { attempt: u32, delay: Duration },
    /// The source was repositioned and a `Flush` marker was queued for decode.
    Seeked { position_us: u64 },
    /// A seek was requested on a source that cannot seek.
    SeekFailed(MediaCoreError),
    EndOfStream,
    /// Terminal failure; the ingest task has stopped.
    Failed(MediaCoreError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_schemes() {
        let registry = TransportRegistry::with_builtins();
        assert_eq!(registry.schemes(), vec!["file", "http", "https", "rtmp", "synthetic"]);
        assert!(registry.supports("RTMP"));
        assert!(!registry.supports("srt"));
    }
}
