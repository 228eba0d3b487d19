// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Decode stage.
//!
//! Consumes [`PipelinePacket`]s from ingest in arrival order, runs the per-stream
//! [`Decoder`], and pushes frames into the per-kind [`FrameQueue`]. Backpressure follows the
//! configured [`BackpressurePolicy`](mediacore_core::BackpressurePolicy): the queue itself
//! evicts under `low-latency`; under `block` the task retries the bounded push until the
//! frame fits, the session is cancelled, or a seek makes the frame stale.
//!
//! Seeks are ordered by a [`SeekEpoch`] that playout advances before asking ingest to
//! reposition. Until the `Flush` marker carrying the current generation arrives, decode
//! discards packets and pending frames instead of waiting on the data path.

use crate::ingest::PipelinePacket;
use mediacore_core::{
    DecodeConfig, EncodedPacket, Frame, FrameQueue, MediaCoreError, MediaKind, PlayoutCounters,
    PushOutcome, StreamInfo,
};
use opentelemetry::{global, metrics::Counter, KeyValue};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub mod raw;
pub mod registry;

pub use raw::{PcmDecoder, RawVideoDecoder};
pub use registry::{DecodeContext, DecodedFrames, Decoder, DecoderFactory, DecoderRegistry};

/// Decode → playout progress report.
#[derive(Debug)]
pub enum DecodeEvent {
    /// Kinds with a working decoder, sent after each stream layout announcement.
    Layout(SmallVec<[MediaKind; 2]>),
    /// A `Flush` marker was processed: decoders reset and queues emptied.
    Flushed { generation: u64 },
    /// End of stream reached; both queues are marked end-of-stream.
    Drained,
    /// Decoding cannot continue; the task has stopped.
    Failed(MediaCoreError),
}

/// Seek generation shared by playout (writer) and decode (reader).
#[derive(Debug, Default)]
pub struct SeekEpoch(AtomicU64);

impl SeekEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Starts a new seek generation and returns it.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undoes an [`advance`](Self::advance) whose seek request never left the writer.
    pub fn retract(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Frame queues fed by the decode stage.
#[derive(Clone)]
pub struct DecodeQueues {
    pub audio: Arc<FrameQueue>,
    pub video: Arc<FrameQueue>,
}

impl DecodeQueues {
    pub fn get(&self, kind: MediaKind) -> &Arc<FrameQueue> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn flush(&self) -> usize {
        self.audio.flush() + self.video.flush()
    }

    pub fn mark_eos(&self) {
        self.audio.mark_eos();
        self.video.mark_eos();
    }
}

/// See the module docs.
pub struct DecodeTask {
    packets: mpsc::Receiver<PipelinePacket>,
    registry: Arc<DecoderRegistry>,
    ctx: DecodeContext,
    queues: DecodeQueues,
    config: DecodeConfig,
    events: mpsc::Sender<DecodeEvent>,
    counters: Arc<PlayoutCounters>,
    cancel: CancellationToken,
    epoch: Arc<SeekEpoch>,
    /// Generation of the last `Flush` applied.
    generation: u64,
    decoders: HashMap<usize, Box<dyn Decoder>>,
    consecutive_failures: u32,
    packets_counter: Counter<u64>,
}

impl DecodeTask {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        packets: mpsc::Receiver<PipelinePacket>,
        registry: Arc<DecoderRegistry>,
        ctx: DecodeContext,
        queues: DecodeQueues,
        config: DecodeConfig,
        events: mpsc::Sender<DecodeEvent>,
        counters: Arc<PlayoutCounters>,
        cancel: CancellationToken,
        epoch: Arc<SeekEpoch>,
    ) -> JoinHandle<()> {
        let meter = global::meter("mediacore_nodes");
        let task = Self {
            packets,
            registry,
            ctx,
            queues,
            config,
            events,
            counters,
            generation: epoch.current(),
            cancel,
            epoch,
            decoders: HashMap::new(),
            consecutive_failures: 0,
            packets_counter: meter.u64_counter("decode_packets").build(),
        };
        tokio::spawn(task.run())
    }

    async fn run(mut self) {
        debug!("Decode task starting");
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = self.packets.recv() => item,
            };
            let Some(item) = item else {
                debug!("Ingest channel closed");
                break;
            };

            let keep_going = match item {
                PipelinePacket::Streams(info) => self.configure(&info).await,
                PipelinePacket::Packet(_) | PipelinePacket::EndOfStream if self.is_stale() => {
                    trace!("Discarding item queued before a seek");
                    true
                },
                PipelinePacket::Packet(packet) => self.decode(&packet).await,
                PipelinePacket::Flush { generation } => {
                    for decoder in self.decoders.values_mut() {
                        drop(decoder.flush());
                    }
                    let discarded = self.queues.flush();
                    self.generation = generation;
                    self.consecutive_failures = 0;
                    debug!(discarded, generation, "Decode flushed for seek");
                    self.emit(DecodeEvent::Flushed { generation }).await
                },
                PipelinePacket::EndOfStream => self.drain().await,
            };
            if !keep_going {
                break;
            }
        }
        self.decoders.clear();
        debug!("Decode task finished");
    }

    /// A seek was requested after the last applied `Flush`.
    fn is_stale(&self) -> bool {
        self.epoch.current() != self.generation
    }

    async fn emit(&self, event: DecodeEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn configure(&mut self, info: &StreamInfo) -> bool {
        self.decoders.clear();
        self.consecutive_failures = 0;
        let mut kinds: SmallVec<[MediaKind; 2]> = SmallVec::new();
        for stream in &info.streams {
            match self.registry.create(stream, &self.ctx) {
                None => {
                    warn!(
                        stream = stream.index,
                        kind = stream.kind.as_str(),
                        codec = ?stream.codec,
                        "No decoder registered; ignoring stream"
                    );
                },
                Some(Err(e)) => {
                    warn!(stream = stream.index, error = %e, "Failed to create decoder; ignoring stream");
                },
                Some(Ok(decoder)) => {
                    if kinds.contains(&stream.kind) {
                        // One queue per kind: extra tracks of the same kind are not played.
                        debug!(stream = stream.index, "Ignoring additional {} stream", stream.kind.as_str());
                        continue;
                    }
                    kinds.push(stream.kind);
                    self.decoders.insert(stream.index, decoder);
                },
            }
        }

        if kinds.is_empty() {
            self.emit(DecodeEvent::Failed(MediaCoreError::DecodeFailure(
                "no decodable streams in source".to_string(),
            )))
            .await;
            return false;
        }
        info!(kinds = ?kinds, "Decoders ready");
        self.emit(DecodeEvent::Layout(kinds)).await
    }

    async fn decode(&mut self, packet: &EncodedPacket) -> bool {
        let Some(decoder) = self.decoders.get_mut(&packet.stream_index) else {
            trace!(stream = packet.stream_index, "Dropping packet for ignored stream");
            return true;
        };

        match decoder.decode(packet) {
            Ok(frames) => {
                self.consecutive_failures = 0;
                self.packets_counter.add(1, &[KeyValue::new("status", "ok")]);
                for frame in frames {
                    if !self.push(frame).await {
                        return false;
                    }
                }
                true
            },
            Err(e) => {
                self.consecutive_failures += 1;
                PlayoutCounters::inc(&self.counters.decode_errors);
                self.packets_counter.add(1, &[KeyValue::new("status", "error")]);
                warn!(
                    ts_us = packet.timestamp_us,
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "Skipping undecodable packet"
                );
                if self.consecutive_failures >= self.config.decode_failure_threshold {
                    let err = MediaCoreError::DecodeFailure(format!(
                        "{} consecutive packets failed to decode (last: {e})",
                        self.consecutive_failures
                    ));
                    self.emit(DecodeEvent::Failed(err)).await;
                    return false;
                }
                true
            },
        }
    }

    /// Returns `false` when the session is shutting down.
    async fn push(&self, frame: Frame) -> bool {
        let queue = self.queues.get(frame.kind());
        let timeout = self.config.push_timeout();
        let mut frame = frame;
        loop {
            if self.is_stale() {
                trace!(kind = queue.kind().as_str(), "Discarding frame decoded before a seek");
                return true;
            }
            match queue.push(frame, timeout).await {
                PushOutcome::Queued => return true,
                PushOutcome::DroppedLate => {
                    trace!(kind = queue.kind().as_str(), "Frame arrived behind playout; dropped");
                    return true;
                },
                PushOutcome::EvictedOldest(n) => {
                    trace!(kind = queue.kind().as_str(), evicted = n, "Queue full; evicted oldest");
                    return true;
                },
                PushOutcome::TimedOut(back) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    frame = back;
                },
                PushOutcome::Closed => return false,
            }
        }
    }

    async fn drain(&mut self) -> bool {
        let mut held = Vec::new();
        for decoder in self.decoders.values_mut() {
            held.extend(decoder.flush());
        }
        for frame in held {
            if !self.push(frame).await {
                return false;
            }
        }
        if self.is_stale() {
            return true;
        }
        self.queues.mark_eos();
        debug!("Decode drained");
        // Stay alive: a seek after end of stream sends Flush and new packets.
        self.emit(DecodeEvent::Drained).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mediacore_core::{
        AllocationCounter, AudioBufferPool, BackpressurePolicy, CodecId, PixelFormat,
        StreamDescriptor, VideoBufferPool,
    };
    use std::time::Duration;

    struct Harness {
        packets: mpsc::Sender<PipelinePacket>,
        events: mpsc::Receiver<DecodeEvent>,
        queues: DecodeQueues,
        counters: Arc<PlayoutCounters>,
        cancel: CancellationToken,
        epoch: Arc<SeekEpoch>,
        handle: JoinHandle<()>,
        allocations: AllocationCounter,
    }

    fn start(capacity: usize, policy: BackpressurePolicy, threshold: u32) -> Harness {
        let (packet_tx, packet_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(64);
        let allocations = AllocationCounter::new();
        let ctx = DecodeContext {
            audio_pool: AudioBufferPool::audio_default(allocations.clone()),
            video_pool: VideoBufferPool::video_default(allocations.clone()),
        };
        let queues = DecodeQueues {
            audio: Arc::new(FrameQueue::new(MediaKind::Audio, capacity, 4, policy)),
            video: Arc::new(FrameQueue::new(MediaKind::Video, capacity, 4, policy)),
        };
        let counters = Arc::new(PlayoutCounters::new());
        let cancel = CancellationToken::new();
        let epoch = Arc::new(SeekEpoch::new());
        let config = DecodeConfig {
            backpressure: policy,
            push_timeout_ms: 10,
            decode_failure_threshold: threshold,
        };
        let handle = DecodeTask::spawn(
            packet_rx,
            Arc::new(DecoderRegistry::with_builtins()),
            ctx,
            queues.clone(),
            config,
            event_tx,
            counters.clone(),
            cancel.clone(),
            epoch.clone(),
        );
        Harness { packets: packet_tx, events, queues, counters, cancel, epoch, handle, allocations }
    }

    fn layout() -> StreamInfo {
        StreamInfo {
            streams: vec![
                StreamDescriptor {
                    index: 0,
                    kind: MediaKind::Audio,
                    codec: CodecId::PcmS16Le,
                    sample_rate: Some(8_000),
                    channels: Some(1),
                    width: None,
                    height: None,
                },
                StreamDescriptor {
                    index: 1,
                    kind: MediaKind::Video,
                    codec: CodecId::H264,
                    sample_rate: None,
                    channels: None,
                    width: None,
                    height: None,
                },
            ],
            seekable: false,
            duration_us: None,
        }
    }

    fn audio(ts_us: u64, bytes: usize) -> PipelinePacket {
        PipelinePacket::Packet(EncodedPacket {
            kind: MediaKind::Audio,
            stream_index: 0,
            codec: CodecId::PcmS16Le,
            timestamp_us: ts_us,
            duration_us: None,
            keyframe: true,
            data: Bytes::from(vec![0u8; bytes]),
        })
    }

    #[tokio::test]
    async fn ignores_streams_without_decoder() {
        let mut h = start(8, BackpressurePolicy::Block, 25);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        match h.events.recv().await.unwrap() {
            DecodeEvent::Layout(kinds) => assert_eq!(kinds.as_slice(), &[MediaKind::Audio]),
            other => panic!("unexpected {other:?}"),
        }

        h.packets.send(audio(0, 160)).await.unwrap();
        h.packets
            .send(PipelinePacket::Packet(EncodedPacket {
                kind: MediaKind::Video,
                stream_index: 1,
                codec: CodecId::H264,
                timestamp_us: 0,
                duration_us: None,
                keyframe: true,
                data: Bytes::from_static(b"nal"),
            }))
            .await
            .unwrap();
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Drained));
        assert_eq!(h.queues.audio.len(), 1);
        assert!(h.queues.video.is_empty());
        assert!(h.queues.video.is_eos());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn consecutive_failures_escalate() {
        let mut h = start(8, BackpressurePolicy::Block, 3);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        h.events.recv().await.unwrap();

        // Odd byte counts cannot be S16 mono.
        h.packets.send(audio(0, 3)).await.unwrap();
        h.packets.send(audio(1, 160)).await.unwrap();
        for ts in 2..5 {
            h.packets.send(audio(ts, 3)).await.unwrap();
        }
        match h.events.recv().await.unwrap() {
            DecodeEvent::Failed(MediaCoreError::DecodeFailure(_)) => {},
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(PlayoutCounters::get(&h.counters.decode_errors), 4);
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn flush_clears_queues_and_reports() {
        let mut h = start(8, BackpressurePolicy::Block, 25);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        h.events.recv().await.unwrap();
        for i in 0..3 {
            h.packets.send(audio(i * 10_000, 160)).await.unwrap();
        }
        let generation = h.epoch.advance();
        h.packets.send(PipelinePacket::Flush { generation }).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Flushed { generation: 1 }));
        assert!(h.queues.audio.is_empty());
        assert_eq!(h.allocations.live(), 0);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn seek_releases_push_blocked_on_full_queue() {
        let mut h = start(2, BackpressurePolicy::Block, 25);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        h.events.recv().await.unwrap();
        for i in 0..4 {
            h.packets.send(audio(i * 10_000, 160)).await.unwrap();
        }
        while h.queues.audio.len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Nobody consumes; only the epoch bump can unblock the pending push.
        let generation = h.epoch.advance();
        h.packets.send(audio(40_000, 160)).await.unwrap();
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();
        h.packets.send(PipelinePacket::Flush { generation }).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Flushed { generation: 1 }));
        assert!(h.queues.audio.is_empty());
        assert!(!h.queues.audio.is_eos());

        h.packets.send(audio(0, 160)).await.unwrap();
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Drained));
        assert_eq!(h.queues.audio.len(), 1);
        assert_eq!(h.queues.audio.peek_ts(), Some(0));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn block_policy_waits_for_consumer() {
        let mut h = start(2, BackpressurePolicy::Block, 25);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        h.events.recv().await.unwrap();
        for i in 0..5 {
            h.packets.send(audio(i * 10_000, 160)).await.unwrap();
        }
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 5 {
            match h.queues.audio.pop() {
                Some(frame) => seen.push(frame.timestamp_us()),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        assert_eq!(seen, vec![0, 10_000, 20_000, 30_000, 40_000]);
        assert_eq!(h.queues.audio.stats().dropped(), 0);
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Drained));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn low_latency_policy_evicts_oldest() {
        let mut h = start(2, BackpressurePolicy::LowLatency, 25);
        h.packets.send(PipelinePacket::Streams(layout())).await.unwrap();
        h.events.recv().await.unwrap();
        for i in 0..5 {
            h.packets.send(audio(i * 10_000, 160)).await.unwrap();
        }
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Drained));

        assert_eq!(h.queues.audio.len(), 2);
        assert_eq!(h.queues.audio.stats().dropped_evicted, 3);
        assert_eq!(h.queues.audio.peek_ts(), Some(30_000));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn raw_video_reaches_queue() {
        let mut h = start(4, BackpressurePolicy::Block, 25);
        let info = StreamInfo {
            streams: vec![StreamDescriptor {
                index: 0,
                kind: MediaKind::Video,
                codec: CodecId::RawVideo(PixelFormat::Rgba),
                sample_rate: None,
                channels: None,
                width: Some(2),
                height: Some(2),
            }],
            seekable: false,
            duration_us: None,
        };
        h.packets.send(PipelinePacket::Streams(info)).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Layout(_)));
        h.packets
            .send(PipelinePacket::Packet(EncodedPacket {
                kind: MediaKind::Video,
                stream_index: 0,
                codec: CodecId::RawVideo(PixelFormat::Rgba),
                timestamp_us: 40_000,
                duration_us: Some(40_000),
                keyframe: true,
                data: Bytes::from(vec![255u8; 16]),
            }))
            .await
            .unwrap();
        h.packets.send(PipelinePacket::EndOfStream).await.unwrap();
        assert!(matches!(h.events.recv().await.unwrap(), DecodeEvent::Drained));
        assert_eq!(h.queues.video.buffered_us(), 40_000);
        h.cancel.cancel();
        h.handle.await.unwrap();
    }
}
