// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-session ingest task.

use super::{IngestControl, IngestEvent, MediaSource, OpenContext, PipelinePacket, Transport};
use mediacore_core::{IngestCounters, IngestState, MediaCoreError, Result, SourceUri};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

/// Handle held by the playout actor.
pub struct IngestHandle {
    control: mpsc::Sender<IngestControl>,
    join: JoinHandle<()>,
}

impl IngestHandle {
    /// Requests a reposition. Returns false if the task is gone or its control queue is full.
    pub fn seek(&self, position_us: u64, generation: u64) -> bool {
        self.control.try_send(IngestControl::Seek { position_us, generation }).is_ok()
    }

    /// Waits for the task to exit (after its cancellation token fires).
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!("Ingest task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Drives one source through the ingest state machine.
pub struct IngestTask {
    uri: SourceUri,
    transport: Arc<dyn Transport>,
    ctx: OpenContext,
    packets: mpsc::Sender<PipelinePacket>,
    events: mpsc::Sender<IngestEvent>,
    control: mpsc::Receiver<IngestControl>,
    counters: Arc<IngestCounters>,
    cancel: CancellationToken,
    state: IngestState,
    /// Control received while blocked on a full packet channel.
    pending_control: Option<IngestControl>,
}

enum Step {
    Continue,
    /// A seek arrived before the item could be queued; the item was dropped.
    Superseded,
    Stop,
}

impl IngestTask {
    /// Spawns the task on the current runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        uri: SourceUri,
        transport: Arc<dyn Transport>,
        ctx: OpenContext,
        packets: mpsc::Sender<PipelinePacket>,
        events: mpsc::Sender<IngestEvent>,
        counters: Arc<IngestCounters>,
        cancel: CancellationToken,
    ) -> IngestHandle {
        let (control_tx, control_rx) = mpsc::channel(4);
        let span = tracing::info_span!("ingest", uri = %uri);
        let task = Self {
            uri,
            transport,
            ctx,
            packets,
            events,
            control: control_rx,
            counters,
            cancel,
            state: IngestState::Idle,
            pending_control: None,
        };
        let join = tokio::spawn(task.run().instrument(span));
        IngestHandle { control: control_tx, join }
    }

    async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => {
                self.set_state(IngestState::Closed).await;
                debug!("Ingest task finished");
            },
            Err(e) => {
                warn!(error = %e, "Ingest failed");
                self.set_state(IngestState::Error).await;
                let _ = self.events.send(IngestEvent::Failed(e)).await;
            },
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.set_state(IngestState::Connecting).await;
        let Some(mut source) = self.open_source().await? else {
            return Ok(());
        };
        self.on_connected(source.as_ref()).await;

        let prebuffer = self.ctx.config.prebuffer_packets;
        let mut since_connect = 0usize;
        let mut eos = false;

        loop {
            let control = match self.pending_control.take() {
                Some(control) => Some(control),
                // Stay around after end of stream so a seek can restart reading.
                None if eos => tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Ok(()),
                    control = self.control.recv() => match control {
                        Some(control) => Some(control),
                        None => return Ok(()),
                    },
                },
                None => None,
            };
            if let Some(IngestControl::Seek { position_us, generation }) = control {
                if self.seek(source.as_mut(), position_us, generation).await {
                    since_connect = 0;
                    eos = false;
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                control = self.control.recv() => {
                    match control {
                        Some(control) => self.pending_control = Some(control),
                        None => return Ok(()),
                    }
                    continue;
                },
                next = source.next_packet() => next,
            };

            match next {
                Ok(Some(packet)) => {
                    self.counters.record_packet(packet.data.len(), packet.timestamp_us, Instant::now());
                    if let Some(rtt) = source.rtt_ms() {
                        self.counters.set_rtt_ms(rtt);
                    }
                    if let Step::Stop = self.forward(PipelinePacket::Packet(packet)).await {
                        return Ok(());
                    }
                    since_connect += 1;
                    if self.state == IngestState::Buffering && since_connect >= prebuffer {
                        self.set_state(IngestState::Ready).await;
                    }
                },
                Ok(None) => {
                    info!("Source reached end of stream");
                    if self.state == IngestState::Buffering {
                        self.set_state(IngestState::Ready).await;
                    }
                    match self.forward(PipelinePacket::EndOfStream).await {
                        Step::Stop => return Ok(()),
                        Step::Superseded => continue,
                        Step::Continue => {},
                    }
                    self.emit(IngestEvent::EndOfStream).await;
                    eos = true;
                },
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Source interrupted, reconnecting");
                    match self.reconnect(e).await? {
                        Some(new_source) => {
                            source = new_source;
                            since_connect = 0;
                        },
                        None => return Ok(()),
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Opens the source under the connect timeout. `Ok(None)` means cancelled.
    async fn open_source(&self) -> Result<Option<Box<dyn MediaSource>>> {
        let timeout = self.ctx.config.connect_timeout();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(None),
            opened = tokio::time::timeout(timeout, self.transport.open(&self.uri, &self.ctx)) => {
                match opened {
                    Ok(Ok(source)) => Ok(Some(source)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(MediaCoreError::Timeout(format!(
                        "connecting to {} exceeded {} ms",
                        self.uri,
                        timeout.as_millis()
                    ))),
                }
            },
        }
    }

    async fn on_connected(&mut self, source: &dyn MediaSource) {
        let info = source.stream_info().clone();
        info!(streams = info.streams.len(), seekable = info.seekable, "Source connected");
        self.set_state(IngestState::Connected).await;
        self.emit(IngestEvent::Connected(info.clone())).await;
        let _ = self.forward(PipelinePacket::Streams(info)).await;
        self.set_state(IngestState::Buffering).await;
    }

    /// Bounded reconnect with exponential backoff. `Ok(None)` means cancelled.
    async fn reconnect(&mut self, cause: MediaCoreError) -> Result<Option<Box<dyn MediaSource>>> {
        let policy = self.ctx.config.reconnect.clone();
        let mut last_error = cause;

        for attempt in 0..policy.max_attempts {
            self.set_state(IngestState::Connecting).await;
            let delay = policy.backoff(attempt);
            self.emit(IngestEvent::Reconnecting { attempt: attempt + 1, delay }).await;
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis(), "Reconnect scheduled");

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(delay) => {},
            }

            match self.open_source().await {
                Ok(Some(source)) => {
                    self.on_connected(source.as_ref()).await;
                    return Ok(Some(source));
                },
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    last_error = e;
                },
            }
        }

        Err(MediaCoreError::Network(format!(
            "gave up after {} reconnect attempts: {last_error}",
            policy.max_attempts
        )))
    }

    /// Returns true if the source was repositioned.
    ///
    /// A `Flush` marker for `generation` is queued whatever the outcome so decode stops
    /// discarding.
    async fn seek(&mut self, source: &mut dyn MediaSource, position_us: u64, generation: u64) -> bool {
        let result = if source.stream_info().seekable {
            source.seek(position_us).await
        } else {
            Err(MediaCoreError::Unsupported("source is not seekable".to_string()))
        };
        if let Step::Stop = self.forward(PipelinePacket::Flush { generation }).await {
            return false;
        }
        match result {
            Ok(()) => {
                debug!(position_us, generation, "Source repositioned");
                if self.state == IngestState::Ready {
                    self.set_state(IngestState::Buffering).await;
                }
                self.emit(IngestEvent::Seeked { position_us }).await;
                true
            },
            Err(e) => {
                warn!(error = %e, "Seek failed");
                self.emit(IngestEvent::SeekFailed(e)).await;
                false
            },
        }
    }

    /// Queues one item for decode while still servicing control, so a seek is never stuck
    /// behind a full channel. Stream layouts are never dropped.
    async fn forward(&mut self, packet: PipelinePacket) -> Step {
        let droppable = !matches!(packet, PipelinePacket::Streams(_));
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Step::Stop,
            control = self.control.recv(), if droppable && self.pending_control.is_none() => {
                match control {
                    Some(control) => {
                        trace!("Control arrived while forwarding, dropping stale item");
                        self.pending_control = Some(control);
                        Step::Superseded
                    },
                    None => Step::Stop,
                }
            },
            permit = self.packets.reserve() => match permit {
                Ok(permit) => {
                    permit.send(packet);
                    Step::Continue
                },
                Err(_) => Step::Stop,
            },
        }
    }

    async fn emit(&self, event: IngestEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Playout gone, dropping ingest event");
        }
    }

    async fn set_state(&mut self, next: IngestState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(from = self.state.as_str(), to = next.as_str(), "Ignoring ingest transition");
            return;
        }
        self.state = next;
        self.emit(IngestEvent::State(next)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ingest::DemuxerRegistry;
    use crate::test_utils::{ScriptStep, ScriptedTransport, StallingTransport};
    use mediacore_core::IngestConfig;
    use std::time::Duration;

    struct Harness {
        handle: IngestHandle,
        packets: mpsc::Receiver<PipelinePacket>,
        events: mpsc::Receiver<IngestEvent>,
        cancel: CancellationToken,
    }

    fn start(transport: Arc<dyn Transport>, uri: &str, config: IngestConfig) -> Harness {
        start_with_capacity(transport, uri, config, 64)
    }

    fn start_with_capacity(
        transport: Arc<dyn Transport>,
        uri: &str,
        config: IngestConfig,
        capacity: usize,
    ) -> Harness {
        let (packet_tx, packets) = mpsc::channel(capacity);
        let (event_tx, events) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let ctx = OpenContext { config, demuxers: Arc::new(DemuxerRegistry::with_builtins()) };
        let handle = IngestTask::spawn(
            SourceUri::parse(uri).unwrap(),
            transport,
            ctx,
            packet_tx,
            event_tx,
            Arc::new(IngestCounters::new()),
            cancel.clone(),
        );
        Harness { handle, packets, events, cancel }
    }

    async fn next_event(events: &mut mpsc::Receiver<IngestEvent>) -> IngestEvent {
        events.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_terminal() {
        let config = IngestConfig { connect_timeout_ms: 10_000, ..IngestConfig::default() };
        let mut h = start(Arc::new(StallingTransport), "rtmp://unreachable/live/demo", config);

        assert!(matches!(next_event(&mut h.events).await, IngestEvent::State(IngestState::Connecting)));
        let started = Instant::now();
        assert!(matches!(next_event(&mut h.events).await, IngestEvent::State(IngestState::Error)));
        assert!(started.elapsed() >= Duration::from_secs(10));
        match next_event(&mut h.events).await {
            IngestEvent::Failed(MediaCoreError::Timeout(_)) => {},
            other => panic!("unexpected {other:?}"),
        }
        h.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reaches_ready_after_prebuffer_then_eos() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::audio_packets(0, 5), ScriptStep::End]]);
        let config = IngestConfig { prebuffer_packets: 3, ..IngestConfig::default() };
        let mut h = start(Arc::new(transport), "synthetic://scripted", config);

        let mut states = Vec::new();
        loop {
            match next_event(&mut h.events).await {
                IngestEvent::State(s) => states.push(s),
                IngestEvent::EndOfStream => break,
                _ => {},
            }
        }
        assert_eq!(
            states,
            vec![
                IngestState::Connecting,
                IngestState::Connected,
                IngestState::Buffering,
                IngestState::Ready,
            ]
        );

        assert!(matches!(h.packets.recv().await, Some(PipelinePacket::Streams(_))));
        let mut count = 0;
        while let Some(p) = h.packets.recv().await {
            match p {
                PipelinePacket::Packet(_) => count += 1,
                PipelinePacket::EndOfStream => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(count, 5);

        h.cancel.cancel();
        h.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_reconnects_with_backoff() {
        let transport = ScriptedTransport::new(vec![
            vec![ScriptStep::audio_packets(0, 2), ScriptStep::Fail],
            vec![ScriptStep::audio_packets(40_000, 2), ScriptStep::End],
        ]);
        let mut h = start(Arc::new(transport), "synthetic://scripted", IngestConfig::default());

        let mut reconnects = Vec::new();
        let mut connects = 0;
        loop {
            match next_event(&mut h.events).await {
                IngestEvent::Connected(_) => connects += 1,
                IngestEvent::Reconnecting { attempt, delay } => reconnects.push((attempt, delay)),
                IngestEvent::EndOfStream => break,
                IngestEvent::Failed(e) => panic!("unexpected failure {e}"),
                _ => {},
            }
        }
        assert_eq!(connects, 2);
        assert_eq!(reconnects, vec![(1, Duration::from_millis(500))]);
        h.cancel.cancel();
        h.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_is_network_error() {
        // Every reopen after the first fails.
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::Fail]]);
        let mut h = start(Arc::new(transport), "synthetic://scripted", IngestConfig::default());

        let mut attempts = 0;
        loop {
            match next_event(&mut h.events).await {
                IngestEvent::Reconnecting { .. } => attempts += 1,
                IngestEvent::Failed(MediaCoreError::Network(_)) => break,
                IngestEvent::Failed(e) => panic!("unexpected {e}"),
                _ => {},
            }
        }
        assert_eq!(attempts, 3);
        h.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_reconnect() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::Fail]]);
        let config = IngestConfig {
            reconnect: mediacore_core::ReconnectConfig {
                max_attempts: 3,
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
            },
            ..IngestConfig::default()
        };
        let mut h = start(Arc::new(transport), "synthetic://scripted", config);
        loop {
            if let IngestEvent::Reconnecting { .. } = next_event(&mut h.events).await {
                break;
            }
        }
        h.cancel.cancel();
        h.handle.join().await;
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, IngestEvent::Failed(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seek_is_serviced_while_packet_channel_is_full() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::audio_packets(0, 200), ScriptStep::End]]);
        let mut h = start_with_capacity(Arc::new(transport), "synthetic://scripted", IngestConfig::default(), 4);

        // Nothing reads packets, so ingest parks on the full channel.
        while h.packets.capacity() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.handle.seek(2_000_000, 1));

        let mut first_after_flush = None;
        let mut flushed = false;
        while let Some(packet) = h.packets.recv().await {
            match packet {
                PipelinePacket::Flush { generation } => {
                    assert_eq!(generation, 1);
                    flushed = true;
                },
                PipelinePacket::Packet(p) if flushed => {
                    first_after_flush = Some(p.timestamp_us);
                    break;
                },
                _ => {},
            }
        }
        assert_eq!(first_after_flush, Some(2_000_000));

        loop {
            match next_event(&mut h.events).await {
                IngestEvent::Seeked { position_us } => {
                    assert_eq!(position_us, 2_000_000);
                    break;
                },
                IngestEvent::Failed(e) => panic!("unexpected failure {e}"),
                _ => {},
            }
        }
        h.cancel.cancel();
        h.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seek_still_queues_flush() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::audio_packets(0, 3), ScriptStep::End]]);
        let mut h = start(Arc::new(transport), "synthetic://scripted", IngestConfig::default());
        loop {
            if let IngestEvent::EndOfStream = next_event(&mut h.events).await {
                break;
            }
        }
        // Past the scripted range: the source refuses, decode still gets its marker.
        assert!(h.handle.seek(60_000_000, 7));
        loop {
            match next_event(&mut h.events).await {
                IngestEvent::SeekFailed(_) => break,
                IngestEvent::Seeked { .. } => panic!("seek past the end should fail"),
                _ => {},
            }
        }
        let mut saw_flush = false;
        while let Ok(packet) = h.packets.try_recv() {
            if let PipelinePacket::Flush { generation } = packet {
                assert_eq!(generation, 7);
                saw_flush = true;
            }
        }
        assert!(saw_flush);
        h.cancel.cancel();
        h.handle.join().await;
    }
}
