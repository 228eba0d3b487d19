// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-session playout actor (the session's control plane).
//!
//! The actor is the only writer of session state. It owns the current pipeline run
//! (ingest task, decode task and their report channels), drains the frame queues at the
//! cadence dictated by [`AvSync`], hands video to the bound renderer and audio to the
//! [`AudioSink`], and turns everything it observes into listener callbacks.

use crate::audio::AudioSink;
use crate::constants::{DECODE_EVENT_CAPACITY, INGEST_EVENT_CAPACITY};
use crate::dispatcher::CallbackSender;
use crate::registry::RendererRegistry;
use crate::session::SessionShared;
use crate::sync::{AvSync, VideoAction};
use mediacore_core::{
    AudioBufferPool, BufferLevels, ErrorCode, Frame, FrameQueue, IngestCounters, MediaCoreError,
    MediaKind, PlayerCommand, PlayerConfig, PlayerState, PlayoutCounters, SourceUri,
    StatsAggregator, Throttle, VideoBufferPool, VideoFrame,
};
use mediacore_nodes::decode::{
    DecodeContext, DecodeEvent, DecodeQueues, DecodeTask, DecoderRegistry, SeekEpoch,
};
use mediacore_nodes::ingest::{
    DemuxerRegistry, IngestEvent, IngestHandle, IngestTask, OpenContext, TransportRegistry,
};
use mediacore_nodes::render::{RenderEvent, SubmitOutcome};
use opentelemetry::{global, metrics::Counter, KeyValue};
use smallvec::SmallVec;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Registries a session resolves sources and codecs through.
#[derive(Clone)]
pub(crate) struct Stages {
    pub(crate) transports: Arc<TransportRegistry>,
    pub(crate) demuxers: Arc<DemuxerRegistry>,
    pub(crate) decoders: Arc<DecoderRegistry>,
}

/// One `start` → `stop`/`Finished`/`Error` cycle.
struct Run {
    cancel: CancellationToken,
    ingest: IngestHandle,
    decode: JoinHandle<()>,
    ingest_events: Option<mpsc::Receiver<IngestEvent>>,
    decode_events: Option<mpsc::Receiver<DecodeEvent>>,
    epoch: Arc<SeekEpoch>,
    /// Kinds with a working decoder; `None` until decode reports the layout.
    kinds: Option<SmallVec<[MediaKind; 2]>>,
    seekable: bool,
    ingest_eos: bool,
    drained: bool,
}

pub(crate) struct PlayoutActor {
    shared: Arc<SessionShared>,
    config: PlayerConfig,
    commands: mpsc::Receiver<PlayerCommand>,
    callbacks: CallbackSender,
    renderers: RendererRegistry,
    stages: Stages,
    decode_ctx: DecodeContext,
    queues: DecodeQueues,
    ingest_counters: Arc<IngestCounters>,
    sink: Box<dyn AudioSink>,
    sync: AvSync,
    stats: StatsAggregator,
    sync_ts: Throttle,
    render_events_tx: mpsc::UnboundedSender<RenderEvent>,
    render_events_rx: mpsc::UnboundedReceiver<RenderEvent>,
    cancel: CancellationToken,
    run: Option<Run>,
    state: PlayerState,
    muted: bool,
    last_progress: Instant,
    /// Return to `Paused` instead of `Buffering` once the pending seek completes.
    paused_before_seek: bool,
    transitions_counter: Counter<u64>,
    commands_counter: Counter<u64>,
}

impl PlayoutActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        config: PlayerConfig,
        commands: mpsc::Receiver<PlayerCommand>,
        callbacks: CallbackSender,
        renderers: RendererRegistry,
        stages: Stages,
        sink: Box<dyn AudioSink>,
        cancel: CancellationToken,
    ) -> Self {
        let queues = build_queues(&config);
        let decode_ctx = DecodeContext {
            audio_pool: AudioBufferPool::audio_default(shared.allocations.clone()),
            video_pool: VideoBufferPool::video_default(shared.allocations.clone()),
        };
        let (render_events_tx, render_events_rx) = mpsc::unbounded_channel();
        let meter = global::meter("mediacore_engine");
        Self {
            sync: AvSync::from_config(&config.playout),
            stats: StatsAggregator::new(shared.id),
            sync_ts: Throttle::new(Duration::from_millis(config.playout.sync_ts_interval_ms)),
            muted: shared.is_muted(),
            shared,
            config,
            commands,
            callbacks,
            renderers,
            stages,
            decode_ctx,
            queues,
            ingest_counters: Arc::new(IngestCounters::new()),
            sink,
            render_events_tx,
            render_events_rx,
            cancel,
            run: None,
            state: PlayerState::Idle,
            last_progress: Instant::now(),
            paused_before_seek: false,
            transitions_counter: meter
                .u64_counter("player.state_transitions")
                .with_description("Session state transitions")
                .build(),
            commands_counter: meter
                .u64_counter("player.commands")
                .with_description("Control commands processed by the playout actor")
                .build(),
        }
    }

    /// Spawns the actor. `done` is signalled after the actor has released everything it
    /// owns (and is dropped unsignalled if the runtime goes away first).
    pub(crate) fn spawn(self, runtime: &Handle, done: SyncSender<()>) -> JoinHandle<()> {
        let span = tracing::info_span!("session", id = %self.shared.id);
        runtime.spawn(
            async move {
                self.run().await;
                let _ = done.send(());
            }
            .instrument(span),
        )
    }

    async fn run(mut self) {
        debug!("Playout actor started");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.playout.tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_ticker =
            tokio::time::interval(Duration::from_millis(self.config.playout.stats_interval_ms));
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_stage_event(&mut self.run) => match event {
                    StageEvent::Ingest(event) => self.on_ingest_event(event).await,
                    StageEvent::Decode(event) => self.on_decode_event(event).await,
                },
                Some(event) = self.render_events_rx.recv() => self.on_render_event(event),
                _ = ticker.tick() => self.on_tick().await,
                _ = stats_ticker.tick() => self.emit_statistics(),
            }
        }

        self.teardown_run().await;
        debug!(
            live_buffers = self.shared.allocations.live(),
            "Playout actor stopped"
        );
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        let is_start = matches!(command, PlayerCommand::Start { .. });
        self.dispatch_command(command).await;
        if is_start {
            self.shared.release_start();
        }
    }

    async fn dispatch_command(&mut self, command: PlayerCommand) {
        let name = command.name();
        if !self.state.accepts(&command) {
            warn!(command = name, state = %self.state, "Rejecting command");
            self.commands_counter
                .add(1, &[KeyValue::new("command", name), KeyValue::new("status", "rejected")]);
            self.callbacks.state(self.state, ErrorCode::InvalidStateTransition);
            return;
        }
        self.commands_counter
            .add(1, &[KeyValue::new("command", name), KeyValue::new("status", "accepted")]);

        match command {
            PlayerCommand::Start { uri } => self.start_run(uri).await,
            PlayerCommand::Pause => {
                self.sync.freeze();
                self.transition(PlayerState::Paused, ErrorCode::Ok);
            },
            PlayerCommand::Resume => {
                self.last_progress = Instant::now();
                if self.sync.is_anchored() {
                    self.sync.run();
                    self.transition(PlayerState::Playing, ErrorCode::Ok);
                } else {
                    self.transition(PlayerState::Buffering, ErrorCode::Ok);
                }
            },
            PlayerCommand::Stop => {
                self.teardown_run().await;
                self.transition(PlayerState::Stopped, ErrorCode::Ok);
            },
            PlayerCommand::Seek { position_us } => self.begin_seek(position_us),
            PlayerCommand::SetMute(muted) => {
                if self.muted != muted {
                    info!(muted, "Mute changed");
                }
                self.muted = muted;
                self.shared.set_muted(muted);
            },
        }
    }

    async fn start_run(&mut self, uri: SourceUri) {
        let Some(transport) = self.stages.transports.get(uri.scheme()) else {
            // `Player::start` checks the scheme before queueing.
            warn!(scheme = uri.scheme(), "No transport for scheme");
            self.callbacks.state(self.state, ErrorCode::InvalidArgument);
            return;
        };
        self.teardown_run().await;

        info!(uri = %uri, "Starting playback");
        self.shared.set_last_error(None);
        self.shared.set_source(Some(uri.clone()));
        self.queues.audio.reopen();
        self.queues.video.reopen();
        self.sync = AvSync::from_config(&self.config.playout);
        self.sync_ts.reset();
        self.stats.reset_window(&self.ingest_counters, &self.shared.counters);

        let cancel = self.cancel.child_token();
        let (packets_tx, packets_rx) = mpsc::channel(self.config.resolved_packet_channel_capacity());
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_EVENT_CAPACITY);
        let (decode_tx, decode_rx) = mpsc::channel(DECODE_EVENT_CAPACITY);
        let epoch = Arc::new(SeekEpoch::new());

        let ingest = IngestTask::spawn(
            uri,
            transport,
            OpenContext { config: self.config.ingest.clone(), demuxers: self.stages.demuxers.clone() },
            packets_tx,
            ingest_tx,
            self.ingest_counters.clone(),
            cancel.clone(),
        );
        let decode = DecodeTask::spawn(
            packets_rx,
            self.stages.decoders.clone(),
            self.decode_ctx.clone(),
            self.queues.clone(),
            self.config.decode.clone(),
            decode_tx,
            self.shared.counters.clone(),
            cancel.clone(),
            epoch.clone(),
        );

        self.run = Some(Run {
            cancel,
            ingest,
            decode,
            ingest_events: Some(ingest_rx),
            decode_events: Some(decode_rx),
            epoch,
            kinds: None,
            seekable: false,
            ingest_eos: false,
            drained: false,
        });
        self.transition(PlayerState::Connecting, ErrorCode::Ok);
    }

    fn begin_seek(&mut self, position_us: u64) {
        let Some(run) = self.run.as_ref() else {
            self.callbacks.state(self.state, ErrorCode::InvalidStateTransition);
            return;
        };
        if !run.seekable {
            warn!(position_us, "Source is not seekable");
            self.callbacks.state(self.state, ErrorCode::Unsupported);
            return;
        }
        // From here decode discards everything until the matching Flush marker.
        let generation = run.epoch.advance();
        if !run.ingest.seek(position_us, generation) {
            run.epoch.retract();
            warn!(position_us, "Ingest did not accept the seek request");
            self.callbacks.state(self.state, ErrorCode::Internal);
            return;
        }

        debug!(position_us, generation, "Seeking");
        self.paused_before_seek = self.state == PlayerState::Paused;
        self.sync.reset();
        self.sync_ts.reset();
        let discarded = self.queues.flush();
        self.sink.flush();
        trace!(discarded, "Flushed frame queues for seek");
        self.transition(PlayerState::Seeking, ErrorCode::Ok);
    }

    async fn on_ingest_event(&mut self, event: IngestEvent) {
        match event {
            IngestEvent::State(state) => trace!(ingest_state = state.as_str(), "Ingest state"),
            IngestEvent::Connected(info) => {
                if let Some(run) = self.run.as_mut() {
                    run.seekable = info.seekable;
                }
                if self.state == PlayerState::Connecting {
                    self.transition(PlayerState::Buffering, ErrorCode::Ok);
                }
            },
            IngestEvent::Reconnecting { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis(), "Source reconnecting");
            },
            IngestEvent::Seeked { position_us } => {
                // Anything ingest said about end of stream before this point is stale.
                if let Some(run) = self.run.as_mut() {
                    run.ingest_eos = false;
                }
                debug!(position_us, "Source repositioned");
            },
            IngestEvent::SeekFailed(e) => {
                warn!(error = %e, "Seek failed");
                if self.state == PlayerState::Seeking {
                    let next = self.after_seek_state();
                    self.transition(next, e.code());
                } else {
                    self.callbacks.state(self.state, e.code());
                }
            },
            IngestEvent::EndOfStream => {
                if let Some(run) = self.run.as_mut() {
                    run.ingest_eos = true;
                }
            },
            IngestEvent::Failed(e) => self.fail(e).await,
        }
    }

    async fn on_decode_event(&mut self, event: DecodeEvent) {
        match event {
            DecodeEvent::Layout(kinds) => {
                debug!(kinds = ?kinds, "Decoding stream layout");
                self.sync.set_audio_present(kinds.contains(&MediaKind::Audio));
                if let Some(run) = self.run.as_mut() {
                    run.kinds = Some(kinds);
                }
            },
            DecodeEvent::Flushed { generation } => {
                let Some(run) = self.run.as_mut() else { return };
                if generation != run.epoch.current() {
                    trace!(generation, "Ignoring flush for a superseded seek");
                    return;
                }
                run.drained = false;
                if self.state == PlayerState::Seeking {
                    let next = self.after_seek_state();
                    self.transition(next, ErrorCode::Ok);
                }
            },
            DecodeEvent::Drained => {
                if let Some(run) = self.run.as_mut() {
                    run.drained = true;
                }
            },
            DecodeEvent::Failed(e) => self.fail(e).await,
        }
    }

    fn on_render_event(&self, event: RenderEvent) {
        match event {
            RenderEvent::ResolutionChanged { width, height } => {
                info!(width, height, "Resolution changed");
                self.callbacks.resolution(height, width);
            },
        }
    }

    const fn after_seek_state(&self) -> PlayerState {
        if self.paused_before_seek {
            PlayerState::Paused
        } else {
            PlayerState::Buffering
        }
    }

    async fn on_tick(&mut self) {
        match self.state {
            PlayerState::Playing | PlayerState::Stuck => self.consume().await,
            PlayerState::Buffering => self.check_recovery().await,
            _ => {},
        }
    }

    fn kinds(&self) -> Option<SmallVec<[MediaKind; 2]>> {
        self.run.as_ref().and_then(|run| run.kinds.clone())
    }

    fn finished(&self, kinds: &[MediaKind]) -> bool {
        self.run.as_ref().is_some_and(|run| {
            run.ingest_eos
                && run.drained
                && kinds.iter().all(|kind| self.queues.get(*kind).is_empty())
        })
    }

    fn earliest_queued(&self, kinds: &[MediaKind]) -> Option<u64> {
        kinds.iter().filter_map(|kind| self.queues.get(*kind).peek_ts()).min()
    }

    async fn consume(&mut self) {
        let Some(kinds) = self.kinds() else { return };
        let mut progressed = false;

        if kinds.contains(&MediaKind::Audio) {
            progressed |= self.consume_audio();
        }
        if kinds.contains(&MediaKind::Video) {
            progressed |= self.consume_video();
        }

        let now = Instant::now();
        if progressed {
            self.last_progress = now;
            if self.state == PlayerState::Stuck {
                self.transition(PlayerState::Playing, ErrorCode::Ok);
            }
        }

        if self.finished(&kinds) {
            self.finish().await;
            return;
        }

        let underflow = kinds.iter().any(|kind| {
            let queue = self.queues.get(*kind);
            queue.is_empty() && !queue.is_eos()
        });
        if underflow {
            debug!(position_us = self.sync.position_us(), "Queue underflow");
            self.sync.freeze();
            self.transition(PlayerState::Buffering, ErrorCode::Ok);
            return;
        }

        let stuck_after = Duration::from_millis(self.config.playout.stuck_timeout_ms);
        if self.state == PlayerState::Playing && now.duration_since(self.last_progress) >= stuck_after {
            warn!(
                position_us = self.sync.position_us(),
                stalled_ms = stuck_after.as_millis(),
                "No frame consumed, playout is stuck"
            );
            self.transition(PlayerState::Stuck, ErrorCode::Timeout);
            // Retry from whatever is queued rather than waiting on a clock that lost track.
            if let Some(ts) = self.earliest_queued(&kinds) {
                self.sync.anchor(ts);
            }
            self.last_progress = now;
        }
    }

    fn consume_audio(&mut self) -> bool {
        let mut progressed = false;
        while let Some(ts) = self.queues.audio.peek_ts() {
            if !self.sync.audio_due(ts) {
                break;
            }
            let Some(Frame::Audio(frame)) = self.queues.audio.pop() else { break };
            self.sync.on_audio_presented(ts);
            if !self.muted {
                self.sink.play(&frame);
            }
            PlayoutCounters::inc(&self.shared.counters.audio_presented);
            progressed = true;
        }
        progressed
    }

    /// Presents at most one video frame per tick, dropping any that are too late.
    fn consume_video(&mut self) -> bool {
        let mut progressed = false;
        while let Some(ts) = self.queues.video.peek_ts() {
            match self.sync.classify_video(ts) {
                VideoAction::Wait => break,
                VideoAction::Drop => {
                    drop(self.queues.video.pop());
                    PlayoutCounters::inc(&self.shared.counters.dropped_late);
                    trace!(ts, clock_us = self.sync.position_us(), "Dropped late video frame");
                    progressed = true;
                },
                VideoAction::Present => {
                    if let Some(Frame::Video(frame)) = self.queues.video.pop() {
                        self.present_video(frame);
                    }
                    progressed = true;
                    break;
                },
            }
        }
        progressed
    }

    fn present_video(&mut self, frame: VideoFrame) {
        PlayoutCounters::inc(&self.shared.counters.video_presented);
        if self.sync_ts.ready() {
            self.callbacks.sync_ts(self.sync.position_us());
        }

        let Some(renderer) = self.shared.renderer().and_then(|id| self.renderers.get(id)) else {
            // Audio-only presentation: the frame only advanced the timeline.
            return;
        };
        match renderer.submit(frame, Some(self.render_events_tx.clone())) {
            SubmitOutcome::Queued => {},
            SubmitOutcome::QueueFull => {
                PlayoutCounters::inc(&self.shared.counters.dropped_renderer);
                trace!(renderer = %renderer.id(), "Render queue full, frame dropped");
            },
            SubmitOutcome::Closed => {
                PlayoutCounters::inc(&self.shared.counters.dropped_renderer);
                debug!(renderer = %renderer.id(), "Renderer closed, frame dropped");
            },
        }
    }

    async fn check_recovery(&mut self) {
        let Some(kinds) = self.kinds() else { return };
        if self.finished(&kinds) {
            self.finish().await;
            return;
        }

        let prebuffer_us = self.config.resolved_prebuffer_us();
        let ready = kinds.iter().all(|kind| {
            let queue = self.queues.get(*kind);
            queue.is_eos() || queue.buffered_us() >= prebuffer_us || queue.len() >= queue.capacity()
        });
        if !ready {
            return;
        }

        if !self.sync.is_anchored() {
            let Some(ts) = self.earliest_queued(&kinds) else { return };
            debug!(anchor_us = ts, master = ?self.sync.master(), "Anchoring playback clock");
            self.sync.anchor(ts);
        }
        self.sync.run();
        self.last_progress = Instant::now();
        self.transition(PlayerState::Playing, ErrorCode::Ok);
    }

    async fn finish(&mut self) {
        info!(position_us = self.sync.position_us(), "Playback finished");
        self.teardown_run().await;
        self.transition(PlayerState::Finished, ErrorCode::Ok);
    }

    async fn fail(&mut self, e: MediaCoreError) {
        error!(error = %e, state = %self.state, "Session failed");
        let code = e.code();
        self.shared.set_last_error(Some((code, e.to_string())));
        self.teardown_run().await;
        self.transition(PlayerState::Error, code);
    }

    /// Cancels the current run, waits for its tasks and releases every queued frame.
    async fn teardown_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
            // Wakes a decode task blocked on a full queue.
            self.queues.audio.close();
            self.queues.video.close();
            run.ingest.join().await;
            if let Err(e) = run.decode.await {
                warn!("Decode task ended abnormally: {e}");
            }
        }
        self.queues.flush();
        self.sink.flush();
        self.sync.freeze();
    }

    fn emit_statistics(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let audio = &self.queues.audio;
        let video = &self.queues.video;
        let levels = BufferLevels {
            audio_buffered_ms: audio.buffered_us() / 1000,
            video_buffered_frames: video.len(),
            video_buffered_ms: video.buffered_us() / 1000,
            dropped_in_queues: audio.stats().dropped() + video.stats().dropped(),
            dropped_detached: self
                .shared
                .renderer()
                .and_then(|id| self.renderers.get(id))
                .map_or(0, |renderer| renderer.stats().dropped_detached),
        };
        let snapshot = self.stats.snapshot(
            &self.ingest_counters,
            &self.shared.counters,
            levels,
            self.sync.position_us(),
        );
        trace!(fps = snapshot.fps, bitrate_kbps = snapshot.bitrate_kbps, "Statistics");
        self.callbacks.statistics(snapshot);
    }

    fn transition(&mut self, next: PlayerState, code: ErrorCode) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Refusing illegal state transition");
            return;
        }
        info!(from = %self.state, to = %next, code = %code, "State transition");
        self.state = next;
        self.shared.set_state(next);
        self.transitions_counter.add(1, &[KeyValue::new("state", next.as_str())]);
        self.callbacks.state(next, code);
    }
}

fn build_queues(config: &PlayerConfig) -> DecodeQueues {
    let queue = |kind, capacity| {
        Arc::new(FrameQueue::new(
            kind,
            capacity,
            config.playout.reorder_window,
            config.decode.backpressure,
        ))
    };
    DecodeQueues {
        audio: queue(MediaKind::Audio, config.resolved_audio_queue_capacity()),
        video: queue(MediaKind::Video, config.resolved_video_queue_capacity()),
    }
}

enum StageEvent {
    Ingest(IngestEvent),
    Decode(DecodeEvent),
}

/// Next report from either worker of the current run; pending while there is none.
async fn next_stage_event(run: &mut Option<Run>) -> StageEvent {
    let Some(run) = run.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if run.ingest_events.is_none() && run.decode_events.is_none() {
            return std::future::pending().await;
        }
        tokio::select! {
            biased;
            event = recv_or_pending(&mut run.ingest_events) => match event {
                Some(event) => return StageEvent::Ingest(event),
                // Ingest task has exited; stop polling its channel.
                None => run.ingest_events = None,
            },
            event = recv_or_pending(&mut run.decode_events) => match event {
                Some(event) => return StageEvent::Decode(event),
                None => run.decode_events = None,
            },
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
