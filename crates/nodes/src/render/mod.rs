// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Renderer.
//!
//! Each [`Renderer`] owns a dedicated OS thread that binds the host's [`GpuContext`] and is
//! the only place a [`RenderSurface`] is touched. Everything else (attach, frames from the
//! playout actor, snapshot requests) is marshalled to that thread over a bounded command
//! channel.

use mediacore_core::{MediaCoreError, RenderConfig, RendererId, Result, VideoFrame};
use opentelemetry::{global, metrics::Counter, KeyValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub mod headless;
pub mod snapshot;
pub mod surface;

pub use headless::{HeadlessGpuContext, HeadlessMonitor, HeadlessStats, HeadlessSurface};
pub use snapshot::{SnapshotRequest, MAX_OUTSTANDING_SNAPSHOTS};
pub use surface::{GpuContext, RenderSurface};

use snapshot::{PendingSnapshot, SlotGuard, SnapshotSlots};

/// Render thread → playout notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// The rendered resolution changed. Sent once per change.
    ResolutionChanged { width: u32, height: u32 },
}

/// Result of handing a frame to the render thread without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Render thread is behind; the frame was not queued.
    QueueFull,
    /// Renderer has shut down.
    Closed,
}

/// Counters readable from any thread.
#[derive(Debug, Default)]
struct SharedStats {
    rendered: AtomicU64,
    dropped_detached: AtomicU64,
    render_errors: AtomicU64,
    snapshots: AtomicU64,
    snapshot_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub rendered: u64,
    /// Frames that arrived while no surface was attached.
    pub dropped_detached: u64,
    pub render_errors: u64,
    pub snapshots: u64,
    pub snapshot_timeouts: u64,
}

enum Command {
    Attach { surface: Box<dyn RenderSurface>, ack: SyncSender<()> },
    Detach { ack: SyncSender<()> },
    Render { frame: VideoFrame, events: Option<UnboundedSender<RenderEvent>> },
    Snapshot(PendingSnapshot),
    Barrier { ack: SyncSender<()> },
    Shutdown,
}

/// See the module docs.
pub struct Renderer {
    id: RendererId,
    commands: SyncSender<Command>,
    attached: Arc<AtomicBool>,
    slots: SnapshotSlots,
    stats: Arc<SharedStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Renderer {
    /// Starts the render thread and binds `gpu` on it.
    ///
    /// # Errors
    ///
    /// `InitError` if the thread cannot be started or the context cannot be made current.
    pub fn spawn(gpu: Box<dyn GpuContext>, config: &RenderConfig) -> Result<Self> {
        let id = RendererId::next();
        let (commands, rx) = mpsc::sync_channel(config.command_capacity.max(1));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let attached = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SharedStats::default());

        let worker = RenderThread {
            id,
            gpu,
            surface: None,
            last_resolution: None,
            pending: VecDeque::new(),
            snapshot_timeout: config.snapshot_timeout(),
            stats: stats.clone(),
            attached: attached.clone(),
            frames_counter: global::meter("mediacore_nodes").u64_counter("render_frames").build(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("mediacore-render-{id}"))
            .spawn(move || worker.run(&rx, &ready_tx))
            .map_err(|e| MediaCoreError::InitError(format!("failed to start render thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(MediaCoreError::InitError(format!("GPU context: {e}")));
            },
            Err(_) => {
                let _ = thread.join();
                return Err(MediaCoreError::InitError("render thread exited during init".to_string()));
            },
        }
        info!(renderer = %id, "Renderer started");

        Ok(Self {
            id,
            commands,
            attached,
            slots: SnapshotSlots::default(),
            stats,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub const fn id(&self) -> RendererId {
        self.id
    }

    /// Binds a display target, replacing any current one. Blocks until the render thread
    /// has taken it.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if the render thread has stopped.
    pub fn attach(&self, surface: Box<dyn RenderSurface>) -> Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        self.commands
            .send(Command::Attach { surface, ack })
            .map_err(|_| MediaCoreError::NoRenderer)?;
        done.recv().map_err(|_| MediaCoreError::NoRenderer)
    }

    /// Unbinds the display target. Pending snapshots fail with `NoRenderer`.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if the render thread has stopped.
    pub fn detach(&self) -> Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        self.commands.send(Command::Detach { ack }).map_err(|_| MediaCoreError::NoRenderer)?;
        done.recv().map_err(|_| MediaCoreError::NoRenderer)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Hands a frame to the render thread without blocking the caller.
    pub fn submit(
        &self,
        frame: VideoFrame,
        events: Option<UnboundedSender<RenderEvent>>,
    ) -> SubmitOutcome {
        match self.commands.try_send(Command::Render { frame, events }) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => SubmitOutcome::QueueFull,
            Err(TrySendError::Disconnected(_)) => SubmitOutcome::Closed,
        }
    }

    /// Requests a readback of the next fully rendered frame.
    ///
    /// # Errors
    ///
    /// `NoRenderer` when no surface is attached, `SnapshotBusy` when a request is already in
    /// flight and another is queued.
    pub fn capture_snapshot(&self) -> Result<SnapshotRequest> {
        if !self.is_attached() {
            return Err(MediaCoreError::NoRenderer);
        }
        let slot: SlotGuard = self.slots.try_acquire()?;
        let (pending, request) = PendingSnapshot::new(slot);
        self.commands.send(Command::Snapshot(pending)).map_err(|_| MediaCoreError::NoRenderer)?;
        Ok(request)
    }

    /// Blocks until every command queued before this call has been processed, so frames
    /// already submitted are released.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if the render thread has stopped.
    pub fn sync(&self) -> Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        self.commands.send(Command::Barrier { ack }).map_err(|_| MediaCoreError::NoRenderer)?;
        done.recv().map_err(|_| MediaCoreError::NoRenderer)
    }

    pub fn stats(&self) -> RendererStats {
        let s = &self.stats;
        RendererStats {
            rendered: s.rendered.load(Ordering::Relaxed),
            dropped_detached: s.dropped_detached.load(Ordering::Relaxed),
            render_errors: s.render_errors.load(Ordering::Relaxed),
            snapshots: s.snapshots.load(Ordering::Relaxed),
            snapshot_timeouts: s.snapshot_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Stops the render thread and waits for it. Idempotent.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        // A full queue still drains; Shutdown is processed after queued frames.
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            warn!(renderer = %self.id, "Render thread panicked");
        }
        debug!(renderer = %self.id, "Renderer shut down");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RenderThread {
    id: RendererId,
    gpu: Box<dyn GpuContext>,
    surface: Option<Box<dyn RenderSurface>>,
    last_resolution: Option<(u32, u32)>,
    pending: VecDeque<(PendingSnapshot, Instant)>,
    snapshot_timeout: Duration,
    stats: Arc<SharedStats>,
    attached: Arc<AtomicBool>,
    frames_counter: Counter<u64>,
}

impl RenderThread {
    fn run(mut self, rx: &mpsc::Receiver<Command>, ready: &SyncSender<Result<()>>) {
        let bound = self.gpu.make_current();
        let failed = bound.is_err();
        let _ = ready.send(bound);
        if failed {
            return;
        }

        loop {
            let command = match self.pending.front() {
                None => match rx.recv() {
                    Ok(c) => c,
                    Err(_) => break,
                },
                Some((_, deadline)) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(c) => c,
                        Err(RecvTimeoutError::Timeout) => {
                            self.expire_snapshots();
                            continue;
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                },
            };

            match command {
                Command::Attach { surface, ack } => {
                    let (w, h) = surface.size();
                    debug!(renderer = %self.id, width = w, height = h, "Surface attached");
                    self.surface = Some(surface);
                    self.attached.store(true, Ordering::Release);
                    let _ = ack.send(());
                },
                Command::Detach { ack } => {
                    self.surface = None;
                    self.attached.store(false, Ordering::Release);
                    for (pending, _) in self.pending.drain(..) {
                        pending.complete(Err(MediaCoreError::NoRenderer));
                    }
                    debug!(renderer = %self.id, "Surface detached");
                    let _ = ack.send(());
                },
                Command::Render { frame, events } => self.render(&frame, events.as_ref()),
                Command::Snapshot(pending) => {
                    if self.surface.is_none() {
                        pending.complete(Err(MediaCoreError::NoRenderer));
                    } else {
                        self.pending.push_back((pending, Instant::now() + self.snapshot_timeout));
                    }
                },
                Command::Barrier { ack } => {
                    let _ = ack.send(());
                },
                Command::Shutdown => break,
            }
        }

        for (pending, _) in self.pending.drain(..) {
            pending.complete(Err(MediaCoreError::NoRenderer));
        }
        self.surface = None;
        self.gpu.release();
        debug!(renderer = %self.id, "Render thread exiting");
    }

    fn render(&mut self, frame: &VideoFrame, events: Option<&UnboundedSender<RenderEvent>>) {
        let resolution = frame.resolution();
        if self.last_resolution != Some(resolution) {
            self.last_resolution = Some(resolution);
            info!(renderer = %self.id, width = resolution.0, height = resolution.1, "Resolution changed");
            if let Some(events) = events {
                let _ = events.send(RenderEvent::ResolutionChanged {
                    width: resolution.0,
                    height: resolution.1,
                });
            }
        }

        let Some(surface) = self.surface.as_mut() else {
            self.stats.dropped_detached.fetch_add(1, Ordering::Relaxed);
            self.frames_counter.add(1, &[KeyValue::new("status", "detached")]);
            return;
        };
        if let Err(e) = surface.upload(frame).and_then(|()| surface.present()) {
            self.stats.render_errors.fetch_add(1, Ordering::Relaxed);
            self.frames_counter.add(1, &[KeyValue::new("status", "error")]);
            warn!(renderer = %self.id, error = %e, "Failed to render frame");
            return;
        }
        self.stats.rendered.fetch_add(1, Ordering::Relaxed);
        self.frames_counter.add(1, &[KeyValue::new("status", "ok")]);

        if let Some((pending, _)) = self.pending.pop_front() {
            let result = surface.read_back();
            if result.is_ok() {
                self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
            }
            pending.complete(result);
        }
    }

    fn expire_snapshots(&mut self) {
        let now = Instant::now();
        while self.pending.front().is_some_and(|(_, deadline)| *deadline <= now) {
            if let Some((pending, _)) = self.pending.pop_front() {
                self.stats.snapshot_timeouts.fetch_add(1, Ordering::Relaxed);
                let ms = u64::try_from(self.snapshot_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(renderer = %self.id, timeout_ms = ms, "Snapshot timed out");
                pending.complete(Err(MediaCoreError::SnapshotTimeout(ms)));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediacore_core::{FrameBuffer, PixelFormat};

    fn frame(w: u32, h: u32, ts: u64) -> VideoFrame {
        let size = PixelFormat::Rgba.frame_size(w, h);
        VideoFrame::new(w, h, PixelFormat::Rgba, ts, FrameBuffer::from_vec(vec![1; size]))
    }

    fn renderer(timeout_ms: u64) -> Renderer {
        let config = RenderConfig { snapshot_timeout_ms: timeout_ms, command_capacity: 16 };
        Renderer::spawn(Box::new(HeadlessGpuContext::new()), &config).unwrap()
    }

    #[test]
    fn failing_context_is_init_error() {
        let result = Renderer::spawn(Box::new(HeadlessGpuContext::failing()), &RenderConfig::default());
        assert!(matches!(result, Err(MediaCoreError::InitError(_))));
    }

    #[test]
    fn frames_while_detached_are_counted() {
        let r = renderer(2000);
        assert_eq!(r.submit(frame(2, 2, 0), None), SubmitOutcome::Queued);
        r.sync().unwrap();
        assert_eq!(r.stats().dropped_detached, 1);
        assert_eq!(r.stats().rendered, 0);
    }

    #[test]
    fn reattach_renders_like_fresh_attach() {
        let r = renderer(2000);
        let first = HeadlessSurface::new(64, 64);
        let first_monitor = first.monitor();
        r.attach(Box::new(first)).unwrap();
        r.submit(frame(2, 2, 0), None);
        r.detach().unwrap();
        assert!(!r.is_attached());

        let second = HeadlessSurface::new(64, 64);
        let second_monitor = second.monitor();
        r.attach(Box::new(second)).unwrap();
        r.submit(frame(2, 2, 40_000), None);
        r.sync().unwrap();

        assert_eq!(first_monitor.stats().presents, 1);
        let s = second_monitor.stats();
        assert_eq!(s.presents, 1);
        assert_eq!(s.last_timestamp_us, Some(40_000));
        assert_eq!(s.last_resolution, Some((2, 2)));
    }

    #[test]
    fn resolution_change_reported_once_per_change() {
        let r = renderer(2000);
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut ts = 0;
        for (w, h) in [(2, 2), (2, 2), (4, 2), (4, 2), (2, 2)] {
            r.submit(frame(w, h, ts), Some(tx.clone()));
            ts += 40_000;
        }
        // Detach and reattach must not re-announce the current resolution.
        r.detach().unwrap();
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        r.submit(frame(2, 2, 200_000), Some(tx.clone()));
        r.sync().unwrap();

        let mut seen = Vec::new();
        while let Ok(RenderEvent::ResolutionChanged { width, height }) = rx.try_recv() {
            seen.push((width, height));
        }
        assert_eq!(seen, vec![(2, 2), (4, 2), (2, 2)]);
    }

    #[test]
    fn snapshot_returns_next_rendered_frame() {
        let r = renderer(2000);
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        r.submit(frame(4, 2, 0), None);
        let request = r.capture_snapshot().unwrap();
        r.submit(frame(6, 4, 40_000), None);
        let snap = request.wait().unwrap();
        assert_eq!(snap.resolution(), (6, 4));
        assert_eq!(snap.timestamp_us, 40_000);
        assert_eq!(r.stats().snapshots, 1);
    }

    #[test]
    fn snapshot_queue_is_bounded() {
        let r = renderer(2000);
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        let a = r.capture_snapshot().unwrap();
        let b = r.capture_snapshot().unwrap();
        assert!(matches!(r.capture_snapshot(), Err(MediaCoreError::SnapshotBusy)));

        r.submit(frame(2, 2, 0), None);
        r.submit(frame(2, 2, 40_000), None);
        assert_eq!(a.wait().unwrap().timestamp_us, 0);
        assert_eq!(b.wait().unwrap().timestamp_us, 40_000);
        assert!(r.capture_snapshot().is_ok());
    }

    #[test]
    fn snapshot_without_frames_times_out() {
        let r = renderer(50);
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        let request = r.capture_snapshot().unwrap();
        assert!(matches!(request.wait(), Err(MediaCoreError::SnapshotTimeout(50))));
        assert_eq!(r.stats().snapshot_timeouts, 1);
    }

    #[test]
    fn snapshot_while_detached_is_no_renderer() {
        let r = renderer(2000);
        assert!(matches!(r.capture_snapshot(), Err(MediaCoreError::NoRenderer)));
    }

    #[test]
    fn shutdown_fails_pending_snapshots() {
        let r = renderer(60_000);
        r.attach(Box::new(HeadlessSurface::new(64, 64))).unwrap();
        let request = r.capture_snapshot().unwrap();
        r.shutdown();
        assert!(matches!(request.wait(), Err(MediaCoreError::NoRenderer)));
        assert_eq!(r.submit(frame(2, 2, 0), None), SubmitOutcome::Closed);
    }
}
