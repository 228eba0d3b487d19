// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Host-facing session handle.
//!
//! Every method is callable from any host thread and returns without waiting for media
//! I/O. Control commands are validated against the current state where that can be done
//! synchronously and then queued for the playout actor, which reports the outcome through
//! [`PlayerListener::on_state`](crate::PlayerListener::on_state).

use crate::audio::AudioSink;
use crate::dispatcher::Dispatcher;
use crate::registry::RendererRegistry;
use crate::session::{PlayoutTotals, SessionShared};
use mediacore_core::{
    ErrorCode, MediaCoreError, PlayerCommand, PlayerConfig, PlayerState, RendererId, Result,
    SessionId, SourceUri,
};
use mediacore_nodes::ingest::TransportRegistry;
use mediacore_nodes::render::SnapshotRequest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-session overrides for [`MediaCore::create_player_with`](crate::MediaCore::create_player_with).
#[derive(Default)]
pub struct PlayerOptions {
    /// Renderer to present video on. Audio-only playout when `None`.
    pub renderer: Option<RendererId>,
    /// Audio output. Audio is decoded and clocked but discarded when `None`.
    pub audio_sink: Option<Box<dyn AudioSink>>,
    /// Replaces the core's default player configuration for this session.
    pub config: Option<PlayerConfig>,
}

/// One playback session.
///
/// Call [`destroy`](Self::destroy) to release it deterministically. Dropping the handle
/// without destroying cancels the session in the background.
pub struct Player {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<PlayerCommand>,
    renderers: RendererRegistry,
    transports: Arc<TransportRegistry>,
    cancel: CancellationToken,
    done: Mutex<Option<std_mpsc::Receiver<()>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    destroyed: AtomicBool,
}

impl Player {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        commands: mpsc::Sender<PlayerCommand>,
        renderers: RendererRegistry,
        transports: Arc<TransportRegistry>,
        cancel: CancellationToken,
        done: std_mpsc::Receiver<()>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            shared,
            commands,
            renderers,
            transports,
            cancel,
            done: Mutex::new(Some(done)),
            dispatcher: Mutex::new(Some(dispatcher)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(MediaCoreError::SessionClosed);
        }
        Ok(())
    }

    fn post(&self, command: PlayerCommand) -> Result<()> {
        self.ensure_alive()?;
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(MediaCoreError::Runtime("session command queue is full".to_string()))
            },
            Err(TrySendError::Closed(_)) => Err(MediaCoreError::SessionClosed),
        }
    }

    /// Opens `uri` and begins playback.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty or malformed URI, an unsupported scheme, while a run
    /// is already in progress, or while an earlier `start` is still queued.
    pub fn start(&self, uri: &str) -> Result<()> {
        self.ensure_alive()?;
        let uri = SourceUri::parse(uri)?;
        if !self.transports.supports(uri.scheme()) {
            return Err(MediaCoreError::InvalidArgument(format!(
                "unsupported scheme '{}'",
                uri.scheme()
            )));
        }
        if !self.shared.claim_start() {
            return Err(MediaCoreError::InvalidArgument("a start is already pending".to_string()));
        }
        // Checked after claiming: the actor publishes the new state before freeing the slot.
        let state = self.state();
        if state.is_active() {
            self.shared.release_start();
            return Err(MediaCoreError::InvalidArgument(format!(
                "session is already {state}; stop it first"
            )));
        }
        debug!(session = %self.id(), uri = %uri, "Queueing start");
        self.post(PlayerCommand::Start { uri }).inspect_err(|_| self.shared.release_start())
    }

    /// # Errors
    ///
    /// `SessionClosed` after [`destroy`](Self::destroy).
    pub fn pause(&self) -> Result<()> {
        self.post(PlayerCommand::Pause)
    }

    /// # Errors
    ///
    /// `SessionClosed` after [`destroy`](Self::destroy).
    pub fn resume(&self) -> Result<()> {
        self.post(PlayerCommand::Resume)
    }

    /// # Errors
    ///
    /// `SessionClosed` after [`destroy`](Self::destroy).
    pub fn stop(&self) -> Result<()> {
        self.post(PlayerCommand::Stop)
    }

    /// Repositions to `position_us`. Unseekable sources are reported as
    /// `on_state(current, Unsupported)` with no state change.
    ///
    /// # Errors
    ///
    /// `SessionClosed` after [`destroy`](Self::destroy).
    pub fn seek(&self, position_us: u64) -> Result<()> {
        self.post(PlayerCommand::Seek { position_us })
    }

    /// Idempotent. Muted audio still drives the clock.
    ///
    /// # Errors
    ///
    /// `SessionClosed` after [`destroy`](Self::destroy).
    pub fn set_mute(&self, muted: bool) -> Result<()> {
        self.post(PlayerCommand::SetMute(muted))
    }

    pub fn is_muted(&self) -> bool {
        self.shared.is_muted()
    }

    /// Rebinds video output. Frames go to the new renderer from the next presented frame.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if `renderer` is not a live renderer of this core.
    pub fn set_renderer(&self, renderer: Option<RendererId>) -> Result<()> {
        if let Some(id) = renderer {
            if !self.renderers.contains(id) {
                return Err(MediaCoreError::NoRenderer);
            }
        }
        self.ensure_alive()?;
        debug!(
            session = %self.id(),
            renderer = ?renderer.map(RendererId::as_u64),
            "Renderer binding changed"
        );
        self.shared.set_renderer(renderer);
        Ok(())
    }

    pub fn renderer(&self) -> Option<RendererId> {
        self.shared.renderer()
    }

    /// Requests a copy of the next frame rendered on this session's renderer.
    ///
    /// # Errors
    ///
    /// `NoRenderer` when no renderer is bound or it has no surface, `SnapshotBusy` when
    /// the renderer already has a request in flight and one queued.
    pub fn capture_snapshot(&self) -> Result<SnapshotRequest> {
        self.ensure_alive()?;
        let renderer = self
            .shared
            .renderer()
            .and_then(|id| self.renderers.get(id))
            .ok_or(MediaCoreError::NoRenderer)?;
        renderer.capture_snapshot()
    }

    pub fn source(&self) -> Option<SourceUri> {
        self.shared.source()
    }

    /// Code and message of the failure that moved the session to `Error`, if any.
    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.shared.last_error()
    }

    /// Frame buffers currently held by this session (queues, render thread, host snapshots).
    pub fn allocated_buffers(&self) -> usize {
        self.shared.allocations.live()
    }

    pub fn totals(&self) -> PlayoutTotals {
        self.shared.totals()
    }

    /// Stops playback and releases every resource the session holds. Blocks until worker
    /// tasks have exited and queued callbacks have been delivered.
    ///
    /// Must not be called from inside an async context of the core's runtime.
    ///
    /// # Errors
    ///
    /// `DoubleDestroy` on the second call.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(MediaCoreError::DoubleDestroy(self.id().as_u64()));
        }
        info!(session = %self.id(), "Destroying session");
        self.cancel.cancel();

        if let Some(done) = self.done.lock().unwrap_or_else(PoisonError::into_inner).take() {
            // A closed channel means the actor is already gone.
            let _ = done.recv();
        }

        if let Some(renderer) = self.shared.renderer().and_then(|id| self.renderers.get(id)) {
            if let Err(e) = renderer.sync() {
                debug!(renderer = %renderer.id(), "Renderer gone during destroy: {e}");
            }
        }

        if let Some(dispatcher) =
            self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take()
        {
            if dispatcher.thread_id() == std::thread::current().id() {
                // Destroyed from inside a callback; the thread exits once its channel closes.
                warn!(session = %self.id(), "Session destroyed from its own callback thread");
            } else {
                dispatcher.join();
            }
        }
        debug!(
            session = %self.id(),
            live_buffers = self.allocated_buffers(),
            "Session destroyed"
        );
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("renderer", &self.renderer())
            .finish_non_exhaustive()
    }
}
