// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Listener contract and the per-session callback thread.
//!
//! The playout actor never calls the host directly. It enqueues [`Callback`]s on an
//! unbounded channel drained by one OS thread per session, so callbacks for a session are
//! serialized and ordered, never run on the caller's thread, and a slow listener cannot
//! stall playout.

use crate::constants::DISPATCHER_THREAD_PREFIX;
use mediacore_core::{ErrorCode, MediaCoreError, PlayerState, Result, SessionId, StatisticsSnapshot};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, warn};

/// Host callbacks for one session. All methods have empty defaults.
pub trait PlayerListener: Send + Sync {
    /// State change, or a rejected command (`code == InvalidStateTransition`, state
    /// unchanged). `code` is `Ok` for ordinary transitions.
    fn on_state(&self, state: PlayerState, code: ErrorCode) {
        let _ = (state, code);
    }

    /// Master-clock position at a presented video frame, throttled.
    fn on_stream_sync_ts(&self, timestamp_us: u64) {
        let _ = timestamp_us;
    }

    /// Rendered video resolution changed. Note the (height, width) order.
    fn on_resolution_change(&self, height: u32, width: u32) {
        let _ = (height, width);
    }

    fn on_statistics(&self, stats: &StatisticsSnapshot) {
        let _ = stats;
    }
}

#[derive(Debug)]
pub(crate) enum Callback {
    State { state: PlayerState, code: ErrorCode },
    SyncTs(u64),
    Resolution { height: u32, width: u32 },
    Statistics(StatisticsSnapshot),
}

/// Cloneable producer side, held by the playout actor.
#[derive(Clone)]
pub(crate) struct CallbackSender {
    tx: mpsc::Sender<Callback>,
}

impl CallbackSender {
    fn send(&self, callback: Callback) {
        if self.tx.send(callback).is_err() {
            debug!("Callback thread gone, dropping callback");
        }
    }

    pub(crate) fn state(&self, state: PlayerState, code: ErrorCode) {
        self.send(Callback::State { state, code });
    }

    pub(crate) fn sync_ts(&self, timestamp_us: u64) {
        self.send(Callback::SyncTs(timestamp_us));
    }

    pub(crate) fn resolution(&self, height: u32, width: u32) {
        self.send(Callback::Resolution { height, width });
    }

    pub(crate) fn statistics(&self, stats: StatisticsSnapshot) {
        self.send(Callback::Statistics(stats));
    }
}

pub(crate) struct Dispatcher {
    sender: CallbackSender,
    thread: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn(session: SessionId, listener: Arc<dyn PlayerListener>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Callback>();
        let thread = std::thread::Builder::new()
            .name(format!("{DISPATCHER_THREAD_PREFIX}-{}", session.as_u64()))
            .spawn(move || {
                for callback in rx {
                    deliver(listener.as_ref(), callback);
                }
                debug!(session = %session, "Callback thread exiting");
            })
            .map_err(|e| MediaCoreError::Runtime(format!("failed to start callback thread: {e}")))?;
        Ok(Self { sender: CallbackSender { tx }, thread })
    }

    pub(crate) fn sender(&self) -> CallbackSender {
        self.sender.clone()
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// Drops this side of the channel and waits until every queued callback has been
    /// delivered. Other senders must already be gone or this blocks until they are.
    pub(crate) fn join(self) {
        let Self { sender, thread } = self;
        drop(sender);
        if thread.join().is_err() {
            warn!("Listener panicked on the callback thread");
        }
    }
}

fn deliver(listener: &dyn PlayerListener, callback: Callback) {
    match callback {
        Callback::State { state, code } => listener.on_state(state, code),
        Callback::SyncTs(ts) => listener.on_stream_sync_ts(ts),
        Callback::Resolution { height, width } => listener.on_resolution_change(height, width),
        Callback::Statistics(stats) => listener.on_statistics(&stats),
    }
}
