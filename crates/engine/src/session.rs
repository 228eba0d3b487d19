// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session state shared between the [`Player`](crate::Player) handle and its playout actor.
//!
//! State, source and errors are written only by the actor. The renderer binding is written
//! by the handle and read by the actor for every presented frame.

use mediacore_core::{
    AllocationCounter, ErrorCode, PlayerState, PlayoutCounters, RendererId, SessionId, SourceUri,
    StateCell,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    state: StateCell,
    muted: AtomicBool,
    /// A `Start` is queued but the actor has not handled it yet.
    start_pending: AtomicBool,
    renderer: Mutex<Option<RendererId>>,
    source: Mutex<Option<SourceUri>>,
    last_error: Mutex<Option<(ErrorCode, String)>>,
    pub(crate) allocations: AllocationCounter,
    pub(crate) counters: Arc<PlayoutCounters>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, renderer: Option<RendererId>) -> Self {
        Self {
            id,
            state: StateCell::default(),
            muted: AtomicBool::new(false),
            start_pending: AtomicBool::new(false),
            renderer: Mutex::new(renderer),
            source: Mutex::new(None),
            last_error: Mutex::new(None),
            allocations: AllocationCounter::new(),
            counters: Arc::new(PlayoutCounters::new()),
        }
    }

    pub(crate) fn state(&self) -> PlayerState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: PlayerState) {
        self.state.store(state);
    }

    pub(crate) fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Claims the single pending-start slot. Returns false if a start is already queued.
    pub(crate) fn claim_start(&self) -> bool {
        !self.start_pending.swap(true, Ordering::AcqRel)
    }

    /// Frees the slot once the actor has published the outcome of a start.
    pub(crate) fn release_start(&self) {
        self.start_pending.store(false, Ordering::Release);
    }

    pub(crate) fn renderer(&self) -> Option<RendererId> {
        *lock(&self.renderer)
    }

    pub(crate) fn set_renderer(&self, renderer: Option<RendererId>) {
        *lock(&self.renderer) = renderer;
    }

    pub(crate) fn source(&self) -> Option<SourceUri> {
        lock(&self.source).clone()
    }

    pub(crate) fn set_source(&self, source: Option<SourceUri>) {
        *lock(&self.source) = source;
    }

    pub(crate) fn last_error(&self) -> Option<(ErrorCode, String)> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<(ErrorCode, String)>) {
        *lock(&self.last_error) = error;
    }

    pub(crate) fn totals(&self) -> PlayoutTotals {
        let c = &self.counters;
        PlayoutTotals {
            video_presented: PlayoutCounters::get(&c.video_presented),
            audio_presented: PlayoutCounters::get(&c.audio_presented),
            dropped_late: PlayoutCounters::get(&c.dropped_late),
            dropped_renderer: PlayoutCounters::get(&c.dropped_renderer),
            decode_errors: PlayoutCounters::get(&c.decode_errors),
        }
    }
}

/// Cumulative playout counters for the session's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlayoutTotals {
    pub video_presented: u64,
    pub audio_presented: u64,
    /// Video frames dropped for being too far behind the master clock.
    pub dropped_late: u64,
    /// Video frames the render thread could not accept.
    pub dropped_renderer: u64,
    pub decode_errors: u64,
}
