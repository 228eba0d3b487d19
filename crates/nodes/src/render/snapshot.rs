// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Snapshot request bookkeeping.
//!
//! At most [`MAX_OUTSTANDING_SNAPSHOTS`] requests exist per renderer: one waiting for the
//! next rendered frame and one queued behind it. A slot is held by the request until it is
//! answered (or dropped), so admission is decided synchronously on the caller's thread.

use mediacore_core::{MediaCoreError, Result, VideoFrame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub const MAX_OUTSTANDING_SNAPSHOTS: usize = 2;

#[derive(Debug, Clone, Default)]
pub(crate) struct SnapshotSlots {
    outstanding: Arc<AtomicUsize>,
}

impl SnapshotSlots {
    pub(crate) fn try_acquire(&self) -> Result<SlotGuard> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_OUTSTANDING_SNAPSHOTS).then_some(n + 1)
            })
            .map_err(|_| MediaCoreError::SnapshotBusy)?;
        Ok(SlotGuard { outstanding: self.outstanding.clone() })
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Render-thread side of a request.
pub(crate) struct PendingSnapshot {
    reply: oneshot::Sender<Result<VideoFrame>>,
    _slot: SlotGuard,
}

impl PendingSnapshot {
    pub(crate) fn new(slot: SlotGuard) -> (Self, SnapshotRequest) {
        let (reply, rx) = oneshot::channel();
        (Self { reply, _slot: slot }, SnapshotRequest { rx })
    }

    pub(crate) fn complete(self, result: Result<VideoFrame>) {
        let Self { reply, _slot: slot } = self;
        // Free the slot before the requester can observe the answer.
        drop(slot);
        // The requester may have stopped waiting.
        let _ = reply.send(result);
    }
}

/// Caller side of a snapshot request.
#[derive(Debug)]
pub struct SnapshotRequest {
    rx: oneshot::Receiver<Result<VideoFrame>>,
}

impl SnapshotRequest {
    /// Blocks until the renderer answers. The render thread bounds the wait with its
    /// snapshot timeout. Must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// `SnapshotTimeout`, `NoRenderer` (detached or renderer gone), or the surface's readback
    /// error.
    pub fn wait(self) -> Result<VideoFrame> {
        self.rx.blocking_recv().map_err(|_| MediaCoreError::NoRenderer)?
    }

    /// Async variant of [`SnapshotRequest::wait`].
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotRequest::wait`].
    pub async fn recv(self) -> Result<VideoFrame> {
        self.rx.await.map_err(|_| MediaCoreError::NoRenderer)?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn third_request_is_busy_until_a_slot_frees() {
        let slots = SnapshotSlots::default();
        let a = slots.try_acquire().unwrap();
        let _b = slots.try_acquire().unwrap();
        assert!(matches!(slots.try_acquire(), Err(MediaCoreError::SnapshotBusy)));
        drop(a);
        assert_eq!(slots.outstanding(), 1);
        assert!(slots.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn dropped_pending_reports_no_renderer() {
        let slots = SnapshotSlots::default();
        let (pending, request) = PendingSnapshot::new(slots.try_acquire().unwrap());
        drop(pending);
        assert_eq!(slots.outstanding(), 0);
        assert!(matches!(request.recv().await, Err(MediaCoreError::NoRenderer)));
    }
}
