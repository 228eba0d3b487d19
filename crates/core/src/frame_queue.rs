// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded, timestamp-ordered queue of decoded frames (one per media kind).
//!
//! The decode stage is the only producer; the playout actor is the only consumer.
//!
//! - Frames leave in non-decreasing `timestamp_us` order.
//! - A frame that arrives out of order is slotted into place if no more than
//!   `reorder_window` queued frames are newer than it; otherwise, or if it is older than the
//!   last frame already handed out, it is dropped and counted as late.
//! - When full, [`BackpressurePolicy::Block`] makes the producer wait (bounded per call)
//!   while [`BackpressurePolicy::LowLatency`] evicts the oldest queued frame.

use crate::control::BackpressurePolicy;
use crate::types::{Frame, MediaKind};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Result of a push attempt.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Arrived too late to be ordered; discarded.
    DroppedLate,
    /// Queued after evicting this many older frames (low-latency policy).
    EvictedOldest(usize),
    /// The queue stayed full for the whole bounded wait. The frame is handed back.
    TimedOut(Frame),
    /// The queue was closed; the frame was discarded.
    Closed,
}

/// Cumulative counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub reordered: u64,
    pub dropped_late: u64,
    pub dropped_evicted: u64,
}

impl QueueStats {
    pub const fn dropped(&self) -> u64 {
        self.dropped_late + self.dropped_evicted
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<Frame>,
    /// Timestamp of the last frame popped since the last flush.
    watermark: Option<u64>,
    eos: bool,
    closed: bool,
    stats: QueueStats,
}

/// See the module docs.
#[derive(Debug)]
pub struct FrameQueue {
    kind: MediaKind,
    capacity: usize,
    reorder_window: usize,
    policy: BackpressurePolicy,
    inner: Mutex<QueueInner>,
    space: Notify,
}

impl FrameQueue {
    pub fn new(
        kind: MediaKind,
        capacity: usize,
        reorder_window: usize,
        policy: BackpressurePolicy,
    ) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            reorder_window,
            policy,
            inner: Mutex::new(QueueInner::default()),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // Critical sections never panic midway; a poisoned guard still holds a valid queue.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes a frame, waiting up to `timeout` for space under the blocking policy.
    pub async fn push(&self, frame: Frame, timeout: Duration) -> PushOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a pop between check and wait is not missed.
            let notified = self.space.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return PushOutcome::Closed;
                }
                if inner.frames.len() < self.capacity {
                    return self.insert(&mut inner, frame, 0);
                }
                if self.policy == BackpressurePolicy::LowLatency {
                    let mut evicted = 0;
                    while inner.frames.len() >= self.capacity {
                        inner.frames.pop_front();
                        evicted += 1;
                    }
                    inner.stats.dropped_evicted += evicted as u64;
                    return self.insert(&mut inner, frame, evicted);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PushOutcome::TimedOut(frame);
            }
        }
    }

    fn insert(&self, inner: &mut QueueInner, frame: Frame, evicted: usize) -> PushOutcome {
        let ts = frame.timestamp_us();
        if inner.watermark.is_some_and(|w| ts < w) {
            inner.stats.dropped_late += 1;
            return PushOutcome::DroppedLate;
        }

        // Position after every queued frame with ts <= this one (stable for equal timestamps).
        let newer = inner.frames.iter().rev().take_while(|f| f.timestamp_us() > ts).count();
        if newer > self.reorder_window {
            inner.stats.dropped_late += 1;
            return PushOutcome::DroppedLate;
        }
        if newer > 0 {
            inner.stats.reordered += 1;
        }
        let at = inner.frames.len() - newer;
        inner.frames.insert(at, frame);
        inner.stats.pushed += 1;

        if evicted > 0 {
            PushOutcome::EvictedOldest(evicted)
        } else {
            PushOutcome::Queued
        }
    }

    /// Removes the earliest frame.
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.lock();
        let frame = inner.frames.pop_front()?;
        inner.watermark = Some(frame.timestamp_us());
        inner.stats.popped += 1;
        drop(inner);
        self.space.notify_one();
        Some(frame)
    }

    /// Timestamp of the earliest queued frame.
    pub fn peek_ts(&self) -> Option<u64> {
        self.lock().frames.front().map(Frame::timestamp_us)
    }

    /// Discards every queued frame and forgets the order watermark and end-of-stream flag.
    /// Returns the number of frames discarded.
    pub fn flush(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.frames.len();
        inner.frames.clear();
        inner.watermark = None;
        inner.eos = false;
        drop(inner);
        self.space.notify_one();
        n
    }

    /// Rejects further pushes, releases queued frames and wakes a blocked producer.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.frames.clear();
        drop(inner);
        self.space.notify_waiters();
        self.space.notify_one();
    }

    /// Re-opens a closed queue for a new run.
    pub fn reopen(&self) {
        let mut inner = self.lock();
        let stats = inner.stats;
        *inner = QueueInner { stats, ..QueueInner::default() };
    }

    pub fn mark_eos(&self) {
        self.lock().eos = true;
    }

    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }

    /// End of stream reached and every frame consumed.
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.eos && inner.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Media duration spanned by the queued frames.
    pub fn buffered_us(&self) -> u64 {
        let inner = self.lock();
        match (inner.frames.front(), inner.frames.back()) {
            (Some(first), Some(last)) => {
                let tail = last.duration_us().unwrap_or(0);
                (last.timestamp_us() + tail).saturating_sub(first.timestamp_us())
            },
            _ => 0,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }
}
