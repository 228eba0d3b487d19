// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wall-clock and monotonic time helpers, plus the freezable playback clock used for AV sync.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Milliseconds since the UNIX epoch.
#[allow(clippy::cast_possible_truncation)] // u64 milliseconds covers ~500 million years
pub fn wall_clock_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Microseconds since the UNIX epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn wall_clock_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

/// Microseconds elapsed between two monotonic instants (saturating).
#[allow(clippy::cast_possible_truncation)]
pub fn elapsed_us(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_micros() as u64
}

/// Media-time clock anchored to a monotonic instant.
///
/// `now_us()` = anchor media time + elapsed since the anchor instant, while running.
/// Pausing freezes the value; resuming re-anchors at the frozen position so no media
/// time is skipped. Built on `tokio::time::Instant` so paused-time tests drive it.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    anchor_media_us: u64,
    anchor_instant: Instant,
    running: bool,
    started: bool,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self { anchor_media_us: 0, anchor_instant: Instant::now(), running: false, started: false }
    }

    /// Whether the clock has been anchored at least once since the last reset.
    pub const fn is_started(&self) -> bool {
        self.started
    }

    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Current media position in microseconds.
    pub fn now_us(&self) -> u64 {
        self.at(Instant::now())
    }

    pub fn at(&self, instant: Instant) -> u64 {
        if self.running {
            self.anchor_media_us + elapsed_us(self.anchor_instant, instant)
        } else {
            self.anchor_media_us
        }
    }

    /// Re-anchor to `media_us` at the current instant; the clock keeps its running state.
    pub fn set(&mut self, media_us: u64) {
        self.anchor_media_us = media_us;
        self.anchor_instant = Instant::now();
        self.started = true;
    }

    /// Start (or resume) advancing.
    pub fn run(&mut self) {
        if !self.running {
            self.anchor_media_us = self.now_us();
            self.anchor_instant = Instant::now();
            self.running = true;
        }
    }

    /// Stop advancing, keeping the current position.
    pub fn freeze(&mut self) {
        if self.running {
            self.anchor_media_us = self.now_us();
            self.anchor_instant = Instant::now();
            self.running = false;
        }
    }

    /// Back to un-anchored and frozen (seek / restart).
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Interval gate: returns true at most once per `period`.
#[derive(Debug, Clone)]
pub struct Throttle {
    period: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub const fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            },
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
