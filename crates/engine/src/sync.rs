// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Audio/video synchronisation.
//!
//! [`AvSync`] wraps a [`PlaybackClock`] and decides, per frame, whether playout should hand
//! it out now, keep it, or drop it. The clock is the *master*: audio when the session has an
//! audio stream (re-anchored to audio timestamps whenever they drift away from it), otherwise
//! a monotonic system clock anchored at the first video frame.

use mediacore_core::{PlaybackClock, PlayoutConfig};
use std::time::Duration;

/// Which stream drives the master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterClock {
    Audio,
    System,
}

/// What to do with the video frame at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoAction {
    /// Due within the tolerance window.
    Present,
    /// Not due yet.
    Wait,
    /// Further behind the clock than the late-drop threshold.
    Drop,
}

#[derive(Debug, Clone)]
pub struct AvSync {
    clock: PlaybackClock,
    master: MasterClock,
    tolerance_us: u64,
    late_drop_us: u64,
}

#[allow(clippy::cast_possible_truncation)]
const fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

impl AvSync {
    pub fn new(tolerance: Duration, late_drop: Duration) -> Self {
        Self {
            clock: PlaybackClock::new(),
            master: MasterClock::System,
            tolerance_us: micros(tolerance),
            late_drop_us: micros(late_drop),
        }
    }

    pub fn from_config(config: &PlayoutConfig) -> Self {
        Self::new(
            Duration::from_millis(config.sync_tolerance_ms),
            Duration::from_millis(config.late_drop_threshold_ms),
        )
    }

    pub const fn master(&self) -> MasterClock {
        self.master
    }

    /// Selects the master clock from the stream layout.
    pub fn set_audio_present(&mut self, present: bool) {
        self.master = if present { MasterClock::Audio } else { MasterClock::System };
    }

    pub const fn is_anchored(&self) -> bool {
        self.clock.is_started()
    }

    pub const fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    /// Pins the clock to `media_us` now.
    pub fn anchor(&mut self, media_us: u64) {
        self.clock.set(media_us);
    }

    pub fn run(&mut self) {
        self.clock.run();
    }

    pub fn freeze(&mut self) {
        self.clock.freeze();
    }

    /// Forgets the anchor (seek, stop, restart). The clock is left frozen.
    pub fn reset(&mut self) {
        self.clock.reset();
    }

    /// Current master-clock position.
    pub fn position_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Audio goes out once its timestamp is within the tolerance window.
    pub fn audio_due(&self, timestamp_us: u64) -> bool {
        self.is_anchored() && timestamp_us <= self.clock.now_us() + self.tolerance_us
    }

    /// Called for each audio frame handed to the sink. Under an audio master, a timestamp
    /// more than the late-drop threshold away from the clock re-anchors it (source
    /// discontinuity or reconnect).
    pub fn on_audio_presented(&mut self, timestamp_us: u64) {
        if self.master != MasterClock::Audio {
            return;
        }
        if self.clock.now_us().abs_diff(timestamp_us) > self.late_drop_us {
            tracing::debug!(
                clock_us = self.clock.now_us(),
                audio_us = timestamp_us,
                "Audio clock discontinuity, re-anchoring"
            );
            self.clock.set(timestamp_us);
        }
    }

    pub fn classify_video(&self, timestamp_us: u64) -> VideoAction {
        if !self.is_anchored() {
            return VideoAction::Wait;
        }
        let now = self.clock.now_us();
        if timestamp_us.saturating_add(self.late_drop_us) < now {
            VideoAction::Drop
        } else if timestamp_us <= now + self.tolerance_us {
            VideoAction::Present
        } else {
            VideoAction::Wait
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync() -> AvSync {
        AvSync::new(Duration::from_millis(20), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn video_is_due_within_tolerance() {
        let mut s = sync();
        assert_eq!(s.classify_video(0), VideoAction::Wait, "unanchored clock holds frames");

        s.anchor(1_000_000);
        s.run();
        assert_eq!(s.classify_video(1_000_000), VideoAction::Present);
        assert_eq!(s.classify_video(1_020_000), VideoAction::Present);
        assert_eq!(s.classify_video(1_020_001), VideoAction::Wait);

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(s.classify_video(1_040_000), VideoAction::Present);
        assert_eq!(s.classify_video(1_060_001), VideoAction::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_video_is_dropped() {
        let mut s = sync();
        s.anchor(0);
        s.run();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(s.classify_video(400_000), VideoAction::Present, "100 ms late is still shown");
        assert_eq!(s.classify_video(399_999), VideoAction::Drop);
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_clock_keeps_frames_waiting() {
        let mut s = sync();
        s.anchor(0);
        s.run();
        tokio::time::advance(Duration::from_millis(100)).await;
        s.freeze();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(s.position_us(), 100_000);
        assert_eq!(s.classify_video(140_000), VideoAction::Wait);
        assert!(!s.audio_due(140_000));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_master_reanchors_on_discontinuity() {
        let mut s = sync();
        s.set_audio_present(true);
        s.anchor(0);
        s.run();

        tokio::time::advance(Duration::from_millis(20)).await;
        s.on_audio_presented(15_000);
        assert_eq!(s.position_us(), 20_000, "small drift is left alone");

        s.on_audio_presented(5_000_000);
        assert_eq!(s.position_us(), 5_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn system_master_ignores_audio_timestamps() {
        let mut s = sync();
        assert_eq!(s.master(), MasterClock::System);
        s.anchor(0);
        s.on_audio_presented(9_000_000);
        assert_eq!(s.position_us(), 0);
    }
}
