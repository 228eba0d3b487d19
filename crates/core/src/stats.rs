// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Playback statistics collection and reporting.
//!
//! Pipeline stages bump lock-free counters ([`IngestCounters`], [`PlayoutCounters`]); the
//! playout actor folds them into an immutable [`StatisticsSnapshot`] once per interval via
//! [`StatsAggregator`]. Snapshots only go to the listener; nothing inside the pipeline reads
//! them back.

use crate::clock::wall_clock_ms;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// Periodic, immutable statistics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub session_id: u64,
    /// Wall-clock time the snapshot was taken (ms since UNIX epoch).
    pub timestamp_ms: u64,
    /// Length of the measurement window.
    pub interval_ms: u64,
    /// Ingest bitrate over the window.
    pub bitrate_kbps: f64,
    /// Video frames presented per second over the window.
    pub fps: f64,
    /// Cumulative: late + re-order + detached + low-latency evictions.
    pub dropped_frames: u64,
    /// Cumulative packets that failed to decode.
    pub decode_errors: u64,
    pub audio_buffered_ms: u64,
    pub video_buffered_frames: usize,
    pub video_buffered_ms: u64,
    /// Round-trip time, when the transport measures one.
    pub rtt_ms: Option<u64>,
    /// Smoothed ingest inter-arrival jitter.
    pub jitter_ms: Option<f64>,
    /// Current playback position.
    pub position_us: u64,
}

impl StatisticsSnapshot {
    /// JSON rendering of the record, as handed to hosts that want a string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Counters written by the ingest task.
#[derive(Debug, Default)]
pub struct IngestCounters {
    bytes: AtomicU64,
    packets: AtomicU64,
    rtt_ms: AtomicU64,
    jitter: Mutex<JitterEstimator>,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one demuxed packet: payload size, its media timestamp, and arrival time.
    pub fn record_packet(&self, bytes: usize, timestamp_us: u64, arrival: Instant) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut jitter) = self.jitter.lock() {
            jitter.observe(timestamp_us, arrival);
        }
    }

    pub fn set_rtt_ms(&self, rtt_ms: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        match self.rtt_ms.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        self.jitter.lock().ok().and_then(|j| j.jitter_ms())
    }
}

/// Counters written by the decode stage and the playout actor.
#[derive(Debug, Default)]
pub struct PlayoutCounters {
    pub video_presented: AtomicU64,
    pub audio_presented: AtomicU64,
    pub dropped_late: AtomicU64,
    pub dropped_renderer: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl PlayoutCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// RFC 3550-style interarrival jitter (J += (|D| - J) / 16).
#[derive(Debug, Default)]
struct JitterEstimator {
    last: Option<(u64, Instant)>,
    jitter_us: f64,
    samples: u64,
}

impl JitterEstimator {
    #[allow(clippy::cast_precision_loss)]
    fn observe(&mut self, timestamp_us: u64, arrival: Instant) {
        if let Some((last_ts, last_arrival)) = self.last {
            // Only compare forward steps; interleaved audio/video timestamps go backwards.
            if timestamp_us >= last_ts {
                let media_delta = (timestamp_us - last_ts) as f64;
                let arrival_delta =
                    arrival.saturating_duration_since(last_arrival).as_micros() as f64;
                let d = (arrival_delta - media_delta).abs();
                self.jitter_us += (d - self.jitter_us) / 16.0;
                self.samples += 1;
            }
        }
        self.last = Some((timestamp_us, arrival));
    }

    fn jitter_ms(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.jitter_us / 1000.0)
    }
}

/// Queue occupancy sampled at snapshot time.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferLevels {
    pub audio_buffered_ms: u64,
    pub video_buffered_frames: usize,
    pub video_buffered_ms: u64,
    pub dropped_in_queues: u64,
    /// Frames the bound renderer discarded while it had no surface.
    pub dropped_detached: u64,
}

/// Folds counters into per-interval snapshots.
pub struct StatsAggregator {
    session_id: SessionId,
    window_start: Instant,
    last_bytes: u64,
    last_video_presented: u64,
}

impl StatsAggregator {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, window_start: Instant::now(), last_bytes: 0, last_video_presented: 0 }
    }

    /// Restart the window (after `start`/`seek`), keeping cumulative counters.
    pub fn reset_window(&mut self, ingest: &IngestCounters, playout: &PlayoutCounters) {
        self.window_start = Instant::now();
        self.last_bytes = ingest.bytes();
        self.last_video_presented = PlayoutCounters::get(&playout.video_presented);
    }

    /// Close the current window and produce its snapshot.
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot(
        &mut self,
        ingest: &IngestCounters,
        playout: &PlayoutCounters,
        levels: BufferLevels,
        position_us: u64,
    ) -> StatisticsSnapshot {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.window_start);
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);

        let bytes = ingest.bytes();
        let presented = PlayoutCounters::get(&playout.video_presented);
        let bitrate_kbps = (bytes.saturating_sub(self.last_bytes) as f64 * 8.0) / 1000.0 / secs;
        let fps = presented.saturating_sub(self.last_video_presented) as f64 / secs;

        self.window_start = now;
        self.last_bytes = bytes;
        self.last_video_presented = presented;

        StatisticsSnapshot {
            session_id: self.session_id.as_u64(),
            timestamp_ms: wall_clock_ms(),
            interval_ms: elapsed.as_millis() as u64,
            bitrate_kbps,
            fps,
            dropped_frames: PlayoutCounters::get(&playout.dropped_late)
                + PlayoutCounters::get(&playout.dropped_renderer)
                + levels.dropped_in_queues
                + levels.dropped_detached,
            decode_errors: PlayoutCounters::get(&playout.decode_errors),
            audio_buffered_ms: levels.audio_buffered_ms,
            video_buffered_frames: levels.video_buffered_frames,
            video_buffered_ms: levels.video_buffered_ms,
            rtt_ms: ingest.rtt_ms(),
            jitter_ms: ingest.jitter_ms(),
            position_us,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn snapshot_computes_rates_over_window() {
        let ingest = IngestCounters::new();
        let playout = PlayoutCounters::new();
        let mut agg = StatsAggregator::new(SessionId::next());

        ingest.record_packet(125_000, 0, Instant::now());
        for _ in 0..30 {
            PlayoutCounters::inc(&playout.video_presented);
        }
        PlayoutCounters::inc(&playout.dropped_late);

        tokio::time::advance(Duration::from_secs(1)).await;
        let snap = agg.snapshot(
            &ingest,
            &playout,
            BufferLevels { dropped_in_queues: 2, dropped_detached: 4, ..BufferLevels::default() },
            42,
        );

        assert!((snap.bitrate_kbps - 1000.0).abs() < 1.0);
        assert!((snap.fps - 30.0).abs() < 0.1);
        assert_eq!(snap.dropped_frames, 7);
        assert_eq!(snap.position_us, 42);

        // Next window starts from the new baseline.
        tokio::time::advance(Duration::from_secs(1)).await;
        let snap = agg.snapshot(&ingest, &playout, BufferLevels::default(), 42);
        assert!(snap.bitrate_kbps.abs() < f64::EPSILON);
        assert!(snap.fps.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_is_zero_for_perfect_pacing() {
        let ingest = IngestCounters::new();
        for i in 0..10u64 {
            ingest.record_packet(100, i * 20_000, Instant::now());
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert!(ingest.jitter_ms().unwrap() < 0.01);
        assert_eq!(ingest.packets(), 10);
    }

    #[test]
    fn snapshot_json_has_fields() {
        let snap = StatisticsSnapshot {
            session_id: 1,
            timestamp_ms: 0,
            interval_ms: 1000,
            bitrate_kbps: 1.5,
            fps: 25.0,
            dropped_frames: 0,
            decode_errors: 0,
            audio_buffered_ms: 200,
            video_buffered_frames: 3,
            video_buffered_ms: 120,
            rtt_ms: None,
            jitter_ms: None,
            position_us: 0,
        };
        let value: serde_json::Value = serde_json::from_str(&snap.to_json()).unwrap();
        assert_eq!(value["fps"], 25.0);
        assert_eq!(value["video_buffered_frames"], 3);
    }
}
