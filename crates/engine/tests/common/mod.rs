// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for the session integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use mediacore_core::{AudioFrame, CoreConfig, ErrorCode, PlayerState, StatisticsSnapshot};
use mediacore_engine::{AudioSink, HeadlessGpuProvider, MediaCore, PlayerListener};
use mediacore_nodes::ingest::Transport;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// An initialised core with `transport` registered for the `test://` scheme.
pub fn core_with(transport: Arc<dyn Transport>, config: CoreConfig) -> MediaCore {
    init_tracing();
    let core = MediaCore::builder(config).with_transport("test", transport).build().unwrap();
    core.init(Some(Arc::new(HeadlessGpuProvider))).unwrap();
    core
}

#[derive(Default)]
struct Seen {
    states: Vec<(PlayerState, ErrorCode)>,
    sync_ts: Vec<u64>,
    resolutions: Vec<(u32, u32)>,
    statistics: Vec<StatisticsSnapshot>,
}

/// Listener that records every callback and lets the test block on them.
#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Seen>,
    changed: Condvar,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, f: impl FnOnce(&mut Seen)) {
        f(&mut self.seen.lock().unwrap());
        self.changed.notify_all();
    }

    /// Blocks until `pred` holds over the recorded state callbacks, or `timeout` passes.
    pub fn wait_until(
        &self,
        timeout: Duration,
        pred: impl Fn(&[(PlayerState, ErrorCode)]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut seen = self.seen.lock().unwrap();
        loop {
            if pred(&seen.states) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            seen = self.changed.wait_timeout(seen, deadline - now).unwrap().0;
        }
    }

    pub fn wait_for(&self, state: PlayerState) -> bool {
        self.wait_until(WAIT, |states| states.iter().any(|(s, _)| *s == state))
    }

    /// Waits for the `n`th (1-based) callback reporting `state`.
    pub fn wait_for_nth(&self, state: PlayerState, n: usize) -> bool {
        self.wait_until(WAIT, |states| states.iter().filter(|(s, _)| *s == state).count() >= n)
    }

    pub fn wait_for_code(&self, code: ErrorCode) -> bool {
        self.wait_until(WAIT, |states| states.iter().any(|(_, c)| *c == code))
    }

    pub fn states(&self) -> Vec<(PlayerState, ErrorCode)> {
        self.seen.lock().unwrap().states.clone()
    }

    /// State callbacks that were real transitions (rejections repeat the current state).
    pub fn transitions(&self) -> Vec<PlayerState> {
        let mut out: Vec<PlayerState> = Vec::new();
        for (state, _) in self.states() {
            if out.last() != Some(&state) {
                out.push(state);
            }
        }
        out
    }

    pub fn sync_ts(&self) -> Vec<u64> {
        self.seen.lock().unwrap().sync_ts.clone()
    }

    pub fn resolutions(&self) -> Vec<(u32, u32)> {
        self.seen.lock().unwrap().resolutions.clone()
    }

    pub fn statistics(&self) -> Vec<StatisticsSnapshot> {
        self.seen.lock().unwrap().statistics.clone()
    }
}

impl PlayerListener for RecordingListener {
    fn on_state(&self, state: PlayerState, code: ErrorCode) {
        self.record(|seen| seen.states.push((state, code)));
    }

    fn on_stream_sync_ts(&self, timestamp_us: u64) {
        self.record(|seen| seen.sync_ts.push(timestamp_us));
    }

    fn on_resolution_change(&self, height: u32, width: u32) {
        self.record(|seen| seen.resolutions.push((height, width)));
    }

    fn on_statistics(&self, stats: &StatisticsSnapshot) {
        self.record(|seen| seen.statistics.push(stats.clone()));
    }
}

/// Audio sink that records the timestamps it was asked to play.
#[derive(Clone, Default)]
pub struct RecordingSink {
    played: Arc<Mutex<Vec<u64>>>,
}

impl RecordingSink {
    pub fn played(&self) -> Vec<u64> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioSink for RecordingSink {
    fn play(&mut self, frame: &AudioFrame) {
        self.played.lock().unwrap().push(frame.timestamp_us);
    }
}
