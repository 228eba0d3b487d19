// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration for the core and its sessions.
//!
//! Every field has a serde default so partial TOML/env documents deserialize. Buffer
//! capacities left unset resolve through the optional [`PerfProfile`] and then fall back to
//! the balanced defaults.

use crate::control::BackpressurePolicy;
use crate::error::{MediaCoreError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Preset tuning profiles for the playback pipeline.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PerfProfile {
    /// Interactive/live viewing (shallow queues, short prebuffer)
    LowLatency,
    /// Balanced defaults for most streams
    Balanced,
    /// Lossy networks or VOD (deep queues, long prebuffer, higher latency)
    HighThroughput,
}

impl PerfProfile {
    const fn packet_channel_capacity(self) -> usize {
        match self {
            Self::LowLatency => 32,
            Self::Balanced => 128,
            Self::HighThroughput => 512,
        }
    }

    const fn video_queue_capacity(self) -> usize {
        match self {
            Self::LowLatency => 4,
            Self::Balanced => 16,
            Self::HighThroughput => 64,
        }
    }

    const fn audio_queue_capacity(self) -> usize {
        match self {
            Self::LowLatency => 16,
            Self::Balanced => 64,
            Self::HighThroughput => 256,
        }
    }

    const fn prebuffer_ms(self) -> u64 {
        match self {
            Self::LowLatency => 100,
            Self::Balanced => 300,
            Self::HighThroughput => 1000,
        }
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

const fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "./mediacore.log".to_string()
}

/// Logging sink installed by `MediaCore::init`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct LogConfig {
    /// Install a global subscriber during `init`. Hosts that set up `tracing`
    /// themselves leave this off.
    #[serde(default)]
    pub install: bool,
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    /// Trace file output (the host's "trace log").
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default = "default_log_path")]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            install: false,
            console_enable: true,
            console_level: LogLevel::default(),
            file_enable: false,
            file_level: LogLevel::Info,
            file_path: default_log_path(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_prebuffer_packets() -> usize {
    8
}

const fn default_hls_poll_ms() -> u64 {
    2_000
}

const fn default_read_chunk_size() -> usize {
    64 * 1024
}

/// Reconnect policy after the first successful connect.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles on each subsequent attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Source ingest tuning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct IngestConfig {
    /// Upper bound on DNS + TCP/TLS + manifest fetch (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Packets demuxed after (re)connect before ingest reports Ready (default: 8)
    #[serde(default = "default_prebuffer_packets")]
    pub prebuffer_packets: usize,
    /// Ingest → decode channel capacity (packets). Resolved via profile when unset.
    pub packet_channel_capacity: Option<usize>,
    /// Re-poll interval for live HLS playlists without a target duration (default: 2000)
    #[serde(default = "default_hls_poll_ms")]
    pub hls_poll_ms: u64,
    /// Read size for byte-stream transports (default: 65536)
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            prebuffer_packets: default_prebuffer_packets(),
            packet_channel_capacity: None,
            hls_poll_ms: default_hls_poll_ms(),
            read_chunk_size: default_read_chunk_size(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl IngestConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

const fn default_push_timeout_ms() -> u64 {
    50
}

const fn default_decode_failure_threshold() -> u32 {
    25
}

/// Decode stage tuning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct DecodeConfig {
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    /// Bounded wait per attempt when a frame queue is full under `block` (default: 50)
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Consecutive packet failures that escalate to a session error (default: 25)
    #[serde(default = "default_decode_failure_threshold")]
    pub decode_failure_threshold: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressurePolicy::default(),
            push_timeout_ms: default_push_timeout_ms(),
            decode_failure_threshold: default_decode_failure_threshold(),
        }
    }
}

impl DecodeConfig {
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

const fn default_reorder_window() -> usize {
    4
}

const fn default_sync_tolerance_ms() -> u64 {
    20
}

const fn default_late_drop_threshold_ms() -> u64 {
    100
}

const fn default_stuck_timeout_ms() -> u64 {
    5_000
}

const fn default_interval_1s() -> u64 {
    1_000
}

const fn default_tick_ms() -> u64 {
    5
}

const fn default_command_capacity() -> usize {
    32
}

/// AV sync and playout tuning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct PlayoutConfig {
    pub audio_queue_capacity: Option<usize>,
    pub video_queue_capacity: Option<usize>,
    /// Out-of-order frames accepted if at most this many queued frames are newer (default: 4)
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,
    /// Buffered media needed on every present stream to leave Buffering. Resolved via profile.
    pub prebuffer_ms: Option<u64>,
    /// A video frame is due once `ts <= clock + tolerance` (default: 20)
    #[serde(default = "default_sync_tolerance_ms")]
    pub sync_tolerance_ms: u64,
    /// Frames this far behind the clock are dropped instead of presented (default: 100)
    #[serde(default = "default_late_drop_threshold_ms")]
    pub late_drop_threshold_ms: u64,
    /// No frame consumed for this long while Playing reports Stuck (default: 5000)
    #[serde(default = "default_stuck_timeout_ms")]
    pub stuck_timeout_ms: u64,
    #[serde(default = "default_interval_1s")]
    pub stats_interval_ms: u64,
    /// Minimum spacing between stream sync timestamp reports (default: 1000)
    #[serde(default = "default_interval_1s")]
    pub sync_ts_interval_ms: u64,
    /// Playout scheduling granularity (default: 5)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Session command queue capacity (default: 32)
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            audio_queue_capacity: None,
            video_queue_capacity: None,
            reorder_window: default_reorder_window(),
            prebuffer_ms: None,
            sync_tolerance_ms: default_sync_tolerance_ms(),
            late_drop_threshold_ms: default_late_drop_threshold_ms(),
            stuck_timeout_ms: default_stuck_timeout_ms(),
            stats_interval_ms: default_interval_1s(),
            sync_ts_interval_ms: default_interval_1s(),
            tick_ms: default_tick_ms(),
            command_capacity: default_command_capacity(),
        }
    }
}

const fn default_snapshot_timeout_ms() -> u64 {
    2_000
}

const fn default_render_queue() -> usize {
    8
}

/// Renderer tuning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct RenderConfig {
    /// Bound on a snapshot request from issue to readback (default: 2000)
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Render thread command queue capacity (default: 8)
    #[serde(default = "default_render_queue")]
    pub command_capacity: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            command_capacity: default_render_queue(),
        }
    }
}

impl RenderConfig {
    pub const fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

/// Per-session pipeline configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct PlayerConfig {
    /// Optional tuning profile that provides buffering defaults.
    ///
    /// Explicit capacities and `prebuffer_ms` take precedence.
    #[serde(default)]
    pub profile: Option<PerfProfile>,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub playout: PlayoutConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

impl PlayerConfig {
    fn profile_or_default(&self) -> PerfProfile {
        self.profile.unwrap_or(PerfProfile::Balanced)
    }

    pub fn resolved_packet_channel_capacity(&self) -> usize {
        self.ingest
            .packet_channel_capacity
            .unwrap_or_else(|| self.profile_or_default().packet_channel_capacity())
    }

    pub fn resolved_video_queue_capacity(&self) -> usize {
        self.playout
            .video_queue_capacity
            .unwrap_or_else(|| self.profile_or_default().video_queue_capacity())
    }

    pub fn resolved_audio_queue_capacity(&self) -> usize {
        self.playout
            .audio_queue_capacity
            .unwrap_or_else(|| self.profile_or_default().audio_queue_capacity())
    }

    pub fn resolved_prebuffer_us(&self) -> u64 {
        self.playout.prebuffer_ms.unwrap_or_else(|| self.profile_or_default().prebuffer_ms()) * 1000
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `MediaCoreError::Configuration` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, u64); 8] = [
            ("ingest.connect_timeout_ms", self.ingest.connect_timeout_ms),
            ("ingest.read_chunk_size", self.ingest.read_chunk_size as u64),
            ("decode.push_timeout_ms", self.decode.push_timeout_ms),
            ("playout.stuck_timeout_ms", self.playout.stuck_timeout_ms),
            ("playout.stats_interval_ms", self.playout.stats_interval_ms),
            ("playout.tick_ms", self.playout.tick_ms),
            ("playout.command_capacity", self.playout.command_capacity as u64),
            ("render.snapshot_timeout_ms", self.render.snapshot_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(MediaCoreError::Configuration(format!("{name} must be > 0")));
            }
        }

        for (name, value) in [
            ("packet_channel_capacity", self.resolved_packet_channel_capacity()),
            ("video_queue_capacity", self.resolved_video_queue_capacity()),
            ("audio_queue_capacity", self.resolved_audio_queue_capacity()),
            ("render.command_capacity", self.render.command_capacity),
        ] {
            if value == 0 {
                return Err(MediaCoreError::Configuration(format!("{name} must be > 0")));
            }
        }

        if self.decode.decode_failure_threshold == 0 {
            return Err(MediaCoreError::Configuration(
                "decode.decode_failure_threshold must be > 0".to_string(),
            ));
        }
        if self.playout.late_drop_threshold_ms <= self.playout.sync_tolerance_ms {
            return Err(MediaCoreError::Configuration(
                "playout.late_drop_threshold_ms must exceed playout.sync_tolerance_ms".to_string(),
            ));
        }
        if self.ingest.reconnect.base_delay_ms > self.ingest.reconnect.max_delay_ms {
            return Err(MediaCoreError::Configuration(
                "ingest.reconnect.base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration handed to `MediaCore::new`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct CoreConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    /// Tokio worker threads for the core runtime (default: tokio's choice)
    pub runtime_worker_threads: Option<usize>,
}

impl CoreConfig {
    /// # Errors
    ///
    /// Returns `MediaCoreError::Configuration` if any section is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_worker_threads == Some(0) {
            return Err(MediaCoreError::Configuration(
                "runtime_worker_threads must be > 0".to_string(),
            ));
        }
        self.player.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CoreConfig::default().validate().unwrap();
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.ingest.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.ingest.reconnect.max_attempts, 3);
        assert_eq!(cfg.decode.decode_failure_threshold, 25);
        assert_eq!(cfg.render.snapshot_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn profile_fills_unset_capacities_only() {
        let mut cfg = PlayerConfig { profile: Some(PerfProfile::LowLatency), ..Default::default() };
        assert_eq!(cfg.resolved_video_queue_capacity(), 4);
        assert_eq!(cfg.resolved_prebuffer_us(), 100_000);

        cfg.playout.video_queue_capacity = Some(10);
        assert_eq!(cfg.resolved_video_queue_capacity(), 10);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let r = ReconnectConfig { max_attempts: 5, base_delay_ms: 100, max_delay_ms: 350 };
        assert_eq!(r.backoff(0), Duration::from_millis(100));
        assert_eq!(r.backoff(1), Duration::from_millis(200));
        assert_eq!(r.backoff(2), Duration::from_millis(350));
        assert_eq!(r.backoff(70), Duration::from_millis(350));
    }

    #[test]
    fn validate_rejects_inverted_sync_thresholds() {
        let mut cfg = PlayerConfig::default();
        cfg.playout.late_drop_threshold_ms = cfg.playout.sync_tolerance_ms;
        assert!(matches!(cfg.validate(), Err(MediaCoreError::Configuration(_))));
    }

    #[test]
    fn partial_documents_deserialize() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"player":{"profile":"high-throughput","decode":{"backpressure":"low_latency"}}}"#)
                .unwrap();
        assert_eq!(cfg.player.profile, Some(PerfProfile::HighThroughput));
        assert_eq!(cfg.player.decode.backpressure, BackpressurePolicy::LowLatency);
        assert_eq!(cfg.player.ingest.prebuffer_packets, 8);
        assert!(!cfg.log.install);
    }
}
