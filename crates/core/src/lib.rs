// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MediaCore Core - data model and shared building blocks for the playback pipeline.
//!
//! ## Core Modules
//!
//! - [`types`]: Frames, encoded packets, stream descriptions, identifiers
//! - [`frame_pool`]: Pooled frame storage with live-allocation accounting
//! - [`frame_queue`]: Bounded, timestamp-ordered frame queue between decode and playout
//! - [`state`]: Session and ingest state machines
//! - [`control`]: Control commands and backpressure policy
//! - [`clock`]: Wall clock helpers and the freezable playback clock
//! - [`stats`]: Counters and periodic statistics snapshots
//! - [`config`]: Serde/schemars configuration with perf profiles
//! - [`uri`]: Source URI validation
//! - [`error`]: Error types and flat error codes
//!
//! ## Quick Start
//!
//! ```ignore
//! use mediacore_core::{BackpressurePolicy, FrameQueue, MediaKind};
//!
//! let queue = FrameQueue::new(MediaKind::Video, 16, 4, BackpressurePolicy::Block);
//! queue.push(frame, Duration::from_millis(50)).await;
//! while let Some(frame) = queue.pop() {
//!     // present
//! }
//! ```

// Re-export async_trait for trait implementations in downstream crates
pub use async_trait::async_trait;

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod frame_pool;
pub mod frame_queue;
pub mod state;
pub mod stats;
pub mod types;
pub mod uri;

// Error handling
pub use error::{ErrorCode, MediaCoreError, Result};

// Data model
pub use frame_pool::{AllocationCounter, AudioBufferPool, FrameBuffer, FramePool, VideoBufferPool};
pub use types::{
    AudioFrame, CodecId, EncodedPacket, Frame, MediaKind, PixelFormat, RendererId, SessionId,
    StreamDescriptor, StreamInfo, VideoFrame,
};

// State and control
pub use control::{BackpressurePolicy, PlayerCommand};
pub use state::{IngestState, PlayerState, StateCell};

// Pipeline plumbing
pub use clock::{PlaybackClock, Throttle};
pub use config::{
    CoreConfig, DecodeConfig, IngestConfig, LogConfig, LogFormat, LogLevel, PerfProfile,
    PlayerConfig, PlayoutConfig, ReconnectConfig, RenderConfig,
};
pub use frame_queue::{FrameQueue, PushOutcome, QueueStats};
pub use stats::{
    BufferLevels, IngestCounters, PlayoutCounters, StatisticsSnapshot, StatsAggregator,
};
pub use uri::SourceUri;
