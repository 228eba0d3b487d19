// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Channel capacities internal to a session.
//!
//! The capacities that shape end-to-end latency (packet channel, frame queues, render
//! commands) live in [`PlayerConfig`](mediacore_core::PlayerConfig). The ones here only carry
//! control traffic and progress reports, so they are sized for bursts rather than tuned.

use std::time::Duration;

// === Stage → playout reports ===

/// Ingest events (state changes, reconnects, seek results).
///
/// Ingest awaits on a full channel, so this bounds how far it can run ahead of
/// playout's bookkeeping during a reconnect storm.
pub const INGEST_EVENT_CAPACITY: usize = 32;

/// Decode events (layout, flush acknowledgements, failures).
pub const DECODE_EVENT_CAPACITY: usize = 16;

// === Threads ===

/// Name prefix of the per-session callback thread.
pub const DISPATCHER_THREAD_PREFIX: &str = "mediacore-cb";

/// Name prefix of the core runtime's worker threads.
pub const RUNTIME_THREAD_NAME: &str = "mediacore-worker";

/// How long `MediaCore::shutdown` waits for runtime tasks to wind down.
pub const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
