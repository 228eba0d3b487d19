// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Control messages for sessions.
//!
//! - [`PlayerCommand`]: requests posted by the façade to a session's command queue
//! - [`BackpressurePolicy`]: how the decode stage behaves when a frame queue is full

use crate::uri::SourceUri;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A control request for a session.
///
/// Commands never mutate state directly; the playout actor validates each one against the
/// current state and applies the resulting transition.
#[derive(Debug, Clone)]
pub enum PlayerCommand {
    Start { uri: SourceUri },
    Pause,
    Resume,
    Stop,
    Seek { position_us: u64 },
    SetMute(bool),
}

impl PlayerCommand {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Seek { .. } => "seek",
            Self::SetMute(_) => "set_mute",
        }
    }
}

/// How the decode stage handles a full frame queue.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Decode waits (bounded, retried) for space. No frame is ever dropped for space.
    #[default]
    Block,

    /// The oldest undelivered frame is evicted to bound end-to-end delay.
    /// Evictions are counted as dropped frames.
    LowLatency,
}
