// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session and ingest state machines.
//!
//! ## Session state machine
//!
//! ```text
//!   Idle/Stopped/Finished/Error
//!          │ start
//!          ↓
//!      Connecting ──────────────→ Error
//!          │ connected
//!          ↓
//!      Buffering ⇄ Playing ⇄ Stuck
//!          ↕         ↕
//!        Paused    Seeking ─→ Buffering
//!          │
//!    (any active) ── stop ──→ Stopped
//!   Buffering/Playing/Stuck ── eos+drained ──→ Finished
//! ```
//!
//! Transitions are applied only by the playout actor. Every other thread reads the
//! current value through [`StateCell`].

use crate::control::PlayerCommand;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Externally visible state of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PlayerState {
    /// Created, never started.
    Idle = 0,
    /// Opening the source (DNS/TCP/TLS or manifest fetch).
    Connecting = 1,
    /// Not enough decoded media queued for smooth playout.
    Buffering = 2,
    Playing = 3,
    /// Clock frozen by an explicit `pause`; queued frames retained.
    Paused = 4,
    /// Queues flushed, waiting for the source to reposition.
    Seeking = 5,
    /// Nominally playing but no frame consumed within the watchdog interval.
    Stuck = 6,
    /// Clean end of stream, both queues drained.
    Finished = 7,
    /// Explicit `stop`.
    Stopped = 8,
    Error = 9,
}

impl PlayerState {
    pub const ALL: [Self; 10] = [
        Self::Idle,
        Self::Connecting,
        Self::Buffering,
        Self::Playing,
        Self::Paused,
        Self::Seeking,
        Self::Stuck,
        Self::Finished,
        Self::Stopped,
        Self::Error,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Seeking => "seeking",
            Self::Stuck => "stuck",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Buffering,
            3 => Self::Playing,
            4 => Self::Paused,
            5 => Self::Seeking,
            6 => Self::Stuck,
            7 => Self::Finished,
            8 => Self::Stopped,
            9 => Self::Error,
            _ => Self::Idle,
        }
    }

    /// A run is in progress: `start` is rejected and worker tasks may be alive.
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Finished | Self::Stopped | Self::Error)
    }

    /// The edge table. Self-loops are not transitions.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use PlayerState::{
            Buffering, Connecting, Error, Finished, Idle, Paused, Playing, Seeking, Stopped, Stuck,
        };
        match (self, next) {
            (Idle | Stopped | Finished | Error, Connecting) => true,
            (Connecting, Buffering | Stopped | Error) => true,
            (Buffering, Playing | Paused | Seeking | Finished | Stopped | Error) => true,
            (Playing, Buffering | Paused | Seeking | Stuck | Finished | Stopped | Error) => true,
            (Paused, Playing | Buffering | Seeking | Stopped | Error) => true,
            (Seeking, Buffering | Playing | Paused | Stopped | Error) => true,
            (Stuck, Playing | Buffering | Paused | Seeking | Finished | Stopped | Error) => true,
            _ => false,
        }
    }

    /// Whether a control command is legal in this state.
    ///
    /// `Start` is validated synchronously by the façade; it appears here so the actor can
    /// re-check after queueing.
    pub const fn accepts(self, command: &PlayerCommand) -> bool {
        match command {
            PlayerCommand::Start { .. } => !self.is_active(),
            PlayerCommand::Pause => matches!(self, Self::Buffering | Self::Playing | Self::Stuck),
            PlayerCommand::Resume => matches!(self, Self::Paused),
            PlayerCommand::Stop => self.is_active(),
            PlayerCommand::Seek { .. } => {
                matches!(self, Self::Buffering | Self::Playing | Self::Paused | Self::Stuck)
            },
            PlayerCommand::SetMute(_) => !matches!(self, Self::Error | Self::Finished),
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free, consistent view of a session's state for readers on any thread.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new(state: PlayerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> PlayerState {
        PlayerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Only the playout actor calls this.
    pub fn store(&self, state: PlayerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(PlayerState::Idle)
    }
}

/// Source ingest state machine.
///
/// ```text
///   Idle → Connecting → Connected → Buffering ⇄ Ready → Closed
///                 any ───────────────────────────────→ Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    Connecting,
    Connected,
    Buffering,
    Ready,
    Closed,
    Error,
}

impl IngestState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        use IngestState::{Buffering, Closed, Connected, Connecting, Error, Idle, Ready};
        match (self, next) {
            (_, Error) => !matches!(self, Closed | Error),
            (Idle, Connecting) => true,
            (Connecting, Connected | Closed) => true,
            (Connected, Buffering | Closed) => true,
            (Buffering, Ready | Closed) => true,
            // Reconnects go back through Connecting.
            (Ready, Buffering | Connecting | Closed) => true,
            (Buffering, Connecting) => true,
            _ => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Buffering => "buffering",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}
