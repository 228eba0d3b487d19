// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for MediaCore.
//!
//! [`MediaCoreError`] is what fallible calls return. [`ErrorCode`] is the flat,
//! copyable code carried by state callbacks (`on_state(state, code)`), so a host
//! can react to failures without holding on to error values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for MediaCore operations.
#[derive(Debug, Error)]
pub enum MediaCoreError {
    /// Bad input rejected synchronously.
    ///
    /// Examples:
    /// - Empty or malformed source URI
    /// - Unsupported URI scheme
    /// - `start` on a session that is already active
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A control command was not legal in the session's current state.
    #[error("Invalid state transition: {command} not allowed in state {state}")]
    InvalidStateTransition { command: &'static str, state: &'static str },

    /// Connection establishment, stuck detection or snapshot readback ran out of time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Sustained decode failure (individual packet errors are recovered locally).
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Network-related error (DNS, TCP, HTTP).
    #[error("Network error: {0}")]
    Network(String),

    /// `create_capturer` was called with a name absent from the last enumeration.
    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),

    /// A snapshot is already in flight and another one is already queued behind it.
    #[error("Snapshot busy: a request is already pending")]
    SnapshotBusy,

    /// The renderer did not produce a snapshot within the configured bound.
    #[error("Snapshot timed out after {0} ms")]
    SnapshotTimeout(u64),

    /// The session has no renderer (audio-only) or the renderer was torn down.
    #[error("No renderer attached to session")]
    NoRenderer,

    /// `destroy` was called a second time on the same session.
    #[error("Session {0} was already destroyed")]
    DoubleDestroy(u64),

    /// Process-wide initialisation failed (e.g. no GPU context available).
    #[error("Init error: {0}")]
    InitError(String),

    /// The session's worker tasks are gone; no further commands are accepted.
    #[error("Session closed")]
    SessionClosed,

    /// The operation is not supported by this source, transport or device.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error (file sources, device access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other runtime failure.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience type alias for Results using `MediaCoreError`.
pub type Result<T> = std::result::Result<T, MediaCoreError>;

impl MediaCoreError {
    /// Maps the error onto the code reported through `on_state`.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) | Self::Configuration(_) => ErrorCode::InvalidArgument,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::DecodeFailure(_) => ErrorCode::DecodeFailure,
            Self::Network(_) | Self::Io(_) => ErrorCode::NetworkError,
            Self::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Self::SnapshotBusy => ErrorCode::SnapshotBusy,
            Self::SnapshotTimeout(_) => ErrorCode::SnapshotTimeout,
            Self::NoRenderer => ErrorCode::NoRenderer,
            Self::DoubleDestroy(_) => ErrorCode::DoubleDestroy,
            Self::InitError(_) => ErrorCode::InitError,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::SessionClosed | Self::Runtime(_) => ErrorCode::Internal,
        }
    }

    /// Whether the failure is worth retrying at the transport level.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Io(_) | Self::Timeout(_))
    }
}

/// Flat error code delivered with state callbacks.
///
/// `Ok` accompanies ordinary transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Ok,
    InvalidArgument,
    InvalidStateTransition,
    Timeout,
    DecodeFailure,
    NetworkError,
    DeviceNotFound,
    SnapshotBusy,
    SnapshotTimeout,
    NoRenderer,
    DoubleDestroy,
    InitError,
    Unsupported,
    Internal,
}

impl ErrorCode {
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Stable numeric value for hosts that bridge codes across an FFI boundary.
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidArgument => 1,
            Self::InvalidStateTransition => 2,
            Self::Timeout => 3,
            Self::DecodeFailure => 4,
            Self::NetworkError => 5,
            Self::DeviceNotFound => 6,
            Self::SnapshotBusy => 7,
            Self::SnapshotTimeout => 8,
            Self::NoRenderer => 9,
            Self::DoubleDestroy => 10,
            Self::InitError => 11,
            Self::Unsupported => 12,
            Self::Internal => 99,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid_argument",
            Self::InvalidStateTransition => "invalid_state_transition",
            Self::Timeout => "timeout",
            Self::DecodeFailure => "decode_failure",
            Self::NetworkError => "network_error",
            Self::DeviceNotFound => "device_not_found",
            Self::SnapshotBusy => "snapshot_busy",
            Self::SnapshotTimeout => "snapshot_timeout",
            Self::NoRenderer => "no_renderer",
            Self::DoubleDestroy => "double_destroy",
            Self::InitError => "init_error",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MediaCoreError::InvalidArgument("empty uri".to_string());
        assert_eq!(err.to_string(), "Invalid argument: empty uri");

        let err = MediaCoreError::InvalidStateTransition { command: "pause", state: "idle" };
        assert_eq!(err.to_string(), "Invalid state transition: pause not allowed in state idle");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MediaCoreError::SnapshotBusy.code(), ErrorCode::SnapshotBusy);
        assert_eq!(MediaCoreError::Timeout("connect".into()).code(), ErrorCode::Timeout);
        assert_eq!(MediaCoreError::DoubleDestroy(3).code(), ErrorCode::DoubleDestroy);
        assert!(ErrorCode::Ok.is_ok());
        assert!(!ErrorCode::Timeout.is_ok());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: MediaCoreError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.is_transient());
        assert_eq!(err.code(), ErrorCode::NetworkError);
    }

    #[test]
    fn test_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidStateTransition).unwrap();
        assert_eq!(json, "\"invalid_state_transition\"");
    }
}
