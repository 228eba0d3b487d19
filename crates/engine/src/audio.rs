// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Audio output contract.

use mediacore_core::AudioFrame;

/// Host audio output. Called from the session's playout task, in timestamp order, when
/// each frame is due. Implementations must not block for longer than a frame.
pub trait AudioSink: Send {
    fn play(&mut self, frame: &AudioFrame);

    /// Drops anything the sink still buffers (seek, stop).
    fn flush(&mut self) {}
}

/// Discards audio. Used when the host does not supply a sink; the frames still drive the
/// audio master clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&mut self, _frame: &AudioFrame) {}
}
