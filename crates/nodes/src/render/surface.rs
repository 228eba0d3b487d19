// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Host-provided display contracts.
//!
//! Both traits are only ever called from the renderer's own thread.

use mediacore_core::{Result, VideoFrame};

/// Graphics context the render thread binds to before touching any surface.
pub trait GpuContext: Send {
    /// Binds the context to the calling thread.
    ///
    /// # Errors
    ///
    /// Any error here fails renderer creation with `InitError`.
    fn make_current(&mut self) -> Result<()>;

    /// Unbinds the context; called once when the render thread exits.
    fn release(&mut self) {}
}

/// A drawable target owned by the host.
pub trait RenderSurface: Send {
    /// Drawable size in pixels.
    fn size(&self) -> (u32, u32);

    /// Uploads a frame's pixels. The surface must not keep a reference to the frame's
    /// buffer after returning.
    ///
    /// # Errors
    ///
    /// Upload failures are logged and the frame counts as dropped.
    fn upload(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Makes the last upload visible.
    ///
    /// # Errors
    ///
    /// Presentation failures are logged and the frame counts as dropped.
    fn present(&mut self) -> Result<()>;

    /// Copies the last presented frame back to host memory at its source resolution.
    ///
    /// # Errors
    ///
    /// Fails the pending snapshot request with the returned error.
    fn read_back(&mut self) -> Result<VideoFrame>;
}
