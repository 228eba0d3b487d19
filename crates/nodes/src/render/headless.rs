// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! CPU-only surface and context, for tests and the CLI.

use super::surface::{GpuContext, RenderSurface};
use mediacore_core::{FrameBuffer, MediaCoreError, PixelFormat, Result, VideoFrame};
use std::sync::{Arc, Mutex, PoisonError};

/// Context that binds to nothing. `failing()` simulates a device without a usable GPU.
#[derive(Debug, Default)]
pub struct HeadlessGpuContext {
    fail: bool,
}

impl HeadlessGpuContext {
    pub const fn new() -> Self {
        Self { fail: false }
    }

    pub const fn failing() -> Self {
        Self { fail: true }
    }
}

impl GpuContext for HeadlessGpuContext {
    fn make_current(&mut self) -> Result<()> {
        if self.fail {
            return Err(MediaCoreError::InitError("no GPU context available".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct Texture {
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
    timestamp_us: u64,
    pixels: Vec<u8>,
}

/// What a [`HeadlessSurface`] has shown so far; readable from any thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeadlessStats {
    pub uploads: u64,
    pub presents: u64,
    pub last_timestamp_us: Option<u64>,
    pub last_resolution: Option<(u32, u32)>,
}

/// Shared view of a surface's [`HeadlessStats`].
#[derive(Debug, Clone, Default)]
pub struct HeadlessMonitor(Arc<Mutex<HeadlessStats>>);

impl HeadlessMonitor {
    pub fn stats(&self) -> HeadlessStats {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut HeadlessStats)) {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Surface that keeps a private copy of the last uploaded frame.
pub struct HeadlessSurface {
    width: u32,
    height: u32,
    staged: Texture,
    front: Texture,
    monitor: HeadlessMonitor,
}

impl HeadlessSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            staged: Texture::default(),
            front: Texture::default(),
            monitor: HeadlessMonitor::default(),
        }
    }

    pub fn monitor(&self) -> HeadlessMonitor {
        self.monitor.clone()
    }
}

impl RenderSurface for HeadlessSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn upload(&mut self, frame: &VideoFrame) -> Result<()> {
        self.staged.width = frame.width;
        self.staged.height = frame.height;
        self.staged.format = Some(frame.format);
        self.staged.timestamp_us = frame.timestamp_us;
        self.staged.pixels.clear();
        self.staged.pixels.extend_from_slice(frame.pixels());
        self.monitor.update(|s| s.uploads += 1);
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        std::mem::swap(&mut self.front, &mut self.staged);
        let front = &self.front;
        self.monitor.update(|s| {
            s.presents += 1;
            s.last_timestamp_us = Some(front.timestamp_us);
            s.last_resolution = Some((front.width, front.height));
        });
        Ok(())
    }

    fn read_back(&mut self) -> Result<VideoFrame> {
        let Some(format) = self.front.format else {
            return Err(MediaCoreError::Runtime("nothing presented yet".to_string()));
        };
        Ok(VideoFrame::new(
            self.front.width,
            self.front.height,
            format,
            self.front.timestamp_us,
            FrameBuffer::from_vec(self.front.pixels.clone()),
        ))
    }
}
