// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-process capture backend with scriptable devices.
//!
//! Devices can be added and removed at runtime (hot-plug) and frozen. Open streams produce
//! RGBA test patterns paced at the requested frame rate.

use super::{CaptureBackend, CaptureDevice, CaptureFormat, CaptureStream, Facing};
use async_trait::async_trait;
use mediacore_core::{FrameBuffer, MediaCoreError, PixelFormat, Result, VideoFrame};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone)]
struct DeviceState {
    device: CaptureDevice,
    frozen: bool,
}

#[derive(Debug, Default)]
struct Devices {
    /// Insertion order, for stable enumeration.
    order: Vec<String>,
    by_name: HashMap<String, DeviceState>,
}

/// See the module docs.
#[derive(Debug, Clone, Default)]
pub struct VirtualCaptureBackend {
    devices: Arc<Mutex<Devices>>,
}

impl VirtualCaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A front and a back camera, both offering VGA and 720p.
    pub fn with_default_devices() -> Self {
        let formats = vec![
            CaptureFormat { width: 640, height: 480, min_fps: 15, max_fps: 30, delay_ms: Some(60) },
            CaptureFormat { width: 1280, height: 720, min_fps: 15, max_fps: 30, delay_ms: Some(80) },
        ];
        let backend = Self::new();
        backend.add_device(CaptureDevice {
            name: "virtual-front".to_string(),
            facing: Facing::Front,
            formats: formats.clone(),
        });
        backend.add_device(CaptureDevice {
            name: "virtual-back".to_string(),
            facing: Facing::Back,
            formats,
        });
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Devices> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugs a device in (replacing one with the same name).
    pub fn add_device(&self, device: CaptureDevice) {
        let mut devices = self.lock();
        if !devices.by_name.contains_key(&device.name) {
            devices.order.push(device.name.clone());
        }
        devices.by_name.insert(device.name.clone(), DeviceState { device, frozen: false });
    }

    /// Unplugs a device; open streams end with a disconnect.
    pub fn remove_device(&self, name: &str) {
        let mut devices = self.lock();
        devices.by_name.remove(name);
        devices.order.retain(|n| n != name);
    }

    /// A frozen device stays open but stops producing frames.
    pub fn set_frozen(&self, name: &str, frozen: bool) {
        if let Some(state) = self.lock().by_name.get_mut(name) {
            state.frozen = frozen;
        }
    }
}

#[async_trait]
impl CaptureBackend for VirtualCaptureBackend {
    fn devices(&self) -> Result<Vec<CaptureDevice>> {
        let devices = self.lock();
        Ok(devices
            .order
            .iter()
            .filter_map(|name| devices.by_name.get(name))
            .map(|s| s.device.clone())
            .collect())
    }

    async fn open(&self, name: &str, format: &CaptureFormat) -> Result<Box<dyn CaptureStream>> {
        if !self.lock().by_name.contains_key(name) {
            return Err(MediaCoreError::DeviceNotFound(name.to_string()));
        }
        let fps = format.max_fps.max(1);
        let period = Duration::from_micros(1_000_000 / u64::from(fps));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Box::new(VirtualStream {
            name: name.to_string(),
            backend: self.clone(),
            width: format.width,
            height: format.height,
            period_us: period.as_micros().try_into().unwrap_or(u64::MAX),
            ticker,
            started: Instant::now(),
            index: 0,
        }))
    }
}

struct VirtualStream {
    name: String,
    backend: VirtualCaptureBackend,
    width: u32,
    height: u32,
    period_us: u64,
    ticker: Interval,
    started: Instant,
    index: u64,
}

impl VirtualStream {
    fn pattern(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; PixelFormat::Rgba.frame_size(self.width, self.height)];
        let shade = u8::try_from(self.index % 256).unwrap_or(0);
        for px in pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&[shade, 128, 255 - shade, 255]);
        }
        pixels
    }
}

#[async_trait]
impl CaptureStream for VirtualStream {
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        loop {
            self.ticker.tick().await;
            let frozen = match self.backend.lock().by_name.get(&self.name) {
                None => return Ok(None),
                Some(state) => state.frozen,
            };
            if frozen {
                continue;
            }
            let elapsed_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
            let frame = VideoFrame::new(
                self.width,
                self.height,
                PixelFormat::Rgba,
                elapsed_us,
                FrameBuffer::from_vec(self.pattern()),
            )
            .with_duration(self.period_us);
            self.index += 1;
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_and_sized() {
        let backend = VirtualCaptureBackend::with_default_devices();
        let mut stream = backend
            .open("virtual-front", &CaptureFormat::new(1280, 720, 25))
            .await
            .unwrap();
        let a = stream.next_frame().await.unwrap().unwrap();
        let b = stream.next_frame().await.unwrap().unwrap();
        assert_eq!(a.resolution(), (1280, 720));
        assert_eq!(b.timestamp_us - a.timestamp_us, 40_000);
        assert_eq!(b.pixels().len(), 1280 * 720 * 4);
    }

    #[tokio::test]
    async fn open_unknown_device_fails() {
        let backend = VirtualCaptureBackend::new();
        let result = backend.open("ghost", &CaptureFormat::new(640, 480, 30)).await;
        assert!(matches!(result, Err(MediaCoreError::DeviceNotFound(_))));
    }
}
