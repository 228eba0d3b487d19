// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Capture device enumeration and capturers.
//!
//! The host supplies a [`CaptureBackend`] (the platform camera HAL). [`CameraEnumerator`]
//! queries it afresh on every listing and hands out [`Capturer`]s for devices seen in the
//! last listing. A capturer runs on the core's runtime and reports lifecycle changes to the
//! host's [`CameraEventsHandler`] from that task, never from the caller's thread.

use async_trait::async_trait;
use mediacore_core::{MediaCoreError, Result, VideoFrame};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod virtual_backend;

pub use virtual_backend::VirtualCaptureBackend;

/// No frame for this long while running ⇒ `on_camera_freezed`.
pub const DEFAULT_FREEZE_TIMEOUT: Duration = Duration::from_secs(4);
/// Frames buffered towards the consumer before new ones are dropped.
const FRAME_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Front,
    Back,
    Other,
}

/// A capture mode a device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    /// Typical sensor-to-frame latency in this mode, when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
}

impl CaptureFormat {
    pub const fn new(width: u32, height: u32, max_fps: u32) -> Self {
        Self { width, height, min_fps: 1, max_fps, delay_ms: None }
    }

    /// Whether `requested` can be served by this mode (same size, frame rate within range).
    pub const fn accepts(&self, requested: &Self) -> bool {
        self.width == requested.width
            && self.height == requested.height
            && requested.max_fps >= self.min_fps
            && requested.max_fps <= self.max_fps
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    /// Unique device id.
    pub name: String,
    pub facing: Facing,
    pub formats: Vec<CaptureFormat>,
}

/// Host callbacks for a capturer's lifecycle. All methods default to no-ops.
pub trait CameraEventsHandler: Send + Sync {
    fn on_camera_opening(&self, device_name: &str) {
        let _ = device_name;
    }
    fn on_first_frame_available(&self) {}
    fn on_camera_closed(&self) {}
    fn on_camera_error(&self, message: &str) {
        let _ = message;
    }
    fn on_camera_disconnected(&self) {}
    fn on_camera_freezed(&self, message: &str) {
        let _ = message;
    }
}

/// Platform camera access.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Devices present right now.
    ///
    /// # Errors
    ///
    /// Backend-specific failure to query the platform.
    fn devices(&self) -> Result<Vec<CaptureDevice>>;

    /// Opens a device in `format`.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` if the device vanished, or a backend error.
    async fn open(&self, name: &str, format: &CaptureFormat) -> Result<Box<dyn CaptureStream>>;
}

/// An opened device.
#[async_trait]
pub trait CaptureStream: Send {
    /// Next captured frame; `Ok(None)` once the device has been disconnected.
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// See the module docs.
pub struct CameraEnumerator {
    backend: Arc<dyn CaptureBackend>,
    runtime: Handle,
    last: Mutex<Vec<CaptureDevice>>,
    freeze_timeout: Duration,
}

impl CameraEnumerator {
    pub fn new(backend: Arc<dyn CaptureBackend>, runtime: Handle) -> Self {
        Self { backend, runtime, last: Mutex::new(Vec::new()), freeze_timeout: DEFAULT_FREEZE_TIMEOUT }
    }

    #[must_use]
    pub const fn with_freeze_timeout(mut self, timeout: Duration) -> Self {
        self.freeze_timeout = timeout;
        self
    }

    /// Queries the backend and remembers the result for later lookups.
    ///
    /// # Errors
    ///
    /// Propagates backend enumeration failures.
    pub fn list_devices(&self) -> Result<Vec<CaptureDevice>> {
        let devices = self.backend.devices()?;
        debug!(count = devices.len(), "Enumerated capture devices");
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone_from(&devices);
        Ok(devices)
    }

    /// Names from a fresh enumeration.
    ///
    /// # Errors
    ///
    /// Propagates backend enumeration failures.
    pub fn device_names(&self) -> Result<Vec<String>> {
        Ok(self.list_devices()?.into_iter().map(|d| d.name).collect())
    }

    fn known(&self, name: &str) -> Option<CaptureDevice> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn is_front_facing(&self, name: &str) -> bool {
        self.known(name).is_some_and(|d| d.facing == Facing::Front)
    }

    pub fn is_back_facing(&self, name: &str) -> bool {
        self.known(name).is_some_and(|d| d.facing == Facing::Back)
    }

    /// # Errors
    ///
    /// `DeviceNotFound` if `name` was not part of the last enumeration.
    pub fn create_capturer(
        &self,
        name: &str,
        events: Arc<dyn CameraEventsHandler>,
    ) -> Result<Capturer> {
        let device = self.known(name).ok_or_else(|| MediaCoreError::DeviceNotFound(name.to_string()))?;
        Ok(Capturer {
            device,
            backend: self.backend.clone(),
            events,
            runtime: self.runtime.clone(),
            freeze_timeout: self.freeze_timeout,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives one device. Frames arrive on the receiver returned by [`Capturer::start`].
pub struct Capturer {
    device: CaptureDevice,
    backend: Arc<dyn CaptureBackend>,
    events: Arc<dyn CameraEventsHandler>,
    runtime: Handle,
    freeze_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl Capturer {
    pub const fn device(&self) -> &CaptureDevice {
        &self.device
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Starts capturing. Opening happens asynchronously; failures arrive as
    /// `on_camera_error`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the device does not support `format` or the capturer is already
    /// running.
    pub fn start(&self, format: CaptureFormat) -> Result<mpsc::Receiver<VideoFrame>> {
        if !self.device.formats.iter().any(|f| f.accepts(&format)) {
            return Err(MediaCoreError::InvalidArgument(format!(
                "{} does not support {}x{}@{}",
                self.device.name, format.width, format.height, format.max_fps
            )));
        }
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(MediaCoreError::InvalidArgument(format!(
                "capturer for {} is already running",
                self.device.name
            )));
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let session = CaptureSession {
            name: self.device.name.clone(),
            format,
            backend: self.backend.clone(),
            events: self.events.clone(),
            frames: tx,
            cancel: cancel.clone(),
            freeze_timeout: self.freeze_timeout,
        };
        let task = self.runtime.spawn(session.run());
        *running = Some(Running { cancel, task });
        info!(device = %self.device.name, width = format.width, height = format.height, "Capture starting");
        Ok(rx)
    }

    /// Stops capturing. `on_camera_closed` follows from the capture task.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take() {
            running.cancel.cancel();
            debug!(device = %self.device.name, "Capture stop requested");
        }
    }

    /// Stops capturing and waits for the capture task to finish.
    pub async fn stop_and_wait(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
        }
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureSession {
    name: String,
    format: CaptureFormat,
    backend: Arc<dyn CaptureBackend>,
    events: Arc<dyn CameraEventsHandler>,
    frames: mpsc::Sender<VideoFrame>,
    cancel: CancellationToken,
    freeze_timeout: Duration,
}

impl CaptureSession {
    async fn run(self) {
        self.events.on_camera_opening(&self.name);
        let opened = tokio::select! {
            () = self.cancel.cancelled() => {
                self.events.on_camera_closed();
                return;
            }
            opened = self.backend.open(&self.name, &self.format) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(device = %self.name, error = %e, "Failed to open capture device");
                self.events.on_camera_error(&e.to_string());
                return;
            },
        };

        let mut first = true;
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = tokio::time::timeout(self.freeze_timeout, stream.next_frame()) => next,
            };
            match next {
                Err(_) => {
                    let ms = self.freeze_timeout.as_millis();
                    warn!(device = %self.name, timeout_ms = ms, "Capture device froze");
                    self.events.on_camera_freezed(&format!("no frames received for {ms} ms"));
                },
                Ok(Ok(Some(frame))) => {
                    if first {
                        first = false;
                        self.events.on_first_frame_available();
                    }
                    // Slow consumers lose frames rather than stalling the device.
                    if let Err(mpsc::error::TrySendError::Closed(_)) = self.frames.try_send(frame) {
                        debug!(device = %self.name, "Frame receiver dropped");
                        break;
                    }
                },
                Ok(Ok(None)) => {
                    info!(device = %self.name, "Capture device disconnected");
                    self.events.on_camera_disconnected();
                    break;
                },
                Ok(Err(e)) => {
                    warn!(device = %self.name, error = %e, "Capture device error");
                    self.events.on_camera_error(&e.to_string());
                    break;
                },
            }
        }
        drop(stream);
        self.events.on_camera_closed();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{CameraEvent, RecordingCameraEvents};

    fn enumerator(backend: VirtualCaptureBackend) -> CameraEnumerator {
        CameraEnumerator::new(Arc::new(backend), Handle::current())
            .with_freeze_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn facing_and_unknown_device() {
        let e = enumerator(VirtualCaptureBackend::with_default_devices());
        let names = e.device_names().unwrap();
        assert_eq!(names, vec!["virtual-front", "virtual-back"]);
        assert!(e.is_front_facing("virtual-front"));
        assert!(!e.is_back_facing("virtual-front"));
        assert!(e.is_back_facing("virtual-back"));
        assert!(!e.is_front_facing("nope"));

        let events = RecordingCameraEvents::new();
        assert!(matches!(
            e.create_capturer("nope", events),
            Err(MediaCoreError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn enumeration_is_fresh() {
        let backend = Arc::new(VirtualCaptureBackend::with_default_devices());
        let e = CameraEnumerator::new(backend.clone(), Handle::current());
        assert_eq!(e.list_devices().unwrap().len(), 2);
        backend.remove_device("virtual-back");
        assert_eq!(e.device_names().unwrap(), vec!["virtual-front"]);
        assert!(e.create_capturer("virtual-back", RecordingCameraEvents::new()).is_err());
    }

    #[tokio::test]
    async fn start_delivers_frames_and_events() {
        let e = enumerator(VirtualCaptureBackend::with_default_devices());
        e.list_devices().unwrap();
        let events = RecordingCameraEvents::new();
        let capturer = e.create_capturer("virtual-front", events.clone()).unwrap();

        let mut frames = capturer.start(CaptureFormat::new(640, 480, 30)).unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.resolution(), (640, 480));
        assert!(capturer.start(CaptureFormat::new(640, 480, 30)).is_err());

        capturer.stop_and_wait().await;
        assert_eq!(
            events.events(),
            vec![
                CameraEvent::Opening("virtual-front".to_string()),
                CameraEvent::FirstFrame,
                CameraEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let e = enumerator(VirtualCaptureBackend::with_default_devices());
        e.list_devices().unwrap();
        let capturer = e.create_capturer("virtual-back", RecordingCameraEvents::new()).unwrap();
        assert!(matches!(
            capturer.start(CaptureFormat::new(123, 45, 30)),
            Err(MediaCoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unplug_reports_disconnect() {
        let backend = Arc::new(VirtualCaptureBackend::with_default_devices());
        let e = CameraEnumerator::new(backend.clone(), Handle::current());
        e.list_devices().unwrap();
        let events = RecordingCameraEvents::new();
        let capturer = e.create_capturer("virtual-back", events.clone()).unwrap();
        let mut frames = capturer.start(CaptureFormat::new(640, 480, 30)).unwrap();
        frames.recv().await.unwrap();

        backend.remove_device("virtual-back");
        while frames.recv().await.is_some() {}
        assert_eq!(events.events().last(), Some(&CameraEvent::Closed));
        assert!(events.events().contains(&CameraEvent::Disconnected));
    }

    #[tokio::test]
    async fn frozen_device_is_reported() {
        let backend = Arc::new(VirtualCaptureBackend::with_default_devices());
        let e = CameraEnumerator::new(backend.clone(), Handle::current())
            .with_freeze_timeout(Duration::from_millis(100));
        e.list_devices().unwrap();
        let events = RecordingCameraEvents::new();
        let capturer = e.create_capturer("virtual-front", events.clone()).unwrap();
        let mut frames = capturer.start(CaptureFormat::new(640, 480, 30)).unwrap();
        frames.recv().await.unwrap();

        backend.set_frozen("virtual-front", true);
        tokio::time::sleep(Duration::from_millis(350)).await;
        capturer.stop_and_wait().await;
        assert!(events.events().iter().any(|e| matches!(e, CameraEvent::Freezed(_))));
    }

    #[tokio::test]
    async fn open_failure_reports_error() {
        let backend = Arc::new(VirtualCaptureBackend::with_default_devices());
        let e = CameraEnumerator::new(backend.clone(), Handle::current());
        e.list_devices().unwrap();
        let events = RecordingCameraEvents::new();
        let capturer = e.create_capturer("virtual-front", events.clone()).unwrap();
        // Unplugged between enumeration and start.
        backend.remove_device("virtual-front");
        let mut frames = capturer.start(CaptureFormat::new(640, 480, 30)).unwrap();
        assert!(frames.recv().await.is_none());
        let recorded = events.events();
        assert_eq!(recorded[0], CameraEvent::Opening("virtual-front".to_string()));
        assert!(matches!(recorded[1], CameraEvent::Error(_)));
    }
}
