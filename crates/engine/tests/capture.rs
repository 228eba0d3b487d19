// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Device enumeration and capture through the core's runtime.

#![allow(clippy::unwrap_used)]

use mediacore_core::{CoreConfig, ErrorCode};
use mediacore_engine::MediaCore;
use mediacore_nodes::capture::{CaptureFormat, VirtualCaptureBackend};
use mediacore_nodes::test_utils::{CameraEvent, RecordingCameraEvents};
use std::sync::Arc;

#[test]
fn virtual_devices_enumerate_and_capture() {
    let core = MediaCore::new(CoreConfig::default()).unwrap();
    let enumerator =
        core.camera_enumerator(Arc::new(VirtualCaptureBackend::with_default_devices())).unwrap();

    let names = enumerator.device_names().unwrap();
    assert_eq!(names, vec!["virtual-front".to_string(), "virtual-back".to_string()]);
    assert!(enumerator.is_front_facing("virtual-front"));
    assert!(enumerator.is_back_facing("virtual-back"));
    assert!(!enumerator.is_front_facing("virtual-back"));

    let missing = enumerator.create_capturer("usb-cam", RecordingCameraEvents::new());
    assert_eq!(missing.err().map(|e| e.code()), Some(ErrorCode::DeviceNotFound));

    let events = RecordingCameraEvents::new();
    let capturer = enumerator.create_capturer("virtual-front", events.clone()).unwrap();
    assert!(capturer.start(CaptureFormat::new(1920, 1080, 30)).is_err());

    let mut frames = capturer.start(CaptureFormat::new(640, 480, 30)).unwrap();
    let frame = frames.blocking_recv().unwrap();
    assert_eq!((frame.width, frame.height), (640, 480));
    drop(frame);

    capturer.stop();
    while frames.blocking_recv().is_some() {}

    let events = events.events();
    assert_eq!(events.first(), Some(&CameraEvent::Opening("virtual-front".to_string())));
    assert!(events.contains(&CameraEvent::FirstFrame));
    assert_eq!(events.last(), Some(&CameraEvent::Closed));
    core.shutdown();
}
