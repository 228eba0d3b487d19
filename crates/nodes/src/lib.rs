// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline stages for MediaCore: source ingest, decode, rendering and capture.
//!
//! Every stage is host-extensible through a registry or trait:
//! - [`ingest::TransportRegistry`] / [`ingest::DemuxerRegistry`] for new schemes and containers
//! - [`decode::DecoderRegistry`] for compressed codecs
//! - [`render::RenderSurface`] / [`render::GpuContext`] for the display
//! - [`capture::CaptureBackend`] for the platform camera HAL

pub mod capture;
pub mod decode;
pub mod ingest;
pub mod render;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
