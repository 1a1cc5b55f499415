// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Provider contract.
//!
//! Platform backends implement [`CameraProvider`]; the core is the only
//! caller and invokes every method from its own thread. Providers report
//! facts back through the [`super::events::ProviderEventSink`] handed to
//! `initialize`, and must do so from a single serialised callback context.
//!
//! The provider abstraction is a capability set with a fixed method table,
//! not a class hierarchy; synthetic, stub and platform backends each satisfy
//! it independently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{ProviderError, ProviderResult};
use super::events::ProviderEventSink;

/// Public semantics of a repeating stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamIntent {
    Preview,
    Viewfinder,
}

/// Hardware endpoint as reported by provider enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEndpoint {
    /// Stable platform camera identifier.
    pub hardware_id: String,
    /// Human-readable label; may be empty.
    pub name: String,
}

/// Normalized repeating stream request. Core-validated; ids are core-issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub stream_id: u64,
    pub device_instance_id: u64,
    pub intent: StreamIntent,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    /// 0 if unspecified.
    pub target_fps_min: u32,
    /// 0 if unspecified.
    pub target_fps_max: u32,
    pub profile_version: u64,
}

/// Normalized still capture request. Core-validated; ids are core-issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub capture_id: u64,
    pub device_instance_id: u64,
    /// 0 if this is not a rig capture.
    pub rig_id: u64,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    pub profile_version: u64,
}

/// Kinds of provider-side native objects tracked by the lifecycle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeObjectKind {
    DeviceSession,
    StreamPipeline,
    CaptureJob,
    BufferPool,
    Other,
}

/// Provider report of a freshly created native object.
///
/// `provider_token` is a provider-local identifier; the core issues the
/// runtime `native_id` when it processes the event and correlates the later
/// destroy report through the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeObjectCreateInfo {
    pub provider_token: u64,
    pub kind: NativeObjectKind,
    /// Lineage root id (core-issued, passed down in `open_device`).
    pub root_id: u64,
    pub owner_rig_id: u64,
    pub owner_device_instance_id: u64,
    pub owner_stream_id: u64,
    /// Monotonic creation time if available; 0 allowed.
    pub created_ns: u64,
    /// 0 if not applicable.
    pub bytes_allocated: u64,
    /// 0 if not applicable.
    pub buffers_in_use: u32,
}

static OUTSTANDING_FRAMES: AtomicU64 = AtomicU64::new(0);

/// Number of delivered frames not yet released, process-wide. Debug
/// tooling asserts this reaches zero at shutdown.
pub fn outstanding_frames() -> u64 {
    OUTSTANDING_FRAMES.load(Ordering::SeqCst)
}

/// A frame delivered by a provider.
///
/// The provider retains buffer ownership until the release hook runs; the
/// view invokes it exactly once when dropped. Whoever last holds the view
/// owns the obligation to drop it promptly. Release hooks must be
/// non-blocking and safe to run on the core thread.
pub struct FrameView {
    pub device_instance_id: u64,
    /// 0 if this frame belongs only to a still capture.
    pub stream_id: u64,
    /// 0 if this is a repeating stream frame.
    pub capture_id: u64,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    /// Platform timestamp; 0 if unknown.
    pub timestamp_ns: u64,
    pub data: Arc<[u8]>,
    /// Per-row stride; 0 means tightly packed or unknown.
    pub stride_bytes: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameView {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_instance_id: u64,
        stream_id: u64,
        capture_id: u64,
        width: u32,
        height: u32,
        format_fourcc: u32,
        timestamp_ns: u64,
        data: Arc<[u8]>,
        stride_bytes: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        OUTSTANDING_FRAMES.fetch_add(1, Ordering::SeqCst);
        Self {
            device_instance_id,
            stream_id,
            capture_id,
            width,
            height,
            format_fourcc,
            timestamp_ns,
            data,
            stride_bytes,
            release: Some(Box::new(release)),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Explicitly release the underlying buffer back to the provider.
    /// Equivalent to dropping the view.
    pub fn release_now(self) {}
}

impl Drop for FrameView {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            OUTSTANDING_FRAMES.fetch_sub(1, Ordering::SeqCst);
            release();
        }
    }
}

impl fmt::Debug for FrameView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("device_instance_id", &self.device_instance_id)
            .field("stream_id", &self.stream_id)
            .field("capture_id", &self.capture_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format_fourcc", &self.format_fourcc)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("size_bytes", &self.data.len())
            .field("stride_bytes", &self.stride_bytes)
            .finish()
    }
}

/// Core-facing provider interface.
///
/// All methods are called from the core thread only and must not block
/// indefinitely. Each returns a deterministic [`ProviderResult`]; facts
/// (confirmations, frames, errors) arrive later through the event sink.
pub trait CameraProvider: Send {
    /// Provider identity for logs and diagnostics.
    fn provider_name(&self) -> &str;

    /// Core supplies the event sink. The provider must deliver all events
    /// through it from a single serialised callback context.
    fn initialize(&mut self, callbacks: ProviderEventSink) -> ProviderResult;

    /// Enumerate platform camera endpoints.
    fn enumerate_endpoints(&mut self) -> Result<Vec<CameraEndpoint>, ProviderError>;

    /// Open a hardware endpoint into a core-issued instance/lineage.
    fn open_device(
        &mut self,
        hardware_id: &str,
        device_instance_id: u64,
        root_id: u64,
    ) -> ProviderResult;

    fn close_device(&mut self, device_instance_id: u64) -> ProviderResult;

    /// Create a repeating stream object. The core maintains the one
    /// non-stopped stream per device instance invariant.
    fn create_stream(&mut self, request: &StreamRequest) -> ProviderResult;

    fn destroy_stream(&mut self, stream_id: u64) -> ProviderResult;

    fn start_stream(&mut self, stream_id: u64) -> ProviderResult;

    fn stop_stream(&mut self, stream_id: u64) -> ProviderResult;

    /// Trigger a still capture (device or rig member).
    fn trigger_capture(&mut self, request: &CaptureRequest) -> ProviderResult;

    /// Best-effort abort of an in-flight capture. Providers that cannot
    /// abort return `NotSupported` deterministically.
    fn abort_capture(&mut self, capture_id: u64) -> ProviderResult;

    /// Core-validated spec patch hooks. May be a no-op for some providers.
    fn apply_camera_spec_patch(
        &mut self,
        hardware_id: &str,
        new_camera_spec_version: u64,
        patch: &[u8],
    ) -> ProviderResult;

    fn apply_imaging_spec_patch(
        &mut self,
        new_imaging_spec_version: u64,
        patch: &[u8],
    ) -> ProviderResult;

    /// Deterministic shutdown: stop streams, close devices, release
    /// platform resources.
    fn shutdown(&mut self) -> ProviderResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_frame_view_releases_exactly_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let data: Arc<[u8]> = Arc::from(vec![0u8; 4].into_boxed_slice());

        let frame = FrameView::new(1, 2, 0, 4, 1, crate::core::formats::FOURCC_RGBA, 42, data, 0, move || {
            assert!(!flag.swap(true, Ordering::SeqCst), "released twice");
        });
        assert_eq!(frame.size_bytes(), 4);
        drop(frame);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_frame_view_release_now() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let data: Arc<[u8]> = Arc::from(vec![0u8; 1].into_boxed_slice());

        let frame = FrameView::new(1, 0, 9, 1, 1, crate::core::formats::FOURCC_JPEG, 0, data, 0, move || {
            flag.store(true, Ordering::SeqCst);
        });
        frame.release_now();
        assert!(released.load(Ordering::SeqCst));
    }
}
