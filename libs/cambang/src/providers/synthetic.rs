// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deterministic in-process provider.
//!
//! Confirms every lifecycle call synchronously through the event sink and
//! reports native objects for each device session and stream pipeline, so
//! the core's behavior can be exercised without platform hardware. A shared
//! [`SyntheticHandle`] scripts the parts a platform would drive on its own:
//! frame delivery, capture completion, error injection, and per-hardware
//! capture timestamp offsets (for sync-skew scenarios).
//!
//! By default captures auto-complete at trigger time; switch to manual
//! captures to hold them in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::clock::Clock;
use crate::core::error::{ProviderError, ProviderResult};
use crate::core::events::ProviderEventSink;
use crate::core::provider::{
    CameraEndpoint, CameraProvider, CaptureRequest, FrameView, NativeObjectCreateInfo,
    NativeObjectKind, StreamRequest,
};

/// Provider operations that can have a failure injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthOp {
    OpenDevice,
    CloseDevice,
    CreateStream,
    DestroyStream,
    StartStream,
    StopStream,
    TriggerCapture,
    ApplyCameraSpec,
    ApplyImagingSpec,
}

struct SynthDevice {
    hardware_id: String,
    root_id: u64,
    session_token: u64,
}

struct SynthStream {
    device_instance_id: u64,
    hardware_id: String,
    token: u64,
    request: StreamRequest,
    flowing: bool,
}

struct Inner {
    endpoints: Vec<CameraEndpoint>,
    clock: Arc<dyn Clock>,
    sink: Option<ProviderEventSink>,
    next_token: u64,
    devices: HashMap<u64, SynthDevice>,
    streams: HashMap<u64, SynthStream>,
    captures_started: HashSet<u64>,
    manual_captures: bool,
    pending_captures: HashMap<u64, Vec<CaptureRequest>>,
    ts_offset_ns: HashMap<String, u64>,
    fail_next: HashMap<SynthOp, ProviderError>,
    calls: Vec<String>,
    frames_outstanding: Arc<AtomicU64>,
    shut_down: bool,
}

impl Inner {
    fn sink(&self) -> &ProviderEventSink {
        self.sink.as_ref().expect("provider not initialized")
    }

    fn take_failure(&mut self, op: SynthOp) -> ProviderResult {
        if self.shut_down {
            return Err(ProviderError::ShuttingDown);
        }
        match self.fail_next.remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn frame(
        &self,
        device_instance_id: u64,
        stream_id: u64,
        capture_id: u64,
        width: u32,
        height: u32,
        format_fourcc: u32,
        timestamp_ns: u64,
    ) -> FrameView {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 64].into_boxed_slice());
        let outstanding = Arc::clone(&self.frames_outstanding);
        outstanding.fetch_add(1, Ordering::SeqCst);
        FrameView::new(
            device_instance_id,
            stream_id,
            capture_id,
            width,
            height,
            format_fourcc,
            timestamp_ns,
            data,
            0,
            move || {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            },
        )
    }

    fn capture_timestamp(&self, hardware_id: &str) -> u64 {
        self.clock.now_ns() + self.ts_offset_ns.get(hardware_id).copied().unwrap_or(0)
    }

    /// Emit the frame + completion events one member call contributes.
    fn deliver_capture(&mut self, request: &CaptureRequest) {
        let hardware_id = self
            .devices
            .get(&request.device_instance_id)
            .map(|d| d.hardware_id.clone())
            .unwrap_or_default();
        let timestamp = self.capture_timestamp(&hardware_id);
        let frame = self.frame(
            request.device_instance_id,
            0,
            request.capture_id,
            request.width,
            request.height,
            request.format_fourcc,
            timestamp,
        );
        self.sink().on_frame(frame);
        self.sink().on_capture_completed(request.capture_id);
    }
}

/// Deterministic provider for tests and demos.
pub struct SyntheticProvider {
    inner: Arc<Mutex<Inner>>,
}

/// Shared control surface for a [`SyntheticProvider`].
#[derive(Clone)]
pub struct SyntheticHandle {
    inner: Arc<Mutex<Inner>>,
}

impl SyntheticProvider {
    /// `endpoints` is a list of `(hardware_id, name)` pairs.
    pub fn new(endpoints: &[(&str, &str)], clock: Arc<dyn Clock>) -> (Self, SyntheticHandle) {
        let inner = Arc::new(Mutex::new(Inner {
            endpoints: endpoints
                .iter()
                .map(|(hardware_id, name)| CameraEndpoint {
                    hardware_id: hardware_id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
            clock,
            sink: None,
            next_token: 1,
            devices: HashMap::new(),
            streams: HashMap::new(),
            captures_started: HashSet::new(),
            manual_captures: false,
            pending_captures: HashMap::new(),
            ts_offset_ns: HashMap::new(),
            fail_next: HashMap::new(),
            calls: Vec::new(),
            frames_outstanding: Arc::new(AtomicU64::new(0)),
            shut_down: false,
        }));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            SyntheticHandle { inner },
        )
    }
}

impl CameraProvider for SyntheticProvider {
    fn provider_name(&self) -> &str {
        "synthetic"
    }

    fn initialize(&mut self, callbacks: ProviderEventSink) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push("initialize".to_string());
        inner.sink = Some(callbacks);
        Ok(())
    }

    fn enumerate_endpoints(&mut self) -> Result<Vec<CameraEndpoint>, ProviderError> {
        let mut inner = self.inner.lock();
        inner.calls.push("enumerate_endpoints".to_string());
        if inner.shut_down {
            return Err(ProviderError::ShuttingDown);
        }
        Ok(inner.endpoints.clone())
    }

    fn open_device(
        &mut self,
        hardware_id: &str,
        device_instance_id: u64,
        root_id: u64,
    ) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(format!("open_device {hardware_id}#{device_instance_id}"));
        inner.take_failure(SynthOp::OpenDevice)?;
        if !inner.endpoints.iter().any(|e| e.hardware_id == hardware_id) {
            return Err(ProviderError::InvalidArgument);
        }
        if inner.devices.contains_key(&device_instance_id) {
            return Err(ProviderError::BadState);
        }
        let session_token = inner.next_token();
        inner.devices.insert(device_instance_id, SynthDevice {
            hardware_id: hardware_id.to_string(),
            root_id,
            session_token,
        });
        let created_ns = inner.clock.now_ns();
        inner.sink().on_native_object_created(NativeObjectCreateInfo {
            provider_token: session_token,
            kind: NativeObjectKind::DeviceSession,
            root_id,
            owner_rig_id: 0,
            owner_device_instance_id: device_instance_id,
            owner_stream_id: 0,
            created_ns,
            bytes_allocated: 1 << 20,
            buffers_in_use: 0,
        });
        inner.sink().on_device_opened(device_instance_id);
        Ok(())
    }

    fn close_device(&mut self, device_instance_id: u64) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("close_device #{device_instance_id}"));
        inner.take_failure(SynthOp::CloseDevice)?;
        let Some(device) = inner.devices.remove(&device_instance_id) else {
            return Err(ProviderError::BadState);
        };
        // Leftover streams (the core normally destroys them first).
        let leftovers: Vec<u64> = inner
            .streams
            .iter()
            .filter(|(_, s)| s.device_instance_id == device_instance_id)
            .map(|(id, _)| *id)
            .collect();
        let now = inner.clock.now_ns();
        for stream_id in leftovers {
            if let Some(stream) = inner.streams.remove(&stream_id) {
                if stream.flowing {
                    inner.sink().on_stream_stopped(stream_id, None);
                }
                inner.sink().on_native_object_destroyed(stream.token, now);
                inner.sink().on_stream_destroyed(stream_id);
            }
        }
        inner
            .sink()
            .on_native_object_destroyed(device.session_token, now);
        inner.sink().on_device_closed(device_instance_id);
        Ok(())
    }

    fn create_stream(&mut self, request: &StreamRequest) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!(
            "create_stream #{} on #{}",
            request.stream_id, request.device_instance_id
        ));
        inner.take_failure(SynthOp::CreateStream)?;
        let Some(device) = inner.devices.get(&request.device_instance_id) else {
            return Err(ProviderError::BadState);
        };
        let root_id = device.root_id;
        let hardware_id = device.hardware_id.clone();
        let token = inner.next_token();
        inner.streams.insert(request.stream_id, SynthStream {
            device_instance_id: request.device_instance_id,
            hardware_id,
            token,
            request: request.clone(),
            flowing: false,
        });
        let created_ns = inner.clock.now_ns();
        inner.sink().on_native_object_created(NativeObjectCreateInfo {
            provider_token: token,
            kind: NativeObjectKind::StreamPipeline,
            root_id,
            owner_rig_id: 0,
            owner_device_instance_id: request.device_instance_id,
            owner_stream_id: request.stream_id,
            created_ns,
            bytes_allocated: (request.width as u64) * (request.height as u64) * 4,
            buffers_in_use: 4,
        });
        inner.sink().on_stream_created(request.stream_id);
        Ok(())
    }

    fn destroy_stream(&mut self, stream_id: u64) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("destroy_stream #{stream_id}"));
        inner.take_failure(SynthOp::DestroyStream)?;
        let Some(stream) = inner.streams.remove(&stream_id) else {
            return Err(ProviderError::BadState);
        };
        if stream.flowing {
            inner.sink().on_stream_stopped(stream_id, None);
        }
        let now = inner.clock.now_ns();
        inner.sink().on_native_object_destroyed(stream.token, now);
        inner.sink().on_stream_destroyed(stream_id);
        Ok(())
    }

    fn start_stream(&mut self, stream_id: u64) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("start_stream #{stream_id}"));
        inner.take_failure(SynthOp::StartStream)?;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Err(ProviderError::BadState);
        };
        if stream.flowing {
            return Err(ProviderError::BadState);
        }
        stream.flowing = true;
        inner.sink().on_stream_started(stream_id);
        Ok(())
    }

    fn stop_stream(&mut self, stream_id: u64) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("stop_stream #{stream_id}"));
        inner.take_failure(SynthOp::StopStream)?;
        let Some(stream) = inner.streams.get_mut(&stream_id) else {
            return Err(ProviderError::BadState);
        };
        if stream.flowing {
            stream.flowing = false;
            inner.sink().on_stream_stopped(stream_id, None);
        }
        Ok(())
    }

    fn trigger_capture(&mut self, request: &CaptureRequest) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!(
            "trigger_capture #{} on #{} rig #{}",
            request.capture_id, request.device_instance_id, request.rig_id
        ));
        inner.take_failure(SynthOp::TriggerCapture)?;
        if !inner.devices.contains_key(&request.device_instance_id) {
            return Err(ProviderError::BadState);
        }
        if inner.captures_started.insert(request.capture_id) {
            inner.sink().on_capture_started(request.capture_id);
        }
        if inner.manual_captures {
            inner
                .pending_captures
                .entry(request.capture_id)
                .or_default()
                .push(request.clone());
        } else {
            inner.deliver_capture(request);
        }
        Ok(())
    }

    fn abort_capture(&mut self, capture_id: u64) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("abort_capture #{capture_id}"));
        // Synthetic captures cannot be aborted, deterministically.
        Err(ProviderError::NotSupported)
    }

    fn apply_camera_spec_patch(
        &mut self,
        hardware_id: &str,
        new_camera_spec_version: u64,
        _patch: &[u8],
    ) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push(format!(
            "apply_camera_spec_patch {hardware_id} v{new_camera_spec_version}"
        ));
        inner.take_failure(SynthOp::ApplyCameraSpec)
    }

    fn apply_imaging_spec_patch(
        &mut self,
        new_imaging_spec_version: u64,
        _patch: &[u8],
    ) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(format!("apply_imaging_spec_patch v{new_imaging_spec_version}"));
        inner.take_failure(SynthOp::ApplyImagingSpec)
    }

    fn shutdown(&mut self) -> ProviderResult {
        let mut inner = self.inner.lock();
        inner.calls.push("shutdown".to_string());
        inner.shut_down = true;
        inner.streams.clear();
        inner.devices.clear();
        inner.pending_captures.clear();
        Ok(())
    }
}

impl SyntheticHandle {
    /// Hold triggered captures in flight until completed or failed through
    /// this handle.
    pub fn set_manual_captures(&self, manual: bool) {
        self.inner.lock().manual_captures = manual;
    }

    /// Added to every capture frame timestamp for this hardware id.
    pub fn set_timestamp_offset_ns(&self, hardware_id: &str, offset_ns: u64) {
        self.inner
            .lock()
            .ts_offset_ns
            .insert(hardware_id.to_string(), offset_ns);
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: SynthOp, error: ProviderError) {
        self.inner.lock().fail_next.insert(op, error);
    }

    /// Deliver one frame on a flowing stream. Returns false if the stream
    /// is unknown or not flowing.
    pub fn emit_stream_frame(&self, stream_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get(&stream_id) else {
            return false;
        };
        if !stream.flowing {
            return false;
        }
        let device_instance_id = stream.device_instance_id;
        let hardware_id = stream.hardware_id.clone();
        let request = stream.request.clone();
        let timestamp = inner.capture_timestamp(&hardware_id);
        let frame = inner.frame(
            device_instance_id,
            stream_id,
            0,
            request.width,
            request.height,
            request.format_fourcc,
            timestamp,
        );
        inner.sink().on_frame(frame);
        true
    }

    /// Complete a manually held capture: member frames, then completion.
    pub fn complete_capture(&self, capture_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(requests) = inner.pending_captures.remove(&capture_id) else {
            return false;
        };
        for request in &requests {
            inner.deliver_capture(request);
        }
        true
    }

    /// Fail a manually held capture.
    pub fn fail_capture(&self, capture_id: u64, error: ProviderError) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending_captures.remove(&capture_id).is_none() {
            return false;
        }
        inner.sink().on_capture_failed(capture_id, error);
        true
    }

    pub fn emit_device_error(&self, device_instance_id: u64, error: ProviderError) {
        self.inner
            .lock()
            .sink()
            .on_device_error(device_instance_id, error);
    }

    pub fn emit_stream_error(&self, stream_id: u64, error: ProviderError) {
        self.inner.lock().sink().on_stream_error(stream_id, error);
    }

    /// Calls the core has made, in order, as display strings.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// Frames delivered but not yet released.
    pub fn outstanding_frames(&self) -> u64 {
        self.inner.lock().frames_outstanding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::events::ProviderEvent;
    use crate::core::formats;
    use crate::core::provider::StreamIntent;

    fn setup() -> (
        SyntheticProvider,
        SyntheticHandle,
        crossbeam_channel::Receiver<ProviderEvent>,
        Arc<ManualClock>,
    ) {
        let clock = Arc::new(ManualClock::new(1_000));
        let (mut provider, handle) = SyntheticProvider::new(&[("camA", "Front")], clock.clone());
        let (sink, rx) = ProviderEventSink::channel(64);
        provider.initialize(sink).unwrap();
        (provider, handle, rx, clock)
    }

    fn drain(rx: &crossbeam_channel::Receiver<ProviderEvent>) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_open_reports_session_object_then_confirm() {
        let (mut provider, _handle, rx, _clock) = setup();
        provider.open_device("camA", 1, 10).unwrap();
        let events = drain(&rx);
        assert!(matches!(events[0], ProviderEvent::NativeObjectCreated(_)));
        assert!(matches!(events[1], ProviderEvent::DeviceOpened {
            device_instance_id: 1
        }));
    }

    #[test]
    fn test_unknown_hardware_refused() {
        let (mut provider, _handle, rx, _clock) = setup();
        assert_eq!(
            provider.open_device("nope", 1, 10),
            Err(ProviderError::InvalidArgument)
        );
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_auto_capture_delivers_frame_and_completion() {
        let (mut provider, handle, rx, _clock) = setup();
        provider.open_device("camA", 1, 10).unwrap();
        handle.set_timestamp_offset_ns("camA", 500);
        drain(&rx);

        provider
            .trigger_capture(&CaptureRequest {
                capture_id: 7,
                device_instance_id: 1,
                rig_id: 0,
                width: 1920,
                height: 1080,
                format_fourcc: formats::FOURCC_JPEG,
                profile_version: 1,
            })
            .unwrap();

        let events = drain(&rx);
        assert!(matches!(events[0], ProviderEvent::CaptureStarted { capture_id: 7 }));
        match &events[1] {
            ProviderEvent::Frame(frame) => {
                assert_eq!(frame.capture_id, 7);
                assert_eq!(frame.timestamp_ns, 1_500);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(events[2], ProviderEvent::CaptureCompleted {
            capture_id: 7
        }));
    }

    #[test]
    fn test_manual_capture_waits_for_handle() {
        let (mut provider, handle, rx, _clock) = setup();
        provider.open_device("camA", 1, 10).unwrap();
        handle.set_manual_captures(true);
        drain(&rx);

        provider
            .trigger_capture(&CaptureRequest {
                capture_id: 9,
                device_instance_id: 1,
                rig_id: 0,
                width: 640,
                height: 480,
                format_fourcc: formats::FOURCC_JPEG,
                profile_version: 1,
            })
            .unwrap();
        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProviderEvent::CaptureStarted { capture_id: 9 }));

        assert!(handle.complete_capture(9));
        let events = drain(&rx);
        assert!(matches!(events[0], ProviderEvent::Frame(_)));
        assert!(matches!(events[1], ProviderEvent::CaptureCompleted {
            capture_id: 9
        }));
        assert!(!handle.complete_capture(9));
    }

    #[test]
    fn test_stream_frames_only_while_flowing() {
        let (mut provider, handle, rx, _clock) = setup();
        provider.open_device("camA", 1, 10).unwrap();
        provider
            .create_stream(&StreamRequest {
                stream_id: 3,
                device_instance_id: 1,
                intent: StreamIntent::Preview,
                width: 1280,
                height: 720,
                format_fourcc: formats::FOURCC_NV12,
                target_fps_min: 1,
                target_fps_max: 30,
                profile_version: 1,
            })
            .unwrap();
        assert!(!handle.emit_stream_frame(3), "not started yet");

        provider.start_stream(3).unwrap();
        drain(&rx);
        assert!(handle.emit_stream_frame(3));
        let events = drain(&rx);
        match &events[0] {
            ProviderEvent::Frame(frame) => {
                assert_eq!(frame.stream_id, 3);
                assert_eq!(frame.capture_id, 0);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(handle.outstanding_frames(), 1);
        drop(events);
        assert_eq!(handle.outstanding_frames(), 0);
    }

    #[test]
    fn test_failure_injection_is_one_shot() {
        let (mut provider, handle, _rx, _clock) = setup();
        handle.fail_next(SynthOp::OpenDevice, ProviderError::PlatformConstraint);
        assert_eq!(
            provider.open_device("camA", 1, 10),
            Err(ProviderError::PlatformConstraint)
        );
        assert!(provider.open_device("camA", 1, 10).is_ok());
    }

    #[test]
    fn test_shutdown_refuses_further_work() {
        let (mut provider, _handle, _rx, _clock) = setup();
        provider.open_device("camA", 1, 10).unwrap();
        provider.shutdown().unwrap();
        assert_eq!(
            provider.open_device("camA", 2, 11),
            Err(ProviderError::ShuttingDown)
        );
    }
}
