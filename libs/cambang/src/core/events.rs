// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Provider → core event messages.
//!
//! Providers report facts through a [`ProviderEventSink`]; the core drains
//! them on its own thread, before commands, in enqueue order. The sink is
//! non-blocking: if the event queue is at capacity the event is dropped and
//! logged, never blocking the provider's callback context.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::error::ProviderError;
use super::provider::{FrameView, NativeObjectCreateInfo};

/// A fact reported by a provider.
#[derive(Debug)]
pub enum ProviderEvent {
    DeviceOpened {
        device_instance_id: u64,
    },
    DeviceClosed {
        device_instance_id: u64,
    },
    StreamCreated {
        stream_id: u64,
    },
    StreamDestroyed {
        stream_id: u64,
    },
    StreamStarted {
        stream_id: u64,
    },
    /// `error` is `None` when the stop was clean. The core derives the
    /// public stop_reason from its own intent plus this signal.
    StreamStopped {
        stream_id: u64,
        error: Option<ProviderError>,
    },
    CaptureStarted {
        capture_id: u64,
    },
    CaptureCompleted {
        capture_id: u64,
    },
    CaptureFailed {
        capture_id: u64,
        error: ProviderError,
    },
    Frame(FrameView),
    DeviceError {
        device_instance_id: u64,
        error: ProviderError,
    },
    StreamError {
        stream_id: u64,
        error: ProviderError,
    },
    NativeObjectCreated(NativeObjectCreateInfo),
    NativeObjectDestroyed {
        provider_token: u64,
        destroyed_ns: u64,
    },
}

/// Provider-held handle for reporting events into the core.
///
/// Cloneable; all clones feed the same bounded queue. Providers must invoke
/// it from a single serialised callback context per the contract.
#[derive(Clone)]
pub struct ProviderEventSink {
    tx: Sender<ProviderEvent>,
}

impl ProviderEventSink {
    pub(crate) fn new(tx: Sender<ProviderEvent>) -> Self {
        Self { tx }
    }

    /// Build a sink plus the core-side receiver.
    pub(crate) fn channel(capacity: usize) -> (Self, Receiver<ProviderEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::new(tx), rx)
    }

    fn push(&self, event: ProviderEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::error!(?event, "event queue full, provider event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("core gone, provider event dropped");
            }
        }
    }

    pub fn on_device_opened(&self, device_instance_id: u64) {
        self.push(ProviderEvent::DeviceOpened { device_instance_id });
    }

    pub fn on_device_closed(&self, device_instance_id: u64) {
        self.push(ProviderEvent::DeviceClosed { device_instance_id });
    }

    pub fn on_stream_created(&self, stream_id: u64) {
        self.push(ProviderEvent::StreamCreated { stream_id });
    }

    pub fn on_stream_destroyed(&self, stream_id: u64) {
        self.push(ProviderEvent::StreamDestroyed { stream_id });
    }

    pub fn on_stream_started(&self, stream_id: u64) {
        self.push(ProviderEvent::StreamStarted { stream_id });
    }

    pub fn on_stream_stopped(&self, stream_id: u64, error: Option<ProviderError>) {
        self.push(ProviderEvent::StreamStopped { stream_id, error });
    }

    pub fn on_capture_started(&self, capture_id: u64) {
        self.push(ProviderEvent::CaptureStarted { capture_id });
    }

    pub fn on_capture_completed(&self, capture_id: u64) {
        self.push(ProviderEvent::CaptureCompleted { capture_id });
    }

    pub fn on_capture_failed(&self, capture_id: u64, error: ProviderError) {
        self.push(ProviderEvent::CaptureFailed { capture_id, error });
    }

    pub fn on_frame(&self, frame: FrameView) {
        self.push(ProviderEvent::Frame(frame));
    }

    pub fn on_device_error(&self, device_instance_id: u64, error: ProviderError) {
        self.push(ProviderEvent::DeviceError {
            device_instance_id,
            error,
        });
    }

    pub fn on_stream_error(&self, stream_id: u64, error: ProviderError) {
        self.push(ProviderEvent::StreamError { stream_id, error });
    }

    pub fn on_native_object_created(&self, info: NativeObjectCreateInfo) {
        self.push(ProviderEvent::NativeObjectCreated(info));
    }

    pub fn on_native_object_destroyed(&self, provider_token: u64, destroyed_ns: u64) {
        self.push(ProviderEvent::NativeObjectDestroyed {
            provider_token,
            destroyed_ns,
        });
    }
}
