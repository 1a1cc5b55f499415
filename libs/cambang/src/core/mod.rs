// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! cambang core: the camera orchestration runtime.
//!
//! The core is authoritative for policy: which cameras stream, which
//! captures run, when resources are released, and what state is
//! observable. Providers execute platform calls and report facts.
//! A single dedicated thread serialises host commands and provider events,
//! and publishes immutable snapshots for lock-free readers.

pub mod arbitration;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod formats;
pub mod ids;
pub mod provider;
pub mod publisher;
pub mod queues;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod specs;
pub mod state;
pub mod timers;

// Re-export core types
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use commands::{Pending, RigConfig, StillProfile, StreamProfile};
pub use config::CoreConfig;
pub use error::{CoreError, ProviderError, ProviderResult, Result};
pub use events::{ProviderEvent, ProviderEventSink};
pub use provider::{
    CameraEndpoint, CameraProvider, CaptureRequest, FrameView, NativeObjectCreateInfo,
    NativeObjectKind, StreamIntent, StreamRequest,
};
pub use publisher::SnapshotCell;
pub use runtime::{Core, CoreHandle, CoreRuntime, FrameConsumer};
pub use snapshot::{
    DeviceSnapshot, NativeObjectSnapshot, RigSnapshot, Snapshot, StreamSnapshot,
    SNAPSHOT_SCHEMA_VERSION,
};
pub use specs::{ApplyMode, CapabilityMode, CapabilitySet};
pub use state::{DeviceMode, Phase, RigMode, StopReason, StreamMode};
