// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Rig / device / stream state.
//!
//! `Phase` tracks existence and teardown; `*Mode` tracks what an entity is
//! doing. Transitions form closed tables: command-side callers are expected
//! to have validated legality through arbitration, so an illegal transition
//! here is a programming error and debug-asserts. Late or duplicate provider
//! events for unknown entities are tolerated one level up, in the core loop.
//!
//! # Rig mode transitions
//!
//! ```text
//! OFF ──arm──► ARMED ──capture accepted──► TRIGGERING
//!  ▲             ▲                              │ first member frame
//!  │ disarm      │ all members complete         ▼
//!  └─────────────┴───────────────────────  COLLECTING
//!        (any) ──provider failure──► ERROR ──disarm──► OFF
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::commands::{RigConfig, StillProfile};
use super::error::ProviderError;
use super::provider::StreamIntent;
use super::timers::TimerHandle;

/// Lifecycle stage: existence and teardown. Forward-only, skips allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Created,
    Live,
    TearingDown,
    Destroyed,
}

impl Phase {
    /// Phase ordering is forward-only.
    pub fn can_advance_to(self, next: Phase) -> bool {
        next > self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RigMode {
    Off,
    Armed,
    Triggering,
    Collecting,
    Error,
}

impl RigMode {
    pub fn can_transition(self, to: RigMode) -> bool {
        use RigMode::*;
        matches!(
            (self, to),
            (Off, Armed)
                | (Armed, Triggering)
                | (Triggering, Collecting)
                | (Collecting, Armed)
                | (Armed, Off)
                | (Error, Off)
                | (_, Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    Idle,
    Streaming,
    Capturing,
    Error,
}

impl DeviceMode {
    pub fn can_transition(self, to: DeviceMode) -> bool {
        use DeviceMode::*;
        matches!(
            (self, to),
            (Idle, Streaming)
                | (Streaming, Idle)
                | (Idle, Capturing)
                | (Streaming, Capturing)
                | (Capturing, Idle)
                | (Capturing, Streaming)
                | (Error, Idle)
                | (_, Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamMode {
    Stopped,
    Flowing,
    Starved,
    Error,
}

impl StreamMode {
    pub fn can_transition(self, to: StreamMode) -> bool {
        use StreamMode::*;
        matches!(
            (self, to),
            (Stopped, Flowing)
                | (Flowing, Starved)
                | (Starved, Flowing)
                | (Flowing, Stopped)
                | (Starved, Stopped)
                | (Error, Stopped)
                | (_, Error)
        )
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    None,
    User,
    Preempted,
    Provider,
}

/// A named set of devices coordinated for synchronised capture.
#[derive(Debug, Clone)]
pub struct RigState {
    pub rig_id: u64,
    pub name: String,
    pub phase: Phase,
    pub mode: RigMode,
    /// Fixed membership, ordered. Resolved to instances at arm time.
    pub member_hardware_ids: Vec<String>,
    pub member_instances: Vec<u64>,
    pub config: RigConfig,
    pub active_capture_id: u64,
    pub capture_profile_version: u64,
    pub captures_triggered: u64,
    pub captures_completed: u64,
    pub captures_failed: u64,
    pub last_capture_id: u64,
    pub last_capture_latency_ns: u64,
    pub last_sync_skew_ns: u64,
    pub error_code: Option<ProviderError>,
    pub destroyed_ns: u64,
}

impl RigState {
    pub fn new(rig_id: u64, name: String, members: Vec<String>, config: RigConfig) -> Self {
        Self {
            rig_id,
            name,
            phase: Phase::Live,
            mode: RigMode::Off,
            member_hardware_ids: members,
            member_instances: Vec::new(),
            config,
            active_capture_id: 0,
            capture_profile_version: 1,
            captures_triggered: 0,
            captures_completed: 0,
            captures_failed: 0,
            last_capture_id: 0,
            last_capture_latency_ns: 0,
            last_sync_skew_ns: 0,
            error_code: None,
            destroyed_ns: 0,
        }
    }

    pub fn set_mode(&mut self, to: RigMode) {
        debug_assert!(
            self.mode.can_transition(to),
            "illegal rig transition {:?} -> {:?}",
            self.mode,
            to
        );
        self.mode = to;
    }

    pub fn is_armed(&self) -> bool {
        matches!(
            self.mode,
            RigMode::Armed | RigMode::Triggering | RigMode::Collecting
        )
    }

    pub fn capture_in_flight(&self) -> bool {
        matches!(self.mode, RigMode::Triggering | RigMode::Collecting)
    }
}

/// One open span of a hardware camera.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub hardware_id: String,
    pub instance_id: u64,
    pub root_id: u64,
    pub phase: Phase,
    pub mode: DeviceMode,
    /// Whether the host currently holds this device.
    pub engaged: bool,
    /// Armed rig this instance belongs to; 0 if none.
    pub rig_id: u64,
    pub camera_spec_version: u64,
    pub capture_profile_version: u64,
    pub still_profile: Option<StillProfile>,
    pub warm_hold_ms: u64,
    /// 0 when no warm timer is armed.
    pub warm_deadline_ns: u64,
    pub warm_timer: Option<TimerHandle>,
    pub rebuild_count: u64,
    pub errors_count: u64,
    pub last_error_code: Option<ProviderError>,
    /// In-flight capture on this device; 0 if none.
    pub active_capture_id: u64,
    pub destroyed_ns: u64,
}

impl DeviceState {
    pub fn new(hardware_id: String, instance_id: u64, root_id: u64) -> Self {
        Self {
            hardware_id,
            instance_id,
            root_id,
            phase: Phase::Created,
            mode: DeviceMode::Idle,
            engaged: true,
            rig_id: 0,
            camera_spec_version: 1,
            capture_profile_version: 0,
            still_profile: None,
            warm_hold_ms: 0,
            warm_deadline_ns: 0,
            warm_timer: None,
            rebuild_count: 0,
            errors_count: 0,
            last_error_code: None,
            active_capture_id: 0,
            destroyed_ns: 0,
        }
    }

    pub fn set_mode(&mut self, to: DeviceMode) {
        debug_assert!(
            self.mode.can_transition(to),
            "illegal device transition {:?} -> {:?}",
            self.mode,
            to
        );
        self.mode = to;
    }

    pub fn advance_phase(&mut self, to: Phase) {
        debug_assert!(
            self.phase.can_advance_to(to),
            "illegal device phase {:?} -> {:?}",
            self.phase,
            to
        );
        self.phase = to;
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.phase, Phase::Created | Phase::Live)
    }
}

/// A repeating stream bound to a device instance.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_id: u64,
    pub device_instance_id: u64,
    pub phase: Phase,
    pub intent: StreamIntent,
    pub mode: StreamMode,
    pub stop_reason: StopReason,
    /// Reason recorded when the core asks the provider to stop; applied
    /// once the stop is confirmed.
    pub pending_stop_reason: StopReason,
    pub profile_version: u64,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    pub target_fps_min: u32,
    pub target_fps_max: u32,
    pub frames_received: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub last_frame_ts_ns: u64,
    pub starve_timer: Option<TimerHandle>,
    pub destroyed_ns: u64,
}

impl StreamState {
    pub fn set_mode(&mut self, to: StreamMode) {
        debug_assert!(
            self.mode.can_transition(to),
            "illegal stream transition {:?} -> {:?}",
            self.mode,
            to
        );
        self.mode = to;
    }

    pub fn advance_phase(&mut self, to: Phase) {
        debug_assert!(
            self.phase.can_advance_to(to),
            "illegal stream phase {:?} -> {:?}",
            self.phase,
            to
        );
        self.phase = to;
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.phase, Phase::Created | Phase::Live)
    }

    /// Live and not stopped: counts against the one-per-device invariant.
    pub fn occupies_device(&self) -> bool {
        self.phase == Phase::Live && self.mode != StreamMode::Stopped
    }
}

/// An in-flight still capture (device or rig-synchronised).
#[derive(Debug, Clone)]
pub struct CaptureState {
    pub capture_id: u64,
    /// 0 for a plain device capture.
    pub rig_id: u64,
    pub member_instances: Vec<u64>,
    pub triggered_ns: u64,
    pub started: bool,
    pub completed_signaled: bool,
    /// Capture frame timestamp per member instance.
    pub frame_ts_ns: HashMap<u64, u64>,
}

impl CaptureState {
    /// All member frames observed and completion signalled.
    pub fn is_complete(&self) -> bool {
        self.completed_signaled && self.frame_ts_ns.len() == self.member_instances.len()
    }

    /// Max pairwise spread of member frame timestamps.
    pub fn sync_skew_ns(&self) -> u64 {
        let min = self.frame_ts_ns.values().min().copied().unwrap_or(0);
        let max = self.frame_ts_ns.values().max().copied().unwrap_or(0);
        max - min
    }
}

/// All mutable entity state, owned exclusively by the core thread.
#[derive(Debug, Default)]
pub struct CoreState {
    pub devices: HashMap<u64, DeviceState>,
    /// Live (non-destroyed) instance per hardware id.
    pub device_by_hardware: HashMap<String, u64>,
    pub streams: HashMap<u64, StreamState>,
    pub rigs: HashMap<u64, RigState>,
    pub captures: HashMap<u64, CaptureState>,
}

impl CoreState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams of a device, any phase.
    pub fn streams_of_device(&self, device_instance_id: u64) -> impl Iterator<Item = &StreamState> {
        self.streams
            .values()
            .filter(move |s| s.device_instance_id == device_instance_id)
    }

    /// The alive (non-destroyed-phase) stream on a device, if any.
    pub fn alive_stream_of_device(&self, device_instance_id: u64) -> Option<&StreamState> {
        self.streams
            .values()
            .find(|s| s.device_instance_id == device_instance_id && s.is_alive())
    }

    pub fn device_has_flowing_stream(&self, device_instance_id: u64) -> bool {
        self.streams_of_device(device_instance_id)
            .any(|s| matches!(s.mode, StreamMode::Flowing | StreamMode::Starved))
    }

    /// The armed rig this device instance belongs to, if any.
    pub fn armed_rig_of_device(&self, device_instance_id: u64) -> Option<&RigState> {
        let device = self.devices.get(&device_instance_id)?;
        if device.rig_id == 0 {
            return None;
        }
        self.rigs
            .get(&device.rig_id)
            .filter(|r| r.is_armed())
    }

    pub fn capture_in_flight_on_device(&self, device_instance_id: u64) -> bool {
        self.devices
            .get(&device_instance_id)
            .map(|d| d.active_capture_id != 0)
            .unwrap_or(false)
    }

    /// A device is in use while it has a non-stopped live stream or an
    /// in-flight capture; otherwise it is idle and warm-hold eligible.
    pub fn device_in_use(&self, device_instance_id: u64) -> bool {
        self.capture_in_flight_on_device(device_instance_id)
            || self
                .streams_of_device(device_instance_id)
                .any(|s| s.occupies_device())
    }

    /// Whether any engaged instance of this hardware exists.
    pub fn hardware_engaged(&self, hardware_id: &str) -> bool {
        self.device_by_hardware
            .get(hardware_id)
            .and_then(|id| self.devices.get(id))
            .map(|d| d.engaged && d.is_alive())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_is_forward_only() {
        assert!(Phase::Created.can_advance_to(Phase::Live));
        assert!(Phase::Created.can_advance_to(Phase::Destroyed));
        assert!(Phase::Live.can_advance_to(Phase::TearingDown));
        assert!(!Phase::Destroyed.can_advance_to(Phase::Live));
        assert!(!Phase::Live.can_advance_to(Phase::Live));
    }

    #[test]
    fn test_rig_transition_table() {
        assert!(RigMode::Off.can_transition(RigMode::Armed));
        assert!(RigMode::Armed.can_transition(RigMode::Triggering));
        assert!(RigMode::Triggering.can_transition(RigMode::Collecting));
        assert!(RigMode::Collecting.can_transition(RigMode::Armed));
        assert!(RigMode::Armed.can_transition(RigMode::Off));
        assert!(RigMode::Collecting.can_transition(RigMode::Error));
        assert!(RigMode::Error.can_transition(RigMode::Off));

        assert!(!RigMode::Off.can_transition(RigMode::Triggering));
        assert!(!RigMode::Triggering.can_transition(RigMode::Off));
        assert!(!RigMode::Collecting.can_transition(RigMode::Off));
    }

    #[test]
    fn test_device_transition_table() {
        assert!(DeviceMode::Idle.can_transition(DeviceMode::Streaming));
        assert!(DeviceMode::Streaming.can_transition(DeviceMode::Capturing));
        assert!(DeviceMode::Capturing.can_transition(DeviceMode::Idle));
        assert!(DeviceMode::Idle.can_transition(DeviceMode::Error));
        assert!(!DeviceMode::Idle.can_transition(DeviceMode::Idle));
        assert!(!DeviceMode::Error.can_transition(DeviceMode::Streaming));
    }

    #[test]
    fn test_stream_transition_table() {
        assert!(StreamMode::Stopped.can_transition(StreamMode::Flowing));
        assert!(StreamMode::Flowing.can_transition(StreamMode::Starved));
        assert!(StreamMode::Starved.can_transition(StreamMode::Flowing));
        assert!(StreamMode::Flowing.can_transition(StreamMode::Stopped));
        assert!(!StreamMode::Stopped.can_transition(StreamMode::Starved));
    }

    #[test]
    fn test_capture_completion_requires_all_member_frames() {
        let mut capture = CaptureState {
            capture_id: 5,
            rig_id: 1,
            member_instances: vec![10, 11],
            triggered_ns: 0,
            started: true,
            completed_signaled: false,
            frame_ts_ns: HashMap::new(),
        };
        capture.frame_ts_ns.insert(10, 1_000);
        capture.completed_signaled = true;
        assert!(!capture.is_complete());

        capture.frame_ts_ns.insert(11, 1_250);
        assert!(capture.is_complete());
        assert_eq!(capture.sync_skew_ns(), 250);
    }

    #[test]
    fn test_device_in_use_tracks_streams_and_captures() {
        let mut state = CoreState::new();
        let mut device = DeviceState::new("camA".into(), 1, 1);
        device.phase = Phase::Live;
        state.devices.insert(1, device);
        state.device_by_hardware.insert("camA".into(), 1);

        assert!(!state.device_in_use(1));

        state.streams.insert(7, StreamState {
            stream_id: 7,
            device_instance_id: 1,
            phase: Phase::Live,
            intent: StreamIntent::Preview,
            mode: StreamMode::Flowing,
            stop_reason: StopReason::None,
            pending_stop_reason: StopReason::None,
            profile_version: 1,
            width: 1280,
            height: 720,
            format_fourcc: crate::core::formats::FOURCC_NV12,
            target_fps_min: 1,
            target_fps_max: 30,
            frames_received: 0,
            frames_delivered: 0,
            frames_dropped: 0,
            last_frame_ts_ns: 0,
            starve_timer: None,
            destroyed_ns: 0,
        });
        assert!(state.device_in_use(1));

        state.streams.get_mut(&7).unwrap().set_mode(StreamMode::Stopped);
        assert!(!state.device_in_use(1));

        state.devices.get_mut(&1).unwrap().active_capture_id = 9;
        assert!(state.device_in_use(1));
    }
}
