// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Immutable state snapshots.
//!
//! A snapshot is a flat array-of-records copy of core state, built on the
//! core thread and shared by reference afterwards. Readers may keep a
//! snapshot indefinitely without affecting the writer. `generation`
//! increments on every publish; `topology_generation` only when the set of
//! rigs, device instances, streams, rig memberships, or registry roots
//! changed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::provider::{NativeObjectKind, StreamIntent};
use super::registry::LifecycleRegistry;
use super::state::{
    CoreState, DeviceMode, Phase, RigMode, StopReason, StreamMode,
};

/// Bump when snapshot field layout changes.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigSnapshot {
    pub rig_id: u64,
    pub name: String,
    pub phase: Phase,
    pub mode: RigMode,
    pub member_hardware_ids: Vec<String>,
    pub active_capture_id: u64,
    pub capture_profile_version: u64,
    pub captures_triggered: u64,
    pub captures_completed: u64,
    pub captures_failed: u64,
    pub last_capture_id: u64,
    pub last_capture_latency_ns: u64,
    pub last_sync_skew_ns: u64,
    pub error_code: Option<ProviderError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub hardware_id: String,
    pub instance_id: u64,
    pub root_id: u64,
    pub phase: Phase,
    pub mode: DeviceMode,
    pub engaged: bool,
    pub rig_id: u64,
    pub camera_spec_version: u64,
    pub capture_profile_version: u64,
    pub warm_hold_ms: u64,
    /// Remaining warm window at snapshot time; 0 when no warm timer.
    pub warm_remaining_ms: u64,
    pub rebuild_count: u64,
    pub errors_count: u64,
    pub last_error_code: Option<ProviderError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub stream_id: u64,
    pub device_instance_id: u64,
    pub phase: Phase,
    pub intent: StreamIntent,
    pub mode: StreamMode,
    pub stop_reason: StopReason,
    pub profile_version: u64,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    pub target_fps_min: u32,
    pub target_fps_max: u32,
    pub frames_received: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    /// Provider buffers currently in use on this stream's pipeline.
    pub queue_depth: u32,
    pub last_frame_ts_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeObjectSnapshot {
    pub native_id: u64,
    pub kind: NativeObjectKind,
    pub phase: Phase,
    pub owner_rig_id: u64,
    pub owner_device_instance_id: u64,
    pub owner_stream_id: u64,
    pub root_id: u64,
    pub created_ns: u64,
    pub destroyed_ns: u64,
    pub bytes_allocated: u64,
    pub buffers_in_use: u32,
}

/// Immutable composite published by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub generation: u64,
    pub topology_generation: u64,
    pub timestamp_ns: u64,
    pub imaging_spec_version: u64,
    pub rigs: Vec<RigSnapshot>,
    pub devices: Vec<DeviceSnapshot>,
    pub streams: Vec<StreamSnapshot>,
    pub native_objects: Vec<NativeObjectSnapshot>,
    /// Lineages whose owner is gone but whose records remain retained.
    pub detached_root_ids: Vec<u64>,
}

impl Snapshot {
    /// The pre-publish snapshot readers see before the first real publish.
    pub fn empty() -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            generation: 0,
            topology_generation: 0,
            timestamp_ns: 0,
            imaging_spec_version: 0,
            rigs: Vec::new(),
            devices: Vec::new(),
            streams: Vec::new(),
            native_objects: Vec::new(),
            detached_root_ids: Vec::new(),
        }
    }

    pub fn device(&self, instance_id: u64) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.instance_id == instance_id)
    }

    pub fn stream(&self, stream_id: u64) -> Option<&StreamSnapshot> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }

    pub fn rig(&self, rig_id: u64) -> Option<&RigSnapshot> {
        self.rigs.iter().find(|r| r.rig_id == rig_id)
    }
}

/// The identity sets whose change bumps `topology_generation`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct TopologyKey {
    rig_ids: BTreeSet<u64>,
    device_instances: BTreeSet<(String, u64)>,
    stream_ids: BTreeSet<u64>,
    rig_memberships: BTreeMap<u64, Vec<String>>,
    root_ids: BTreeSet<u64>,
}

impl TopologyKey {
    fn of(state: &CoreState, registry: &LifecycleRegistry) -> Self {
        Self {
            rig_ids: state.rigs.keys().copied().collect(),
            device_instances: state
                .devices
                .values()
                .map(|d| (d.hardware_id.clone(), d.instance_id))
                .collect(),
            stream_ids: state.streams.keys().copied().collect(),
            rig_memberships: state
                .rigs
                .values()
                .map(|r| (r.rig_id, r.member_hardware_ids.clone()))
                .collect(),
            root_ids: registry.root_ids(),
        }
    }
}

/// Assembles snapshots and tracks topology generations across publishes.
#[derive(Debug)]
pub struct SnapshotBuilder {
    last_topology: TopologyKey,
    topology_generation: u64,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self {
            // Empty topology is the baseline; publishing an empty core does
            // not bump the generation.
            last_topology: TopologyKey::default(),
            topology_generation: 0,
        }
    }
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot of the current state. `generation` is stamped by
    /// the publisher at publish time.
    pub fn build(
        &mut self,
        state: &CoreState,
        registry: &LifecycleRegistry,
        imaging_spec_version: u64,
        now_ns: u64,
    ) -> Snapshot {
        let key = TopologyKey::of(state, registry);
        if self.last_topology != key {
            self.topology_generation += 1;
            self.last_topology = key;
        }

        let mut rigs: Vec<RigSnapshot> = state
            .rigs
            .values()
            .map(|r| RigSnapshot {
                rig_id: r.rig_id,
                name: r.name.clone(),
                phase: r.phase,
                mode: r.mode,
                member_hardware_ids: r.member_hardware_ids.clone(),
                active_capture_id: r.active_capture_id,
                capture_profile_version: r.capture_profile_version,
                captures_triggered: r.captures_triggered,
                captures_completed: r.captures_completed,
                captures_failed: r.captures_failed,
                last_capture_id: r.last_capture_id,
                last_capture_latency_ns: r.last_capture_latency_ns,
                last_sync_skew_ns: r.last_sync_skew_ns,
                error_code: r.error_code,
            })
            .collect();
        rigs.sort_unstable_by_key(|r| r.rig_id);

        let mut devices: Vec<DeviceSnapshot> = state
            .devices
            .values()
            .map(|d| DeviceSnapshot {
                hardware_id: d.hardware_id.clone(),
                instance_id: d.instance_id,
                root_id: d.root_id,
                phase: d.phase,
                mode: d.mode,
                engaged: d.engaged,
                rig_id: d.rig_id,
                camera_spec_version: d.camera_spec_version,
                capture_profile_version: d.capture_profile_version,
                warm_hold_ms: d.warm_hold_ms,
                warm_remaining_ms: d
                    .warm_deadline_ns
                    .saturating_sub(now_ns)
                    / 1_000_000,
                rebuild_count: d.rebuild_count,
                errors_count: d.errors_count,
                last_error_code: d.last_error_code,
            })
            .collect();
        devices.sort_unstable_by_key(|d| d.instance_id);

        let mut streams: Vec<StreamSnapshot> = state
            .streams
            .values()
            .map(|s| StreamSnapshot {
                stream_id: s.stream_id,
                device_instance_id: s.device_instance_id,
                phase: s.phase,
                intent: s.intent,
                mode: s.mode,
                stop_reason: s.stop_reason,
                profile_version: s.profile_version,
                width: s.width,
                height: s.height,
                format_fourcc: s.format_fourcc,
                target_fps_min: s.target_fps_min,
                target_fps_max: s.target_fps_max,
                frames_received: s.frames_received,
                frames_delivered: s.frames_delivered,
                frames_dropped: s.frames_dropped,
                queue_depth: registry
                    .records()
                    .filter(|r| r.owner_stream_id == s.stream_id)
                    .map(|r| r.buffers_in_use)
                    .sum(),
                last_frame_ts_ns: s.last_frame_ts_ns,
            })
            .collect();
        streams.sort_unstable_by_key(|s| s.stream_id);

        let mut native_objects: Vec<NativeObjectSnapshot> = registry
            .records()
            .map(|r| NativeObjectSnapshot {
                native_id: r.native_id,
                kind: r.kind,
                phase: r.phase,
                owner_rig_id: r.owner_rig_id,
                owner_device_instance_id: r.owner_device_instance_id,
                owner_stream_id: r.owner_stream_id,
                root_id: r.root_id,
                created_ns: r.created_ns,
                destroyed_ns: r.destroyed_ns,
                bytes_allocated: r.bytes_allocated,
                buffers_in_use: r.buffers_in_use,
            })
            .collect();
        native_objects.sort_unstable_by_key(|n| n.native_id);

        let detached_root_ids: Vec<u64> = registry
            .detached_roots(|owner| match owner {
                super::registry::RecordOwner::Rig(rig_id) => state
                    .rigs
                    .get(&rig_id)
                    .map(|r| r.phase != Phase::Destroyed)
                    .unwrap_or(false),
                super::registry::RecordOwner::Device(instance_id) => state
                    .devices
                    .get(&instance_id)
                    .map(|d| d.phase != Phase::Destroyed)
                    .unwrap_or(false),
                super::registry::RecordOwner::None => false,
            })
            .into_iter()
            .collect();

        Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            generation: 0,
            topology_generation: self.topology_generation,
            timestamp_ns: now_ns,
            imaging_spec_version,
            rigs,
            devices,
            streams,
            native_objects,
            detached_root_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::DeviceState;

    #[test]
    fn test_topology_generation_bumps_only_on_identity_change() {
        let mut state = CoreState::new();
        let registry = LifecycleRegistry::new();
        let mut builder = SnapshotBuilder::new();

        let first = builder.build(&state, &registry, 1, 100);
        assert_eq!(first.topology_generation, 0);

        let mut device = DeviceState::new("camA".into(), 1, 1);
        device.phase = Phase::Live;
        state.devices.insert(1, device);
        let second = builder.build(&state, &registry, 1, 300);
        assert_eq!(second.topology_generation, 1);

        // Mode churn is not topology.
        state.devices.get_mut(&1).unwrap().engaged = false;
        let third = builder.build(&state, &registry, 1, 400);
        assert_eq!(third.topology_generation, 1);

        state.devices.remove(&1);
        let fourth = builder.build(&state, &registry, 1, 500);
        assert_eq!(fourth.topology_generation, 2);
    }

    #[test]
    fn test_warm_remaining_is_clamped() {
        let mut state = CoreState::new();
        let registry = LifecycleRegistry::new();
        let mut builder = SnapshotBuilder::new();

        let mut device = DeviceState::new("camA".into(), 1, 1);
        device.phase = Phase::Live;
        device.warm_hold_ms = 500;
        device.warm_deadline_ns = 1_500_000_000;
        state.devices.insert(1, device);

        let snap = builder.build(&state, &registry, 1, 1_499_000_000);
        assert_eq!(snap.device(1).unwrap().warm_remaining_ms, 1);

        let snap = builder.build(&state, &registry, 1, 2_000_000_000);
        assert_eq!(snap.device(1).unwrap().warm_remaining_ms, 0);
    }

    #[test]
    fn test_detached_roots_cover_dead_owners() {
        let mut state = CoreState::new();
        let mut registry = LifecycleRegistry::new();
        let mut builder = SnapshotBuilder::new();

        let mut device = DeviceState::new("camA".into(), 1, 10);
        device.phase = Phase::Live;
        state.devices.insert(1, device);

        registry.on_created(1, &crate::core::provider::NativeObjectCreateInfo {
            provider_token: 0,
            kind: NativeObjectKind::DeviceSession,
            root_id: 10,
            owner_rig_id: 0,
            owner_device_instance_id: 1,
            owner_stream_id: 0,
            created_ns: 1,
            bytes_allocated: 0,
            buffers_in_use: 0,
        });

        let snap = builder.build(&state, &registry, 1, 100);
        assert!(snap.detached_root_ids.is_empty());

        state.devices.get_mut(&1).unwrap().phase = Phase::Destroyed;
        let snap = builder.build(&state, &registry, 1, 200);
        assert_eq!(snap.detached_root_ids, vec![10]);
    }
}
