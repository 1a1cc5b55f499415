//! Published-snapshot invariants.
//!
//! Runs a mixed scenario (streams, rig sync capture, preemption, warm
//! teardown, retention sweep, shutdown) while recording every published
//! snapshot through a publish observer, then checks the structural
//! invariants that must hold for any observer at any time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use cambang::core::formats::{FOURCC_JPEG, FOURCC_NV12};
use cambang::core::{
    Core, CoreConfig, CoreHandle, ManualClock, Pending, Phase, Result, RigConfig, RigMode,
    Snapshot, StillProfile, StreamIntent, StreamMode, StreamProfile,
};
use cambang::providers::{SyntheticHandle, SyntheticProvider};

const START_NS: u64 = 1_000_000;
const RETENTION_NS: u64 = 5_000 * 1_000_000;

struct Recorded {
    snapshots: Arc<Mutex<Vec<Arc<Snapshot>>>>,
}

impl Recorded {
    fn all(&self) -> Vec<Arc<Snapshot>> {
        self.snapshots.lock().unwrap().clone()
    }
}

fn new_recorded_core() -> (Core, CoreHandle, SyntheticHandle, Arc<ManualClock>, Recorded) {
    let clock = Arc::new(ManualClock::new(START_NS));
    let (provider, synth) =
        SyntheticProvider::new(&[("camA", "Front"), ("camB", "Rear")], clock.clone());
    let (mut core, handle) =
        Core::new(Box::new(provider), CoreConfig::default(), clock.clone()).unwrap();

    let snapshots: Arc<Mutex<Vec<Arc<Snapshot>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let reader = handle.clone();
    core.add_publish_observer(Box::new(move |generation, _topology| {
        let snapshot = reader.snapshot();
        assert_eq!(snapshot.generation, generation, "observer sees the swap");
        sink.lock().unwrap().push(snapshot);
    }));

    (core, handle, synth, clock, Recorded { snapshots })
}

fn settle(core: &mut Core) {
    for _ in 0..4 {
        core.tick();
    }
}

fn run<T>(core: &mut Core, pending: Pending<T>) -> Result<T> {
    core.tick();
    pending.wait()
}

/// Drive the whole lifecycle once: engage, stream, rig capture, preemption,
/// warm teardown, retention, shutdown.
fn run_mixed_scenario(
    core: &mut Core,
    handle: &CoreHandle,
    synth: &SyntheticHandle,
    clock: &ManualClock,
) {
    let cam_a = run(core, handle.engage_device("camA").unwrap()).unwrap();
    let cam_b = run(core, handle.engage_device("camB").unwrap()).unwrap();
    settle(core);

    let stream_a = run(
        core,
        handle
            .create_stream(cam_a, StreamProfile {
                intent: StreamIntent::Preview,
                width: 1280,
                height: 720,
                format_fourcc: FOURCC_NV12,
                target_fps_min: 0,
                target_fps_max: 0,
                replace_existing: false,
            })
            .unwrap(),
    )
    .unwrap();
    run(core, handle.start_stream(stream_a).unwrap()).unwrap();
    settle(core);
    for _ in 0..3 {
        assert!(synth.emit_stream_frame(stream_a));
        core.tick();
    }

    let rig_id = run(
        core,
        handle
            .create_rig(
                "stereo",
                vec!["camA".to_string(), "camB".to_string()],
                RigConfig {
                    capture_profile: StillProfile {
                        width: 1920,
                        height: 1080,
                        format_fourcc: FOURCC_JPEG,
                    },
                },
            )
            .unwrap(),
    )
    .unwrap();
    run(core, handle.arm_rig(rig_id).unwrap()).unwrap();
    settle(core);

    // Sync capture preempts the flowing preview on camA.
    run(core, handle.trigger_rig_sync_capture(rig_id).unwrap()).unwrap();
    settle(core);

    run(core, handle.disarm_rig(rig_id).unwrap()).unwrap();
    settle(core);

    // Device capture on camB once the rig released it.
    run(core, handle.trigger_device_capture(cam_b).unwrap()).unwrap();
    settle(core);

    // Warm teardown of camA.
    run(core, handle.set_warm_policy(cam_a, 200).unwrap()).unwrap();
    run(core, handle.destroy_stream(stream_a).unwrap()).unwrap();
    settle(core);
    clock.advance_ms(201);
    settle(core);

    // Let camA's records age out while camB still lives.
    clock.advance_ms(5_001);
    settle(core);

    let shutdown = handle.shutdown().unwrap();
    core.tick();
    settle(core);
    assert_eq!(shutdown.wait(), Ok(()));
}

/// Derive a snapshot's topology identity the way consumers would.
fn topology_of(snapshot: &Snapshot) -> (
    BTreeSet<u64>,
    BTreeSet<(String, u64)>,
    BTreeSet<u64>,
    BTreeMap<u64, Vec<String>>,
    BTreeSet<u64>,
) {
    (
        snapshot.rigs.iter().map(|r| r.rig_id).collect(),
        snapshot
            .devices
            .iter()
            .map(|d| (d.hardware_id.clone(), d.instance_id))
            .collect(),
        snapshot.streams.iter().map(|s| s.stream_id).collect(),
        snapshot
            .rigs
            .iter()
            .map(|r| (r.rig_id, r.member_hardware_ids.clone()))
            .collect(),
        snapshot.native_objects.iter().map(|n| n.root_id).collect(),
    )
}

#[test]
fn test_snapshot_invariants_over_mixed_scenario() {
    let (mut core, handle, synth, clock, recorded) = new_recorded_core();
    run_mixed_scenario(&mut core, &handle, &synth, &clock);

    let snapshots = recorded.all();
    assert!(snapshots.len() >= 8, "scenario published {} times", snapshots.len());

    // Invariant: at most one live, non-stopped stream per device instance.
    for snapshot in &snapshots {
        let mut owners = BTreeSet::new();
        for stream in &snapshot.streams {
            if stream.phase == Phase::Live && stream.mode != StreamMode::Stopped {
                assert!(
                    owners.insert(stream.device_instance_id),
                    "two active streams on device {} at gen {}",
                    stream.device_instance_id,
                    snapshot.generation
                );
            }
        }
    }

    // Invariant: generation strictly increases; topology generation never
    // decreases and moves exactly when the topology identity changes.
    for pair in snapshots.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert!(next.generation > prev.generation);
        assert!(next.topology_generation >= prev.topology_generation);
        let changed = topology_of(prev) != topology_of(next);
        assert_eq!(
            next.topology_generation > prev.topology_generation,
            changed,
            "topology generation moved without a topology change (gen {})",
            next.generation
        );
    }

    // Invariant: native object phases only move forward.
    for pair in snapshots.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        for record in &next.native_objects {
            if let Some(earlier) = prev
                .native_objects
                .iter()
                .find(|n| n.native_id == record.native_id)
            {
                assert!(
                    record.phase >= earlier.phase,
                    "native {} regressed {:?} -> {:?}",
                    record.native_id,
                    earlier.phase,
                    record.phase
                );
            }
        }
    }

    // Invariant: ids are unique within each space and never reused.
    let mut seen_roots: BTreeMap<u64, (String, u64)> = BTreeMap::new();
    for snapshot in &snapshots {
        for device in &snapshot.devices {
            let owner = (device.hardware_id.clone(), device.instance_id);
            if let Some(previous) = seen_roots.insert(device.root_id, owner.clone()) {
                assert_eq!(previous, owner, "root id {} reused", device.root_id);
            }
        }
    }

    // Invariant: destroyed records past retention are absent.
    for snapshot in &snapshots {
        for record in &snapshot.native_objects {
            if record.phase == Phase::Destroyed {
                assert!(
                    record.destroyed_ns + RETENTION_NS >= snapshot.timestamp_ns,
                    "expired record {} still visible at gen {}",
                    record.native_id,
                    snapshot.generation
                );
            }
        }
    }

    // Invariant: detached roots are exactly the retained lineages whose
    // owner is no longer present-and-alive.
    for snapshot in &snapshots {
        let mut expected = BTreeSet::new();
        let mut roots = BTreeSet::new();
        for record in &snapshot.native_objects {
            roots.insert(record.root_id);
        }
        for root in roots {
            let owner_live = snapshot.native_objects.iter().filter(|n| n.root_id == root).any(|n| {
                if n.owner_rig_id != 0 {
                    snapshot
                        .rig(n.owner_rig_id)
                        .map(|r| r.phase != Phase::Destroyed)
                        .unwrap_or(false)
                } else if n.owner_device_instance_id != 0 {
                    snapshot
                        .device(n.owner_device_instance_id)
                        .map(|d| d.phase != Phase::Destroyed)
                        .unwrap_or(false)
                } else {
                    false
                }
            });
            if !owner_live {
                expected.insert(root);
            }
        }
        let actual: BTreeSet<u64> = snapshot.detached_root_ids.iter().copied().collect();
        assert_eq!(actual, expected, "detached roots at gen {}", snapshot.generation);
    }

    // Invariant: a triggering/collecting rig has an active capture id and
    // every member device capturing.
    for snapshot in &snapshots {
        for rig in &snapshot.rigs {
            if matches!(rig.mode, RigMode::Triggering | RigMode::Collecting) {
                assert_ne!(rig.active_capture_id, 0);
                for device in &snapshot.devices {
                    if device.rig_id == rig.rig_id {
                        assert_eq!(
                            device.mode,
                            cambang::core::DeviceMode::Capturing,
                            "rig member {} not capturing at gen {}",
                            device.instance_id,
                            snapshot.generation
                        );
                    }
                }
            }
        }
    }

    // Invariant: a sweep that removed records published a newer generation
    // with them gone; record disappearance always coincides with a strictly
    // newer snapshot.
    let mut sweep_observed = false;
    for pair in snapshots.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let prev_ids: BTreeSet<u64> =
            prev.native_objects.iter().map(|n| n.native_id).collect();
        let next_ids: BTreeSet<u64> =
            next.native_objects.iter().map(|n| n.native_id).collect();
        if prev_ids.difference(&next_ids).next().is_some() {
            sweep_observed = true;
            assert!(next.generation > prev.generation);
        }
    }
    assert!(sweep_observed, "scenario exercised the retention sweep");

    // The scenario ends fully torn down.
    let last = snapshots.last().unwrap();
    assert!(last.devices.iter().all(|d| d.phase == Phase::Destroyed));
}

#[test]
fn test_readers_keep_snapshots_across_later_publishes() {
    let (mut core, handle, _synth, _clock, recorded) = new_recorded_core();

    let instance = run(&mut core, handle.engage_device("camA").unwrap()).unwrap();
    settle(&mut core);
    let held = handle.snapshot();
    let held_generation = held.generation;

    run(&mut core, handle.disengage_device(instance).unwrap()).unwrap();
    settle(&mut core);

    // The held reference still describes the old world.
    assert_eq!(held.generation, held_generation);
    assert_eq!(held.device(instance).unwrap().phase, Phase::Live);
    assert!(handle.snapshot().generation > held_generation);
    assert!(recorded.all().len() >= 2);
}
