// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Arbitration: priority, profile validation, deny/preempt decisions.
//!
//! Strict priority: rig sync capture > device still capture > repeating
//! stream. Checks here are pure over [`CoreState`] and the spec stores; the
//! core loop performs the provider calls the decisions demand. Denials
//! leave no trace: no state change, no counter increment.

use super::commands::{StillProfile, StreamProfile};
use super::error::{CoreError, Result};
use super::formats;
use super::provider::StreamIntent;
use super::specs::CapabilitySet;
use super::state::{CoreState, DeviceState, Phase, RigState, StreamState};

/// Validate a stream profile against a device's capability union.
///
/// Pure and deterministic: returns the normalized profile (fps defaults
/// filled in) or a typed denial.
pub fn validate_stream_profile(
    caps: &CapabilitySet,
    profile: &StreamProfile,
) -> Result<StreamProfile> {
    if profile.width == 0 || profile.height == 0 {
        return Err(CoreError::InvalidArgument(
            "stream resolution must be non-zero".into(),
        ));
    }
    if profile.target_fps_min > profile.target_fps_max && profile.target_fps_max != 0 {
        return Err(CoreError::InvalidArgument("fps_min exceeds fps_max".into()));
    }
    if !formats::is_raw_stream_format(profile.format_fourcc) {
        return Err(CoreError::NotSupported(format!(
            "streams are raw-only, got {}",
            formats::fourcc_to_string(profile.format_fourcc)
        )));
    }

    let (default_min, default_max) = caps.default_fps_range();
    let mut normalized = profile.clone();
    if normalized.target_fps_min == 0 {
        normalized.target_fps_min = default_min;
    }
    if normalized.target_fps_max == 0 {
        normalized.target_fps_max = default_max;
    }

    if !caps.supports_stream(
        normalized.width,
        normalized.height,
        normalized.target_fps_min,
        normalized.target_fps_max,
        normalized.format_fourcc,
    ) {
        return Err(CoreError::ProfileIncompatible(format!(
            "{}x{}@{}-{} {} outside device capabilities",
            normalized.width,
            normalized.height,
            normalized.target_fps_min,
            normalized.target_fps_max,
            formats::fourcc_to_string(normalized.format_fourcc)
        )));
    }
    Ok(normalized)
}

/// Validate a still profile against a device's capability union.
pub fn validate_still_profile(caps: &CapabilitySet, profile: &StillProfile) -> Result<StillProfile> {
    if profile.width == 0 || profile.height == 0 {
        return Err(CoreError::InvalidArgument(
            "still resolution must be non-zero".into(),
        ));
    }
    if !formats::is_still_format(profile.format_fourcc) {
        return Err(CoreError::NotSupported(format!(
            "unknown still format {}",
            formats::fourcc_to_string(profile.format_fourcc)
        )));
    }
    if !caps.supports_still(profile.width, profile.height, profile.format_fourcc) {
        return Err(CoreError::ProfileIncompatible(format!(
            "{}x{} {} outside device capabilities",
            profile.width,
            profile.height,
            formats::fourcc_to_string(profile.format_fourcc)
        )));
    }
    Ok(profile.clone())
}

/// Whether a stream profile can coexist with an armed rig's pipeline:
/// raw format and no larger than the rig's capture profile.
pub fn stream_compatible_with_rig(profile: &StreamProfile, rig: &RigState) -> bool {
    let capture = &rig.config.capture_profile;
    formats::is_raw_stream_format(profile.format_fourcc)
        && profile.width <= capture.width
        && profile.height <= capture.height
}

/// Check `create_stream` against arbitration rules. Returns the normalized
/// profile to hand to the provider.
pub fn check_create_stream(
    state: &CoreState,
    caps: &CapabilitySet,
    device: &DeviceState,
    profile: &StreamProfile,
) -> Result<StreamProfile> {
    if device.phase != Phase::Live || !device.engaged {
        return Err(CoreError::BadState("device is not live and engaged".into()));
    }

    let normalized = validate_stream_profile(caps, profile)?;

    if let Some(rig) = state.armed_rig_of_device(device.instance_id) {
        if !stream_compatible_with_rig(&normalized, rig) {
            return Err(CoreError::RigAuthoritative);
        }
    }

    if state.alive_stream_of_device(device.instance_id).is_some() && !profile.replace_existing {
        return Err(CoreError::Busy(
            "device instance already has a stream".into(),
        ));
    }

    Ok(normalized)
}

/// Check `start_stream`: denied while any capture is in flight on the
/// device, or on any member of its armed rig.
pub fn check_start_stream(state: &CoreState, stream: &StreamState) -> Result<()> {
    if stream.phase != Phase::Live {
        return Err(CoreError::BadState("stream is not live".into()));
    }
    if stream.mode != super::state::StreamMode::Stopped {
        return Err(CoreError::BadState("stream is not stopped".into()));
    }
    if state.capture_in_flight_on_device(stream.device_instance_id) {
        return Err(CoreError::BadState("capture in flight on device".into()));
    }
    if let Some(rig) = state.armed_rig_of_device(stream.device_instance_id) {
        if rig.capture_in_flight() {
            return Err(CoreError::BadState("rig capture in flight".into()));
        }
    }
    Ok(())
}

/// Check `trigger_capture` on a single device. v1 policy: a member of an
/// armed rig is always denied; the rig owns the pipeline.
pub fn check_device_capture(state: &CoreState, device: &DeviceState) -> Result<()> {
    if device.phase != Phase::Live || !device.engaged {
        return Err(CoreError::BadState("device is not live and engaged".into()));
    }
    if state.armed_rig_of_device(device.instance_id).is_some() {
        return Err(CoreError::RigAuthoritative);
    }
    if device.active_capture_id != 0 {
        return Err(CoreError::Busy("capture already in flight".into()));
    }
    Ok(())
}

/// Check `trigger_sync_capture`: rig must be armed with every member live,
/// engaged, and not capturing. Returns resolved member instances in rig
/// order.
pub fn check_rig_sync_capture(state: &CoreState, rig: &RigState) -> Result<Vec<u64>> {
    if rig.mode != super::state::RigMode::Armed {
        return Err(CoreError::BadState("rig is not armed".into()));
    }
    let mut members = Vec::with_capacity(rig.member_instances.len());
    for &instance_id in &rig.member_instances {
        let device = state
            .devices
            .get(&instance_id)
            .ok_or_else(|| CoreError::BadState("rig member instance gone".into()))?;
        if device.phase != Phase::Live || !device.engaged {
            return Err(CoreError::BadState(format!(
                "rig member {} is not live",
                device.hardware_id
            )));
        }
        if device.mode == super::state::DeviceMode::Error {
            return Err(CoreError::BadState(format!(
                "rig member {} is in error",
                device.hardware_id
            )));
        }
        if device.active_capture_id != 0 {
            return Err(CoreError::Busy(format!(
                "rig member {} is capturing",
                device.hardware_id
            )));
        }
        members.push(instance_id);
    }
    Ok(members)
}

/// Streams to preempt before a capture on the given devices, in preemption
/// order: PREVIEW before VIEWFINDER, then stable by stream id.
pub fn streams_to_preempt(state: &CoreState, device_instance_ids: &[u64]) -> Vec<u64> {
    let mut victims: Vec<(u8, u64)> = state
        .streams
        .values()
        .filter(|s| device_instance_ids.contains(&s.device_instance_id))
        .filter(|s| {
            matches!(
                s.mode,
                super::state::StreamMode::Flowing | super::state::StreamMode::Starved
            )
        })
        .map(|s| {
            let rank = match s.intent {
                StreamIntent::Preview => 0,
                StreamIntent::Viewfinder => 1,
            };
            (rank, s.stream_id)
        })
        .collect();
    victims.sort_unstable();
    victims.into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::commands::RigConfig;
    use crate::core::state::{RigMode, StopReason, StreamMode};

    fn profile(intent: StreamIntent, w: u32, h: u32, format: u32) -> StreamProfile {
        StreamProfile {
            intent,
            width: w,
            height: h,
            format_fourcc: format,
            target_fps_min: 0,
            target_fps_max: 0,
            replace_existing: false,
        }
    }

    fn stream(stream_id: u64, device: u64, intent: StreamIntent, mode: StreamMode) -> StreamState {
        StreamState {
            stream_id,
            device_instance_id: device,
            phase: Phase::Live,
            intent,
            mode,
            stop_reason: StopReason::None,
            pending_stop_reason: StopReason::None,
            profile_version: 1,
            width: 1280,
            height: 720,
            format_fourcc: formats::FOURCC_NV12,
            target_fps_min: 1,
            target_fps_max: 30,
            frames_received: 0,
            frames_delivered: 0,
            frames_dropped: 0,
            last_frame_ts_ns: 0,
            starve_timer: None,
            destroyed_ns: 0,
        }
    }

    fn live_device(instance: u64, hw: &str) -> DeviceState {
        let mut d = DeviceState::new(hw.into(), instance, instance);
        d.phase = Phase::Live;
        d
    }

    #[test]
    fn test_stream_profile_normalizes_fps() {
        let caps = CapabilitySet::default();
        let normalized = validate_stream_profile(
            &caps,
            &profile(StreamIntent::Preview, 1280, 720, formats::FOURCC_NV12),
        )
        .unwrap();
        assert_eq!(normalized.target_fps_min, 1);
        assert_eq!(normalized.target_fps_max, 60);
    }

    #[test]
    fn test_stream_profile_rejects_encoded_formats() {
        let caps = CapabilitySet::default();
        let err = validate_stream_profile(
            &caps,
            &profile(StreamIntent::Preview, 1280, 720, formats::FOURCC_JPEG),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NotSupported(_)));
    }

    #[test]
    fn test_stream_profile_rejects_oversize() {
        let caps = CapabilitySet::default();
        let err = validate_stream_profile(
            &caps,
            &profile(StreamIntent::Preview, 4096, 2160, formats::FOURCC_NV12),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ProfileIncompatible(_)));
    }

    #[test]
    fn test_still_profile_accepts_jpeg() {
        let caps = CapabilitySet::default();
        let still = StillProfile {
            width: 1920,
            height: 1080,
            format_fourcc: formats::FOURCC_JPEG,
        };
        assert!(validate_still_profile(&caps, &still).is_ok());
    }

    #[test]
    fn test_second_stream_denied_without_replace() {
        let mut state = CoreState::new();
        state.devices.insert(1, live_device(1, "camA"));
        state
            .streams
            .insert(5, stream(5, 1, StreamIntent::Preview, StreamMode::Stopped));

        let caps = CapabilitySet::default();
        let device = state.devices.get(&1).cloned().unwrap();
        let err = check_create_stream(
            &state,
            &caps,
            &device,
            &profile(StreamIntent::Viewfinder, 1280, 720, formats::FOURCC_NV12),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        let mut replace = profile(StreamIntent::Viewfinder, 1280, 720, formats::FOURCC_NV12);
        replace.replace_existing = true;
        assert!(check_create_stream(&state, &caps, &device, &replace).is_ok());
    }

    #[test]
    fn test_armed_rig_denies_incompatible_stream() {
        let mut state = CoreState::new();
        let mut device = live_device(1, "camA");
        device.rig_id = 9;
        state.devices.insert(1, device.clone());

        let mut rig = RigState::new(
            9,
            "stereo".into(),
            vec!["camA".into()],
            RigConfig {
                capture_profile: StillProfile {
                    width: 640,
                    height: 480,
                    format_fourcc: formats::FOURCC_JPEG,
                },
            },
        );
        rig.set_mode(RigMode::Armed);
        rig.member_instances = vec![1];
        state.rigs.insert(9, rig);

        let caps = CapabilitySet::default();
        // Larger than the rig capture profile: denied.
        let err = check_create_stream(
            &state,
            &caps,
            &device,
            &profile(StreamIntent::Preview, 1280, 720, formats::FOURCC_NV12),
        )
        .unwrap_err();
        assert_eq!(err, CoreError::RigAuthoritative);

        // Within the rig capture profile: allowed.
        assert!(check_create_stream(
            &state,
            &caps,
            &device,
            &profile(StreamIntent::Preview, 640, 480, formats::FOURCC_NV12),
        )
        .is_ok());
    }

    #[test]
    fn test_device_capture_denied_for_armed_member() {
        let mut state = CoreState::new();
        let mut device = live_device(1, "camA");
        device.rig_id = 9;
        state.devices.insert(1, device.clone());

        let mut rig = RigState::new(
            9,
            "stereo".into(),
            vec!["camA".into()],
            RigConfig {
                capture_profile: StillProfile {
                    width: 1920,
                    height: 1080,
                    format_fourcc: formats::FOURCC_JPEG,
                },
            },
        );
        rig.set_mode(RigMode::Armed);
        rig.member_instances = vec![1];
        state.rigs.insert(9, rig);

        assert_eq!(
            check_device_capture(&state, &device).unwrap_err(),
            CoreError::RigAuthoritative
        );
    }

    #[test]
    fn test_start_stream_denied_during_capture() {
        let mut state = CoreState::new();
        let mut device = live_device(1, "camA");
        device.active_capture_id = 77;
        state.devices.insert(1, device);
        state
            .streams
            .insert(5, stream(5, 1, StreamIntent::Preview, StreamMode::Stopped));

        let s = state.streams.get(&5).cloned().unwrap();
        assert!(matches!(
            check_start_stream(&state, &s).unwrap_err(),
            CoreError::BadState(_)
        ));
    }

    #[test]
    fn test_preemption_order_preview_first_then_stream_id() {
        let mut state = CoreState::new();
        state
            .streams
            .insert(4, stream(4, 1, StreamIntent::Viewfinder, StreamMode::Flowing));
        state
            .streams
            .insert(6, stream(6, 2, StreamIntent::Preview, StreamMode::Flowing));
        state
            .streams
            .insert(2, stream(2, 1, StreamIntent::Preview, StreamMode::Starved));
        state
            .streams
            .insert(9, stream(9, 3, StreamIntent::Preview, StreamMode::Flowing));

        // Device 3 not involved; stopped streams not involved.
        let order = streams_to_preempt(&state, &[1, 2]);
        assert_eq!(order, vec![2, 6, 4]);
    }

    #[test]
    fn test_rig_sync_requires_all_members_ready() {
        let mut state = CoreState::new();
        state.devices.insert(1, live_device(1, "camA"));
        let mut busy = live_device(2, "camB");
        busy.active_capture_id = 50;
        state.devices.insert(2, busy);

        let mut rig = RigState::new(
            9,
            "stereo".into(),
            vec!["camA".into(), "camB".into()],
            RigConfig {
                capture_profile: StillProfile {
                    width: 1920,
                    height: 1080,
                    format_fourcc: formats::FOURCC_JPEG,
                },
            },
        );
        rig.set_mode(RigMode::Armed);
        rig.member_instances = vec![1, 2];
        state.rigs.insert(9, rig);

        let rig = state.rigs.get(&9).cloned().unwrap();
        assert!(matches!(
            check_rig_sync_capture(&state, &rig).unwrap_err(),
            CoreError::Busy(_)
        ));

        state.devices.get_mut(&2).unwrap().active_capture_id = 0;
        assert_eq!(check_rig_sync_capture(&state, &rig).unwrap(), vec![1, 2]);
    }
}
