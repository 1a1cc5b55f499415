// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host → core command surface.
//!
//! Commands are immutable messages with a correlation id and an optional
//! reply sender. The core always posts a reply (success, deterministic
//! denial, or `ShuttingDown`), even if the waiter has already given up.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{CoreError, Result};
use super::provider::{CameraEndpoint, StreamIntent};
use super::specs::ApplyMode;

/// Reply sender carried inside a command.
pub type Reply<T> = Sender<Result<T>>;

/// Requested repeating-stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub intent: StreamIntent,
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    /// 0 lets the core pick the capability default.
    pub target_fps_min: u32,
    /// 0 lets the core pick the capability default.
    pub target_fps_max: u32,
    /// Tear down an existing stream on the device instance instead of
    /// denying with `Busy`.
    pub replace_existing: bool,
}

/// Requested still-capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StillProfile {
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
}

/// Rig-wide configuration, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RigConfig {
    /// The capture profile every member shoots with on a sync capture.
    pub capture_profile: StillProfile,
}

/// Host command payloads. See [`Command`] for the envelope.
pub enum CommandOp {
    EnumerateEndpoints {
        reply: Option<Reply<Vec<CameraEndpoint>>>,
    },
    EngageDevice {
        hardware_id: String,
        reply: Option<Reply<u64>>,
    },
    DisengageDevice {
        device_instance_id: u64,
        reply: Option<Reply<()>>,
    },
    SetWarmPolicy {
        device_instance_id: u64,
        warm_hold_ms: u64,
        reply: Option<Reply<()>>,
    },
    CreateStream {
        device_instance_id: u64,
        profile: StreamProfile,
        reply: Option<Reply<u64>>,
    },
    DestroyStream {
        stream_id: u64,
        reply: Option<Reply<()>>,
    },
    StartStream {
        stream_id: u64,
        reply: Option<Reply<()>>,
    },
    StopStream {
        stream_id: u64,
        reply: Option<Reply<()>>,
    },
    SetStillCaptureProfile {
        device_instance_id: u64,
        profile: StillProfile,
        reply: Option<Reply<()>>,
    },
    TriggerDeviceCapture {
        device_instance_id: u64,
        reply: Option<Reply<u64>>,
    },
    CreateRig {
        name: String,
        members: Vec<String>,
        config: RigConfig,
        reply: Option<Reply<u64>>,
    },
    DestroyRig {
        rig_id: u64,
        reply: Option<Reply<()>>,
    },
    ArmRig {
        rig_id: u64,
        reply: Option<Reply<()>>,
    },
    DisarmRig {
        rig_id: u64,
        reply: Option<Reply<()>>,
    },
    TriggerRigSyncCapture {
        rig_id: u64,
        reply: Option<Reply<u64>>,
    },
    UpdateCameraSpec {
        hardware_id: String,
        patch: Vec<u8>,
        apply_mode: ApplyMode,
        reply: Option<Reply<()>>,
    },
    UpdateImagingSpec {
        patch: Vec<u8>,
        apply_mode: ApplyMode,
        reply: Option<Reply<()>>,
    },
    Shutdown {
        reply: Option<Reply<()>>,
    },
}

impl CommandOp {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CommandOp::EnumerateEndpoints { .. } => "enumerate_endpoints",
            CommandOp::EngageDevice { .. } => "engage_device",
            CommandOp::DisengageDevice { .. } => "disengage_device",
            CommandOp::SetWarmPolicy { .. } => "set_warm_policy",
            CommandOp::CreateStream { .. } => "create_stream",
            CommandOp::DestroyStream { .. } => "destroy_stream",
            CommandOp::StartStream { .. } => "start_stream",
            CommandOp::StopStream { .. } => "stop_stream",
            CommandOp::SetStillCaptureProfile { .. } => "set_still_capture_profile",
            CommandOp::TriggerDeviceCapture { .. } => "trigger_device_capture",
            CommandOp::CreateRig { .. } => "create_rig",
            CommandOp::DestroyRig { .. } => "destroy_rig",
            CommandOp::ArmRig { .. } => "arm_rig",
            CommandOp::DisarmRig { .. } => "disarm_rig",
            CommandOp::TriggerRigSyncCapture { .. } => "trigger_rig_sync_capture",
            CommandOp::UpdateCameraSpec { .. } => "update_camera_spec",
            CommandOp::UpdateImagingSpec { .. } => "update_imaging_spec",
            CommandOp::Shutdown { .. } => "shutdown",
        }
    }

    /// Reply `ShuttingDown` on whatever reply channel the op carries.
    pub(crate) fn reject_shutting_down(self) {
        match self {
            CommandOp::EnumerateEndpoints { reply } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::EngageDevice { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::DisengageDevice { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::SetWarmPolicy { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::CreateStream { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::DestroyStream { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::StartStream { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::StopStream { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::SetStillCaptureProfile { reply, .. } => {
                respond(reply, Err(CoreError::ShuttingDown))
            }
            CommandOp::TriggerDeviceCapture { reply, .. } => {
                respond(reply, Err(CoreError::ShuttingDown))
            }
            CommandOp::CreateRig { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::DestroyRig { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::ArmRig { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::DisarmRig { reply, .. } => respond(reply, Err(CoreError::ShuttingDown)),
            CommandOp::TriggerRigSyncCapture { reply, .. } => {
                respond(reply, Err(CoreError::ShuttingDown))
            }
            CommandOp::UpdateCameraSpec { reply, .. } => {
                respond(reply, Err(CoreError::ShuttingDown))
            }
            CommandOp::UpdateImagingSpec { reply, .. } => {
                respond(reply, Err(CoreError::ShuttingDown))
            }
            CommandOp::Shutdown { reply } => respond(reply, Ok(())),
        }
    }
}

/// Command envelope: correlation id plus payload.
pub struct Command {
    pub correlation_id: u64,
    pub op: CommandOp,
}

/// Post a reply, tolerating a waiter that already went away.
pub(crate) fn respond<T>(reply: Option<Reply<T>>, result: Result<T>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

/// Receiver half of a command reply.
///
/// The core posts exactly one reply per command; waiting past an external
/// timeout is always safe.
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    pub(crate) fn pair() -> (Reply<T>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self::new(rx))
    }

    /// Block until the core replies.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(CoreError::ShuttingDown))
    }

    /// Block with an external timeout; `None` means the core has not
    /// replied yet (the reply will still be posted).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(CoreError::ShuttingDown)),
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_receives_reply() {
        let (reply, pending) = Pending::<u64>::pair();
        respond(Some(reply), Ok(7));
        assert_eq!(pending.wait().unwrap(), 7);
    }

    #[test]
    fn test_pending_maps_disconnect_to_shutting_down() {
        let (reply, pending) = Pending::<()>::pair();
        drop(reply);
        assert_eq!(pending.wait(), Err(CoreError::ShuttingDown));
    }

    #[test]
    fn test_respond_tolerates_gone_waiter() {
        let (reply, pending) = Pending::<()>::pair();
        drop(pending);
        respond(Some(reply), Ok(()));
    }

    #[test]
    fn test_reject_shutting_down_acks_shutdown() {
        let (reply, pending) = Pending::<()>::pair();
        CommandOp::Shutdown { reply: Some(reply) }.reject_shutting_down();
        assert!(pending.wait().is_ok());

        let (reply, pending) = Pending::<u64>::pair();
        CommandOp::EngageDevice {
            hardware_id: "camA".into(),
            reply: Some(reply),
        }
        .reject_shutting_down();
        assert_eq!(pending.wait(), Err(CoreError::ShuttingDown));
    }
}
