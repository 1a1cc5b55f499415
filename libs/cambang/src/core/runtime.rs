// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The core loop.
//!
//! A single dedicated thread owns every piece of mutable runtime state; no
//! locks guard it because there are no concurrent writers. Each iteration:
//!
//! 1. wait until a command, an event, the nearest timer deadline, or
//!    shutdown;
//! 2. drain provider events (facts first);
//! 3. drain host commands (intents second), through arbitration;
//! 4. fire due timers (warm expiry, retention sweep, starvation watchdog);
//! 5. publish a fresh snapshot if anything observable changed.
//!
//! Integrating facts before intents means every command decision sees the
//! freshest state; publishing at most once per iteration bounds the publish
//! rate and coalesces updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;

use super::arbitration;
use super::clock::{Clock, MonotonicClock};
use super::commands::{
    respond, Command, CommandOp, Pending, RigConfig, StillProfile, StreamProfile,
};
use super::config::CoreConfig;
use super::error::{CoreError, ProviderError, Result};
use super::events::{ProviderEvent, ProviderEventSink};
use super::ids::IdAllocator;
use super::provider::{
    CameraEndpoint, CameraProvider, CaptureRequest, FrameView, NativeObjectCreateInfo,
    StreamRequest,
};
use super::publisher::{PublishObserver, SnapshotCell, SnapshotPublisher};
use super::queues::{command_channel, CommandSender};
use super::registry::LifecycleRegistry;
use super::snapshot::{Snapshot, SnapshotBuilder};
use super::specs::{
    validate_spec_patch, ApplyMode, CameraSpecStore, ImagingSpecStore, PendingPatch,
};
use super::state::{
    CaptureState, CoreState, DeviceMode, DeviceState, Phase, RigMode, RigState, StopReason,
    StreamMode, StreamState,
};
use super::timers::{TimerHeap, TimerTag};

/// Consumer for frames delivered by providers. Invoked on the core thread;
/// must not block and must drop the view promptly.
pub type FrameConsumer = Box<dyn FnMut(FrameView) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Running,
    /// Shutdown accepted; waiting for provider teardown confirmations.
    Draining,
    Finished,
}

enum WaitItem {
    Event(ProviderEvent),
    Command(Command),
}

/// The camera orchestration core. Sole mutator of all runtime state.
///
/// Owned by the embedder: either drive [`Core::tick`] manually (tests,
/// custom loops) or hand it to [`CoreRuntime::spawn`] for a dedicated
/// thread. There are no globals; everything hangs off this instance.
pub struct Core {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    provider: Box<dyn CameraProvider>,

    cmd_rx: Receiver<Command>,
    evt_rx: Receiver<ProviderEvent>,
    shutdown_gate: Arc<AtomicBool>,
    pending_item: Option<WaitItem>,

    ids: IdAllocator,
    timers: TimerHeap,
    state: CoreState,
    registry: LifecycleRegistry,
    camera_specs: CameraSpecStore,
    imaging_spec: ImagingSpecStore,
    pending_patches: Vec<PendingPatch>,

    builder: SnapshotBuilder,
    publisher: SnapshotPublisher,
    frame_consumer: Option<FrameConsumer>,

    /// Provider token -> core-issued native id.
    native_tokens: HashMap<u64, u64>,
    /// Opens per hardware id, to count session rebuilds.
    open_counts: HashMap<String, u64>,

    retention_deadline_ns: u64,
    retention_timer: Option<super::timers::TimerHandle>,

    dirty: bool,
    phase: RunPhase,
    shutdown_reply: Option<super::commands::Reply<()>>,
}

/// Cloneable host-side handle: submits commands, reads snapshots.
#[derive(Clone)]
pub struct CoreHandle {
    commands: CommandSender,
    snapshots: Arc<SnapshotCell>,
    correlation: Arc<AtomicU64>,
}

impl Core {
    /// Build a core around a provider. Initializes the provider with the
    /// event sink; the loop is not running yet.
    pub fn new(
        mut provider: Box<dyn CameraProvider>,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Core, CoreHandle)> {
        let (commands, cmd_rx, shutdown_gate) = command_channel(config.command_queue_capacity);
        let (sink, evt_rx) = ProviderEventSink::channel(config.event_queue_capacity);

        provider.initialize(sink).map_err(CoreError::from)?;
        tracing::info!(provider = provider.provider_name(), "core initialized");

        let publisher = SnapshotPublisher::new();
        let handle = CoreHandle {
            commands,
            snapshots: publisher.cell(),
            correlation: Arc::new(AtomicU64::new(1)),
        };

        let core = Core {
            config,
            clock,
            provider,
            cmd_rx,
            evt_rx,
            shutdown_gate,
            pending_item: None,
            ids: IdAllocator::new(),
            timers: TimerHeap::new(),
            state: CoreState::new(),
            registry: LifecycleRegistry::new(),
            camera_specs: CameraSpecStore::new(),
            imaging_spec: ImagingSpecStore::new(),
            pending_patches: Vec::new(),
            builder: SnapshotBuilder::new(),
            publisher,
            frame_consumer: None,
            native_tokens: HashMap::new(),
            open_counts: HashMap::new(),
            retention_deadline_ns: 0,
            retention_timer: None,
            dirty: false,
            phase: RunPhase::Running,
            shutdown_reply: None,
        };
        Ok((core, handle))
    }

    /// Register a publish observer. Invoked synchronously on the core
    /// thread after each swap; must not reenter the core.
    pub fn add_publish_observer(&mut self, observer: PublishObserver) {
        self.publisher.add_observer(observer);
    }

    /// Register the frame consumer. Without one, frames are released on
    /// arrival and counted as dropped.
    pub fn set_frame_consumer(&mut self, consumer: FrameConsumer) {
        self.frame_consumer = Some(consumer);
    }

    /// Run the loop until shutdown completes. Pairs with a monotonic clock;
    /// deterministic tests drive [`Core::tick`] directly instead.
    pub fn run(&mut self) {
        while self.phase != RunPhase::Finished {
            self.wait_for_work();
            self.tick();
        }
        tracing::info!("core loop exited");
    }

    /// One loop iteration without blocking. Returns false once shutdown has
    /// completed and the loop should exit.
    pub fn tick(&mut self) -> bool {
        let drain_max = self.config.drain_max;

        // Facts first.
        let mut events = 0usize;
        if let Some(WaitItem::Event(event)) = self.take_pending_event() {
            self.handle_event(event);
            events += 1;
        }
        while events < drain_max {
            match self.evt_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    events += 1;
                }
                Err(_) => break,
            }
        }

        // Intents second.
        let mut commands = 0usize;
        if let Some(WaitItem::Command(command)) = self.pending_item.take() {
            self.handle_command(command);
            commands += 1;
        }
        while commands < drain_max {
            match self.cmd_rx.try_recv() {
                Ok(command) => {
                    self.handle_command(command);
                    commands += 1;
                }
                Err(_) => break,
            }
        }

        // Due timers.
        let now = self.clock.now_ns();
        for tag in self.timers.pop_due(now) {
            self.handle_timer(tag);
        }

        if self.phase == RunPhase::Draining && self.teardown_complete() {
            self.finish_shutdown();
        } else if self.dirty {
            self.publish_internal();
        }

        self.phase != RunPhase::Finished
    }

    /// Build and publish a snapshot unconditionally.
    pub fn publish_now(&mut self) {
        self.dirty = true;
        self.publish_internal();
    }

    fn take_pending_event(&mut self) -> Option<WaitItem> {
        match self.pending_item.take() {
            Some(WaitItem::Event(event)) => Some(WaitItem::Event(event)),
            other => {
                self.pending_item = other;
                None
            }
        }
    }

    /// Block until there is something to do: an event, a command, or the
    /// nearest timer deadline.
    fn wait_for_work(&mut self) {
        if self.pending_item.is_some() {
            return;
        }
        let timeout = self
            .timers
            .peek_deadline()
            .map(|deadline| Duration::from_nanos(deadline.saturating_sub(self.clock.now_ns())));
        let deadline_rx = match timeout {
            Some(timeout) => crossbeam_channel::after(timeout),
            None => crossbeam_channel::never(),
        };

        let mut item = None;
        crossbeam_channel::select! {
            recv(self.evt_rx) -> event => {
                item = event.ok().map(WaitItem::Event);
            }
            recv(self.cmd_rx) -> command => {
                item = command.ok().map(WaitItem::Command);
            }
            recv(deadline_rx) -> _ => {}
        }
        self.pending_item = item;
    }

    // =========================================================================
    // Provider events
    // =========================================================================

    fn handle_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::DeviceOpened { device_instance_id } => {
                self.on_device_opened(device_instance_id)
            }
            ProviderEvent::DeviceClosed { device_instance_id } => {
                self.on_device_closed(device_instance_id)
            }
            ProviderEvent::StreamCreated { stream_id } => self.on_stream_created(stream_id),
            ProviderEvent::StreamDestroyed { stream_id } => self.on_stream_destroyed(stream_id),
            ProviderEvent::StreamStarted { stream_id } => self.on_stream_started(stream_id),
            ProviderEvent::StreamStopped { stream_id, error } => {
                self.on_stream_stopped(stream_id, error)
            }
            ProviderEvent::CaptureStarted { capture_id } => self.on_capture_started(capture_id),
            ProviderEvent::CaptureCompleted { capture_id } => self.on_capture_completed(capture_id),
            ProviderEvent::CaptureFailed { capture_id, error } => {
                self.on_capture_failed(capture_id, error)
            }
            ProviderEvent::Frame(frame) => self.on_frame(frame),
            ProviderEvent::DeviceError {
                device_instance_id,
                error,
            } => self.on_device_error(device_instance_id, error),
            ProviderEvent::StreamError { stream_id, error } => {
                self.on_stream_error(stream_id, error)
            }
            ProviderEvent::NativeObjectCreated(info) => self.on_native_object_created(info),
            ProviderEvent::NativeObjectDestroyed {
                provider_token,
                destroyed_ns,
            } => self.on_native_object_destroyed(provider_token, destroyed_ns),
        }
    }

    fn on_device_opened(&mut self, device_instance_id: u64) {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            tracing::warn!(device_instance_id, "open confirm for unknown device");
            return;
        };
        if device.phase != Phase::Created {
            tracing::warn!(device_instance_id, phase = ?device.phase, "late open confirm");
            return;
        }
        device.advance_phase(Phase::Live);
        tracing::info!(device_instance_id, hardware_id = %device.hardware_id, "device opened");
        self.dirty = true;
        self.maybe_arm_warm(device_instance_id);
    }

    fn on_device_closed(&mut self, device_instance_id: u64) {
        let now = self.clock.now_ns();
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            tracing::warn!(device_instance_id, "close confirm for unknown device");
            return;
        };
        if device.phase == Phase::Destroyed {
            tracing::warn!(device_instance_id, "duplicate close confirm");
            return;
        }
        device.advance_phase(Phase::Destroyed);
        device.engaged = false;
        device.destroyed_ns = now;
        let hardware_id = device.hardware_id.clone();
        let rig_id = device.rig_id;
        let failed_capture = device.active_capture_id;
        device.active_capture_id = 0;
        self.cancel_warm(device_instance_id);

        if self
            .state
            .device_by_hardware
            .get(&hardware_id)
            .copied()
            == Some(device_instance_id)
        {
            self.state.device_by_hardware.remove(&hardware_id);
        }

        // A device vanishing under an armed rig poisons the rig.
        if rig_id != 0 {
            if let Some(rig) = self.state.rigs.get_mut(&rig_id) {
                if rig.is_armed() {
                    tracing::error!(rig_id, device_instance_id, "armed rig lost a member");
                    rig.set_mode(RigMode::Error);
                    rig.error_code = Some(ProviderError::BadState);
                    rig.active_capture_id = 0;
                }
            }
        }
        if failed_capture != 0 {
            self.fail_capture(failed_capture, ProviderError::ProviderFailed);
        }

        tracing::info!(device_instance_id, hardware_id = %hardware_id, "device closed");
        self.dirty = true;
        self.schedule_retention_check();
    }

    fn on_stream_created(&mut self, stream_id: u64) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "create confirm for unknown stream");
            return;
        };
        if stream.phase != Phase::Created {
            tracing::warn!(stream_id, phase = ?stream.phase, "late create confirm");
            return;
        }
        stream.advance_phase(Phase::Live);
        tracing::info!(stream_id, "stream created");
        self.dirty = true;
    }

    fn on_stream_destroyed(&mut self, stream_id: u64) {
        let now = self.clock.now_ns();
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "destroy confirm for unknown stream");
            return;
        };
        if stream.phase == Phase::Destroyed {
            tracing::warn!(stream_id, "duplicate destroy confirm");
            return;
        }
        if let Some(handle) = stream.starve_timer.take() {
            self.timers.cancel(handle);
        }
        stream.advance_phase(Phase::Destroyed);
        stream.destroyed_ns = now;
        let device_instance_id = stream.device_instance_id;
        tracing::info!(stream_id, "stream destroyed");
        self.dirty = true;
        self.schedule_retention_check();
        self.maybe_arm_warm(device_instance_id);
    }

    fn on_stream_started(&mut self, stream_id: u64) {
        let now = self.clock.now_ns();
        let starve_ns = self.config.starve_ns();
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "start confirm for unknown stream");
            return;
        };
        if stream.mode != StreamMode::Stopped {
            tracing::warn!(stream_id, mode = ?stream.mode, "late start confirm");
            return;
        }
        stream.set_mode(StreamMode::Flowing);
        stream.stop_reason = StopReason::None;
        if let Some(handle) = stream.starve_timer.take() {
            self.timers.cancel(handle);
        }
        stream.starve_timer = Some(
            self.timers
                .schedule(now + starve_ns, TimerTag::StreamStarvation { stream_id }),
        );
        let device_instance_id = stream.device_instance_id;
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            if device.mode == DeviceMode::Idle {
                device.set_mode(DeviceMode::Streaming);
            }
        }
        tracing::info!(stream_id, "stream flowing");
        self.dirty = true;
    }

    fn on_stream_stopped(&mut self, stream_id: u64, error: Option<ProviderError>) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "stop confirm for unknown stream");
            return;
        };
        if let Some(handle) = stream.starve_timer.take() {
            self.timers.cancel(handle);
        }
        if stream.mode != StreamMode::Stopped {
            // Public stop reason: core intent wins for clean stops; any
            // provider-reported error, or an unsolicited stop, is Provider.
            let reason = match (&error, stream.pending_stop_reason) {
                (Some(_), _) => StopReason::Provider,
                (None, StopReason::None) => StopReason::Provider,
                (None, pending) => pending,
            };
            stream.set_mode(StreamMode::Stopped);
            stream.stop_reason = reason;
            tracing::info!(stream_id, ?reason, "stream stopped");
        }
        stream.pending_stop_reason = StopReason::None;
        let device_instance_id = stream.device_instance_id;
        self.restore_device_after_streaming(device_instance_id);
        self.dirty = true;
        self.maybe_arm_warm(device_instance_id);
    }

    fn on_capture_started(&mut self, capture_id: u64) {
        match self.state.captures.get_mut(&capture_id) {
            Some(capture) => capture.started = true,
            None => tracing::warn!(capture_id, "start report for unknown capture"),
        }
    }

    fn on_capture_completed(&mut self, capture_id: u64) {
        let Some(capture) = self.state.captures.get_mut(&capture_id) else {
            tracing::warn!(capture_id, "completion report for unknown capture");
            return;
        };
        capture.completed_signaled = true;
        self.try_finalize_capture(capture_id);
    }

    fn on_capture_failed(&mut self, capture_id: u64, error: ProviderError) {
        // Tolerated with or without a prior start report.
        if !self.state.captures.contains_key(&capture_id) {
            tracing::warn!(capture_id, "failure report for unknown capture");
            return;
        }
        self.fail_capture(capture_id, error);
    }

    fn on_frame(&mut self, frame: FrameView) {
        let now = self.clock.now_ns();
        if frame.stream_id != 0 {
            self.on_stream_frame(frame, now);
        } else if frame.capture_id != 0 {
            self.on_capture_frame(frame, now);
        } else {
            tracing::warn!("frame with neither stream nor capture correlation");
        }
    }

    fn on_stream_frame(&mut self, frame: FrameView, now: u64) {
        let stream_id = frame.stream_id;
        let starve_ns = self.config.starve_ns();
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "frame for unknown stream");
            return;
        };
        if !matches!(stream.mode, StreamMode::Flowing | StreamMode::Starved) {
            // Frame raced a stop; count and release.
            stream.frames_received += 1;
            stream.frames_dropped += 1;
            self.dirty = true;
            return;
        }
        if stream.mode == StreamMode::Starved {
            stream.set_mode(StreamMode::Flowing);
        }
        stream.frames_received += 1;
        stream.last_frame_ts_ns = if frame.timestamp_ns != 0 {
            frame.timestamp_ns
        } else {
            now
        };
        if let Some(handle) = stream.starve_timer.take() {
            self.timers.cancel(handle);
        }
        stream.starve_timer = Some(
            self.timers
                .schedule(now + starve_ns, TimerTag::StreamStarvation { stream_id }),
        );

        match self.frame_consumer.as_mut() {
            Some(consumer) => {
                consumer(frame);
                if let Some(stream) = self.state.streams.get_mut(&stream_id) {
                    stream.frames_delivered += 1;
                }
            }
            None => {
                drop(frame);
                if let Some(stream) = self.state.streams.get_mut(&stream_id) {
                    stream.frames_dropped += 1;
                }
            }
        }
        self.dirty = true;
    }

    fn on_capture_frame(&mut self, frame: FrameView, now: u64) {
        let capture_id = frame.capture_id;
        let device_instance_id = frame.device_instance_id;
        let timestamp = if frame.timestamp_ns != 0 {
            frame.timestamp_ns
        } else {
            now
        };
        let Some(capture) = self.state.captures.get_mut(&capture_id) else {
            tracing::warn!(capture_id, "frame for unknown capture");
            return;
        };
        capture.frame_ts_ns.insert(device_instance_id, timestamp);
        let rig_id = capture.rig_id;
        if rig_id != 0 {
            if let Some(rig) = self.state.rigs.get_mut(&rig_id) {
                if rig.mode == RigMode::Triggering {
                    rig.set_mode(RigMode::Collecting);
                }
            }
        }

        if let Some(consumer) = self.frame_consumer.as_mut() {
            consumer(frame);
        }
        self.dirty = true;
        self.try_finalize_capture(capture_id);
    }

    fn on_device_error(&mut self, device_instance_id: u64, error: ProviderError) {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            tracing::warn!(device_instance_id, "error report for unknown device");
            return;
        };
        tracing::error!(device_instance_id, code = error.code_str(), "device error");
        device.set_mode(DeviceMode::Error);
        device.last_error_code = Some(error);
        device.errors_count += 1;
        self.dirty = true;
    }

    fn on_stream_error(&mut self, stream_id: u64, error: ProviderError) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            tracing::warn!(stream_id, "error report for unknown stream");
            return;
        };
        tracing::error!(stream_id, code = error.code_str(), "stream error");
        if let Some(handle) = stream.starve_timer.take() {
            self.timers.cancel(handle);
        }
        stream.set_mode(StreamMode::Error);
        let device_instance_id = stream.device_instance_id;
        self.restore_device_after_streaming(device_instance_id);
        self.dirty = true;
        self.maybe_arm_warm(device_instance_id);
    }

    fn on_native_object_created(&mut self, info: NativeObjectCreateInfo) {
        let native_id = self.ids.next_native_id();
        if self
            .native_tokens
            .insert(info.provider_token, native_id)
            .is_some()
        {
            tracing::error!(token = info.provider_token, "provider reused a live token");
        }
        let created = NativeObjectCreateInfo {
            created_ns: if info.created_ns != 0 {
                info.created_ns
            } else {
                self.clock.now_ns()
            },
            ..info
        };
        if self.registry.on_created(native_id, &created) {
            self.dirty = true;
        }
    }

    fn on_native_object_destroyed(&mut self, provider_token: u64, destroyed_ns: u64) {
        let Some(native_id) = self.native_tokens.remove(&provider_token) else {
            tracing::warn!(provider_token, "destroy report for unknown token");
            return;
        };
        let destroyed_ns = if destroyed_ns != 0 {
            destroyed_ns
        } else {
            self.clock.now_ns()
        };
        if self.registry.on_destroyed(native_id, destroyed_ns) {
            self.dirty = true;
            self.schedule_retention_check();
        }
    }

    // =========================================================================
    // Host commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        if self.phase != RunPhase::Running {
            command.op.reject_shutting_down();
            return;
        }
        tracing::debug!(
            correlation_id = command.correlation_id,
            op = command.op.name(),
            "command"
        );
        match command.op {
            CommandOp::EnumerateEndpoints { reply } => {
                let result = self.cmd_enumerate_endpoints();
                respond(reply, result);
            }
            CommandOp::EngageDevice { hardware_id, reply } => {
                let result = self.cmd_engage_device(&hardware_id);
                respond(reply, result);
            }
            CommandOp::DisengageDevice {
                device_instance_id,
                reply,
            } => {
                let result = self.cmd_disengage_device(device_instance_id);
                respond(reply, result);
            }
            CommandOp::SetWarmPolicy {
                device_instance_id,
                warm_hold_ms,
                reply,
            } => {
                let result = self.cmd_set_warm_policy(device_instance_id, warm_hold_ms);
                respond(reply, result);
            }
            CommandOp::CreateStream {
                device_instance_id,
                profile,
                reply,
            } => {
                let result = self.cmd_create_stream(device_instance_id, &profile);
                respond(reply, result);
            }
            CommandOp::DestroyStream { stream_id, reply } => {
                let result = self.cmd_destroy_stream(stream_id);
                respond(reply, result);
            }
            CommandOp::StartStream { stream_id, reply } => {
                let result = self.cmd_start_stream(stream_id);
                respond(reply, result);
            }
            CommandOp::StopStream { stream_id, reply } => {
                let result = self.cmd_stop_stream(stream_id);
                respond(reply, result);
            }
            CommandOp::SetStillCaptureProfile {
                device_instance_id,
                profile,
                reply,
            } => {
                let result = self.cmd_set_still_profile(device_instance_id, &profile);
                respond(reply, result);
            }
            CommandOp::TriggerDeviceCapture {
                device_instance_id,
                reply,
            } => {
                let result = self.cmd_trigger_device_capture(device_instance_id);
                respond(reply, result);
            }
            CommandOp::CreateRig {
                name,
                members,
                config,
                reply,
            } => {
                let result = self.cmd_create_rig(name, members, config);
                respond(reply, result);
            }
            CommandOp::DestroyRig { rig_id, reply } => {
                let result = self.cmd_destroy_rig(rig_id);
                respond(reply, result);
            }
            CommandOp::ArmRig { rig_id, reply } => {
                let result = self.cmd_arm_rig(rig_id);
                respond(reply, result);
            }
            CommandOp::DisarmRig { rig_id, reply } => {
                let result = self.cmd_disarm_rig(rig_id);
                respond(reply, result);
            }
            CommandOp::TriggerRigSyncCapture { rig_id, reply } => {
                let result = self.cmd_trigger_rig_sync_capture(rig_id);
                respond(reply, result);
            }
            CommandOp::UpdateCameraSpec {
                hardware_id,
                patch,
                apply_mode,
                reply,
            } => {
                let result = self.cmd_update_camera_spec(&hardware_id, patch, apply_mode);
                respond(reply, result);
            }
            CommandOp::UpdateImagingSpec {
                patch,
                apply_mode,
                reply,
            } => {
                let result = self.cmd_update_imaging_spec(patch, apply_mode);
                respond(reply, result);
            }
            CommandOp::Shutdown { reply } => self.cmd_shutdown(reply),
        }
    }

    fn cmd_enumerate_endpoints(&mut self) -> Result<Vec<CameraEndpoint>> {
        self.provider.enumerate_endpoints().map_err(CoreError::from)
    }

    fn cmd_engage_device(&mut self, hardware_id: &str) -> Result<u64> {
        // Re-engage a warm or still-held instance if one exists.
        if let Some(&instance_id) = self.state.device_by_hardware.get(hardware_id) {
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                if device.is_alive() {
                    device.engaged = true;
                    self.cancel_warm(instance_id);
                    self.dirty = true;
                    tracing::info!(instance_id, hardware_id, "device re-engaged");
                    return Ok(instance_id);
                }
            }
        }

        let instance_id = self.ids.next_instance_id();
        let root_id = self.ids.next_root_id();
        let mut device = DeviceState::new(hardware_id.to_string(), instance_id, root_id);
        device.warm_hold_ms = self.config.default_warm_hold_ms;
        device.camera_spec_version = self.camera_specs.version(hardware_id);

        let opens = self.open_counts.entry(hardware_id.to_string()).or_insert(0);
        device.rebuild_count = *opens;
        *opens += 1;

        self.state.devices.insert(instance_id, device);
        self.state
            .device_by_hardware
            .insert(hardware_id.to_string(), instance_id);

        if let Err(error) = self
            .provider
            .open_device(hardware_id, instance_id, root_id)
        {
            self.state.devices.remove(&instance_id);
            self.state.device_by_hardware.remove(hardware_id);
            tracing::warn!(hardware_id, code = error.code_str(), "open_device refused");
            return Err(error.into());
        }

        tracing::info!(instance_id, hardware_id, root_id, "device engaged");
        self.dirty = true;
        Ok(instance_id)
    }

    fn cmd_disengage_device(&mut self, device_instance_id: u64) -> Result<()> {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            return Err(CoreError::BadState("unknown device instance".into()));
        };
        if !device.is_alive() {
            return Err(CoreError::BadState("device already closing".into()));
        }
        device.engaged = false;
        let warm_hold_ms = device.warm_hold_ms;
        self.dirty = true;
        tracing::info!(device_instance_id, "device disengaged");

        self.cancel_warm(device_instance_id);
        if warm_hold_ms > 0 {
            self.arm_warm(device_instance_id, warm_hold_ms);
        } else {
            self.begin_device_teardown(device_instance_id);
        }
        Ok(())
    }

    fn cmd_set_warm_policy(&mut self, device_instance_id: u64, warm_hold_ms: u64) -> Result<()> {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            return Err(CoreError::BadState("unknown device instance".into()));
        };
        if !device.is_alive() {
            return Err(CoreError::BadState("device already closing".into()));
        }
        device.warm_hold_ms = warm_hold_ms;
        self.dirty = true;
        self.cancel_warm(device_instance_id);
        self.maybe_arm_warm(device_instance_id);
        Ok(())
    }

    fn cmd_create_stream(&mut self, device_instance_id: u64, profile: &StreamProfile) -> Result<u64> {
        let Some(device) = self.state.devices.get(&device_instance_id) else {
            return Err(CoreError::BadState("unknown device instance".into()));
        };
        let caps = self.camera_specs.spec(&device.hardware_id).capabilities;
        let normalized = arbitration::check_create_stream(&self.state, &caps, device, profile)?;
        let profile_version = device.camera_spec_version;

        if profile.replace_existing {
            if let Some(existing) = self
                .state
                .alive_stream_of_device(device_instance_id)
                .map(|s| s.stream_id)
            {
                tracing::info!(stream_id = existing, "replacing existing stream");
                self.teardown_stream(existing, StopReason::User);
            }
        }

        let stream_id = self.ids.next_stream_id();
        self.state.streams.insert(stream_id, StreamState {
            stream_id,
            device_instance_id,
            phase: Phase::Created,
            intent: normalized.intent,
            mode: StreamMode::Stopped,
            stop_reason: StopReason::None,
            pending_stop_reason: StopReason::None,
            profile_version,
            width: normalized.width,
            height: normalized.height,
            format_fourcc: normalized.format_fourcc,
            target_fps_min: normalized.target_fps_min,
            target_fps_max: normalized.target_fps_max,
            frames_received: 0,
            frames_delivered: 0,
            frames_dropped: 0,
            last_frame_ts_ns: 0,
            starve_timer: None,
            destroyed_ns: 0,
        });
        self.cancel_warm(device_instance_id);

        let request = StreamRequest {
            stream_id,
            device_instance_id,
            intent: normalized.intent,
            width: normalized.width,
            height: normalized.height,
            format_fourcc: normalized.format_fourcc,
            target_fps_min: normalized.target_fps_min,
            target_fps_max: normalized.target_fps_max,
            profile_version,
        };
        if let Err(error) = self.provider.create_stream(&request) {
            self.state.streams.remove(&stream_id);
            tracing::warn!(stream_id, code = error.code_str(), "create_stream refused");
            return Err(error.into());
        }

        tracing::info!(stream_id, device_instance_id, "stream requested");
        self.dirty = true;
        Ok(stream_id)
    }

    fn cmd_destroy_stream(&mut self, stream_id: u64) -> Result<()> {
        let Some(stream) = self.state.streams.get(&stream_id) else {
            return Err(CoreError::BadState("unknown stream".into()));
        };
        if !stream.is_alive() {
            return Err(CoreError::BadState("stream already closing".into()));
        }
        self.teardown_stream(stream_id, StopReason::User);
        self.dirty = true;
        Ok(())
    }

    fn cmd_start_stream(&mut self, stream_id: u64) -> Result<()> {
        let Some(stream) = self.state.streams.get(&stream_id) else {
            return Err(CoreError::BadState("unknown stream".into()));
        };
        arbitration::check_start_stream(&self.state, stream)?;
        let device_instance_id = stream.device_instance_id;
        if let Some(device) = self.state.devices.get(&device_instance_id) {
            if device.mode == DeviceMode::Error {
                return Err(CoreError::BadState("device is in error".into()));
            }
        }
        self.provider
            .start_stream(stream_id)
            .map_err(CoreError::from)?;
        self.cancel_warm(device_instance_id);
        Ok(())
    }

    fn cmd_stop_stream(&mut self, stream_id: u64) -> Result<()> {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            return Err(CoreError::BadState("unknown stream".into()));
        };
        if !matches!(stream.mode, StreamMode::Flowing | StreamMode::Starved) {
            return Err(CoreError::BadState("stream is not flowing".into()));
        }
        stream.pending_stop_reason = StopReason::User;
        if let Err(error) = self.provider.stop_stream(stream_id) {
            if let Some(stream) = self.state.streams.get_mut(&stream_id) {
                stream.pending_stop_reason = StopReason::None;
            }
            return Err(error.into());
        }
        Ok(())
    }

    fn cmd_set_still_profile(
        &mut self,
        device_instance_id: u64,
        profile: &StillProfile,
    ) -> Result<()> {
        let Some(device) = self.state.devices.get(&device_instance_id) else {
            return Err(CoreError::BadState("unknown device instance".into()));
        };
        if !device.is_alive() {
            return Err(CoreError::BadState("device already closing".into()));
        }
        let caps = self.camera_specs.spec(&device.hardware_id).capabilities;
        let normalized = arbitration::validate_still_profile(&caps, profile)?;
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            device.still_profile = Some(normalized);
            device.capture_profile_version += 1;
            self.dirty = true;
        }
        Ok(())
    }

    fn cmd_trigger_device_capture(&mut self, device_instance_id: u64) -> Result<u64> {
        let Some(device) = self.state.devices.get(&device_instance_id) else {
            return Err(CoreError::BadState("unknown device instance".into()));
        };
        if device.mode == DeviceMode::Error {
            return Err(CoreError::BadState("device is in error".into()));
        }
        arbitration::check_device_capture(&self.state, device)?;

        let caps = self.camera_specs.spec(&device.hardware_id).capabilities;
        let profile = match &device.still_profile {
            Some(profile) => profile.clone(),
            None => default_still_profile(&caps),
        };
        let profile = arbitration::validate_still_profile(&caps, &profile)?;
        let profile_version = device.capture_profile_version;

        // Repeating streams yield to the capture.
        for victim in arbitration::streams_to_preempt(&self.state, &[device_instance_id]) {
            self.preempt_stream(victim);
        }

        let now = self.clock.now_ns();
        let capture_id = self.ids.next_capture_id();
        self.state.captures.insert(capture_id, CaptureState {
            capture_id,
            rig_id: 0,
            member_instances: vec![device_instance_id],
            triggered_ns: now,
            started: false,
            completed_signaled: false,
            frame_ts_ns: HashMap::new(),
        });
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            device.active_capture_id = capture_id;
            device.set_mode(DeviceMode::Capturing);
        }
        self.cancel_warm(device_instance_id);

        let request = CaptureRequest {
            capture_id,
            device_instance_id,
            rig_id: 0,
            width: profile.width,
            height: profile.height,
            format_fourcc: profile.format_fourcc,
            profile_version,
        };
        if let Err(error) = self.provider.trigger_capture(&request) {
            self.state.captures.remove(&capture_id);
            if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
                device.active_capture_id = 0;
                if device.mode == DeviceMode::Capturing {
                    device.set_mode(DeviceMode::Idle);
                }
            }
            tracing::warn!(capture_id, code = error.code_str(), "trigger_capture refused");
            return Err(error.into());
        }

        tracing::info!(capture_id, device_instance_id, "device capture triggered");
        self.dirty = true;
        Ok(capture_id)
    }

    fn cmd_create_rig(
        &mut self,
        name: String,
        members: Vec<String>,
        config: RigConfig,
    ) -> Result<u64> {
        if members.is_empty() {
            return Err(CoreError::InvalidArgument("rig needs members".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for member in &members {
            if !seen.insert(member) {
                return Err(CoreError::InvalidArgument(format!(
                    "duplicate rig member {member}"
                )));
            }
        }
        let rig_id = self.ids.next_rig_id();
        tracing::info!(rig_id, name = %name, members = members.len(), "rig created");
        self.state
            .rigs
            .insert(rig_id, RigState::new(rig_id, name, members, config));
        self.dirty = true;
        Ok(rig_id)
    }

    fn cmd_destroy_rig(&mut self, rig_id: u64) -> Result<()> {
        let Some(rig) = self.state.rigs.get_mut(&rig_id) else {
            return Err(CoreError::BadState("unknown rig".into()));
        };
        if rig.phase == Phase::Destroyed {
            return Err(CoreError::BadState("rig already destroyed".into()));
        }
        if !matches!(rig.mode, RigMode::Off | RigMode::Error) {
            return Err(CoreError::BadState("disarm the rig first".into()));
        }
        rig.phase = Phase::Destroyed;
        rig.destroyed_ns = self.clock.now_ns();
        let members = std::mem::take(&mut rig.member_instances);
        for instance_id in members {
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                if device.rig_id == rig_id {
                    device.rig_id = 0;
                }
            }
        }
        tracing::info!(rig_id, "rig destroyed");
        self.dirty = true;
        self.schedule_retention_check();
        Ok(())
    }

    fn cmd_arm_rig(&mut self, rig_id: u64) -> Result<()> {
        let Some(rig) = self.state.rigs.get(&rig_id) else {
            return Err(CoreError::BadState("unknown rig".into()));
        };
        if rig.phase == Phase::Destroyed {
            return Err(CoreError::BadState("rig already destroyed".into()));
        }
        if rig.mode != RigMode::Off {
            return Err(CoreError::BadState("rig is not off".into()));
        }

        let mut instances = Vec::with_capacity(rig.member_hardware_ids.len());
        for hardware_id in &rig.member_hardware_ids {
            let Some(&instance_id) = self.state.device_by_hardware.get(hardware_id) else {
                return Err(CoreError::BadState(format!(
                    "member {hardware_id} is not engaged"
                )));
            };
            let Some(device) = self.state.devices.get(&instance_id) else {
                return Err(CoreError::BadState(format!(
                    "member {hardware_id} is not engaged"
                )));
            };
            if device.phase != Phase::Live || !device.engaged {
                return Err(CoreError::BadState(format!(
                    "member {hardware_id} is not live and engaged"
                )));
            }
            // A device instance belongs to at most one armed rig.
            if device.rig_id != 0 && device.rig_id != rig_id {
                return Err(CoreError::Busy(format!(
                    "member {hardware_id} is armed in another rig"
                )));
            }
            instances.push(instance_id);
        }

        for &instance_id in &instances {
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                device.rig_id = rig_id;
            }
        }
        if let Some(rig) = self.state.rigs.get_mut(&rig_id) {
            rig.member_instances = instances;
            rig.set_mode(RigMode::Armed);
        }
        tracing::info!(rig_id, "rig armed");
        self.dirty = true;
        Ok(())
    }

    fn cmd_disarm_rig(&mut self, rig_id: u64) -> Result<()> {
        let Some(rig) = self.state.rigs.get_mut(&rig_id) else {
            return Err(CoreError::BadState("unknown rig".into()));
        };
        match rig.mode {
            RigMode::Armed | RigMode::Error => {}
            RigMode::Triggering | RigMode::Collecting => {
                return Err(CoreError::BadState("capture in flight".into()));
            }
            RigMode::Off => return Err(CoreError::BadState("rig is not armed".into())),
        }
        rig.set_mode(RigMode::Off);
        rig.error_code = None;
        let members = std::mem::take(&mut rig.member_instances);
        for instance_id in members {
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                if device.rig_id == rig_id {
                    device.rig_id = 0;
                }
            }
        }
        tracing::info!(rig_id, "rig disarmed");
        self.dirty = true;
        Ok(())
    }

    fn cmd_trigger_rig_sync_capture(&mut self, rig_id: u64) -> Result<u64> {
        let Some(rig) = self.state.rigs.get(&rig_id) else {
            return Err(CoreError::BadState("unknown rig".into()));
        };
        let members = arbitration::check_rig_sync_capture(&self.state, rig)?;
        let capture_profile = rig.config.capture_profile.clone();
        let profile_version = rig.capture_profile_version;
        for &instance_id in &members {
            if let Some(device) = self.state.devices.get(&instance_id) {
                let caps = self.camera_specs.spec(&device.hardware_id).capabilities;
                arbitration::validate_still_profile(&caps, &capture_profile)?;
            }
        }

        // Every member's repeating stream yields before the sync trigger.
        for victim in arbitration::streams_to_preempt(&self.state, &members) {
            self.preempt_stream(victim);
        }

        let now = self.clock.now_ns();
        let capture_id = self.ids.next_capture_id();
        self.state.captures.insert(capture_id, CaptureState {
            capture_id,
            rig_id,
            member_instances: members.clone(),
            triggered_ns: now,
            started: false,
            completed_signaled: false,
            frame_ts_ns: HashMap::new(),
        });

        if let Some(rig) = self.state.rigs.get_mut(&rig_id) {
            rig.set_mode(RigMode::Triggering);
            rig.active_capture_id = capture_id;
            rig.captures_triggered += 1;
        }

        for &instance_id in &members {
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                device.active_capture_id = capture_id;
                device.set_mode(DeviceMode::Capturing);
            }
            self.cancel_warm(instance_id);

            let request = CaptureRequest {
                capture_id,
                device_instance_id: instance_id,
                rig_id,
                width: capture_profile.width,
                height: capture_profile.height,
                format_fourcc: capture_profile.format_fourcc,
                profile_version,
            };
            if let Err(error) = self.provider.trigger_capture(&request) {
                tracing::error!(
                    capture_id,
                    instance_id,
                    code = error.code_str(),
                    "rig member trigger refused"
                );
                self.fail_capture(capture_id, error);
                self.dirty = true;
                return Err(error.into());
            }
        }

        tracing::info!(capture_id, rig_id, members = members.len(), "rig sync capture");
        self.dirty = true;
        Ok(capture_id)
    }

    fn cmd_update_camera_spec(
        &mut self,
        hardware_id: &str,
        patch: Vec<u8>,
        apply_mode: ApplyMode,
    ) -> Result<()> {
        validate_spec_patch(&patch)?;
        if self.camera_spec_safe(hardware_id) {
            return self.apply_camera_patch_now(hardware_id, &patch);
        }
        match apply_mode {
            ApplyMode::Now => Err(CoreError::BadState(
                "device engaged or capture in flight".into(),
            )),
            ApplyMode::WhenSafe => {
                self.pending_patches.push(PendingPatch::Camera {
                    hardware_id: hardware_id.to_string(),
                    patch,
                });
                tracing::debug!(hardware_id, "camera spec patch deferred");
                Ok(())
            }
        }
    }

    fn cmd_update_imaging_spec(&mut self, patch: Vec<u8>, apply_mode: ApplyMode) -> Result<()> {
        validate_spec_patch(&patch)?;
        if self.imaging_spec_safe() {
            return self.apply_imaging_patch_now(&patch);
        }
        match apply_mode {
            ApplyMode::Now => Err(CoreError::BadState(
                "devices engaged or capture in flight".into(),
            )),
            ApplyMode::WhenSafe => {
                self.pending_patches.push(PendingPatch::Imaging { patch });
                tracing::debug!("imaging spec patch deferred");
                Ok(())
            }
        }
    }

    fn cmd_shutdown(&mut self, reply: Option<super::commands::Reply<()>>) {
        tracing::info!("shutdown accepted");
        self.phase = RunPhase::Draining;
        self.shutdown_reply = reply;
        self.shutdown_gate.store(true, Ordering::Release);

        // All host-visible timers die with the shutdown.
        self.timers.clear();
        self.retention_timer = None;
        self.retention_deadline_ns = 0;
        for device in self.state.devices.values_mut() {
            device.warm_timer = None;
            device.warm_deadline_ns = 0;
        }
        for stream in self.state.streams.values_mut() {
            stream.starve_timer = None;
        }

        // In-flight captures cannot survive provider shutdown.
        let capture_ids: Vec<u64> = self.state.captures.keys().copied().collect();
        for capture_id in capture_ids {
            self.fail_capture(capture_id, ProviderError::ShuttingDown);
        }

        let instance_ids: Vec<u64> = self
            .state
            .devices
            .values()
            .filter(|d| d.is_alive())
            .map(|d| d.instance_id)
            .collect();
        for instance_id in instance_ids {
            self.begin_device_teardown(instance_id);
        }
        self.dirty = true;
    }

    fn teardown_complete(&self) -> bool {
        self.state
            .devices
            .values()
            .all(|d| d.phase == Phase::Destroyed)
    }

    fn finish_shutdown(&mut self) {
        if let Err(error) = self.provider.shutdown() {
            tracing::warn!(code = error.code_str(), "provider shutdown reported error");
        }
        // Remaining queued commands get a deterministic refusal.
        while let Ok(command) = self.cmd_rx.try_recv() {
            command.op.reject_shutting_down();
        }
        self.publish_now();
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(Ok(()));
        }
        self.phase = RunPhase::Finished;
        tracing::info!("shutdown complete");
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn handle_timer(&mut self, tag: TimerTag) {
        match tag {
            TimerTag::WarmExpiry { device_instance_id } => self.on_warm_expiry(device_instance_id),
            TimerTag::RetentionSweep => {
                self.retention_timer = None;
                self.retention_deadline_ns = 0;
                let now = self.clock.now_ns();
                self.run_sweep(now);
                self.schedule_retention_check();
            }
            TimerTag::StreamStarvation { stream_id } => self.on_starvation(stream_id),
        }
    }

    fn on_warm_expiry(&mut self, device_instance_id: u64) {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            return;
        };
        if device.phase != Phase::Live || device.warm_deadline_ns == 0 {
            return;
        }
        device.warm_timer = None;
        device.warm_deadline_ns = 0;
        if self.state.device_in_use(device_instance_id) {
            // Activity won the race; warm will re-arm on the next idle
            // transition.
            return;
        }
        tracing::info!(device_instance_id, "warm hold expired, tearing down");
        self.begin_device_teardown(device_instance_id);
    }

    fn on_starvation(&mut self, stream_id: u64) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            return;
        };
        stream.starve_timer = None;
        if stream.mode == StreamMode::Flowing {
            tracing::warn!(stream_id, "stream starved");
            stream.set_mode(StreamMode::Starved);
            self.dirty = true;
        }
    }

    // =========================================================================
    // Warm hold / teardown / retention
    // =========================================================================

    fn cancel_warm(&mut self, device_instance_id: u64) {
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            if let Some(handle) = device.warm_timer.take() {
                self.timers.cancel(handle);
            }
            if device.warm_deadline_ns != 0 {
                device.warm_deadline_ns = 0;
                self.dirty = true;
            }
        }
    }

    fn arm_warm(&mut self, device_instance_id: u64, warm_hold_ms: u64) {
        let deadline = self.clock.now_ns() + warm_hold_ms * 1_000_000;
        let handle = self.timers.schedule(deadline, TimerTag::WarmExpiry {
            device_instance_id,
        });
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            device.warm_timer = Some(handle);
            device.warm_deadline_ns = deadline;
            self.dirty = true;
            tracing::debug!(device_instance_id, warm_hold_ms, "warm hold armed");
        } else {
            self.timers.cancel(handle);
        }
    }

    /// Arm the warm timer if the device just became idle; tear down
    /// immediately when a disengaged device has no warm policy.
    fn maybe_arm_warm(&mut self, device_instance_id: u64) {
        if self.phase != RunPhase::Running {
            return;
        }
        let Some(device) = self.state.devices.get(&device_instance_id) else {
            return;
        };
        if device.phase != Phase::Live || device.warm_timer.is_some() {
            return;
        }
        if self.state.device_in_use(device_instance_id) {
            return;
        }
        let warm_hold_ms = device.warm_hold_ms;
        let engaged = device.engaged;
        if warm_hold_ms > 0 {
            self.arm_warm(device_instance_id, warm_hold_ms);
        } else if !engaged {
            self.begin_device_teardown(device_instance_id);
        }
    }

    /// Stop, destroy, close. Confirmations arrive as events; phases advance
    /// as they do.
    fn begin_device_teardown(&mut self, device_instance_id: u64) {
        let Some(device) = self.state.devices.get_mut(&device_instance_id) else {
            return;
        };
        if !device.is_alive() {
            return;
        }
        device.advance_phase(Phase::TearingDown);
        self.dirty = true;
        self.cancel_warm(device_instance_id);
        tracing::info!(device_instance_id, "device teardown");

        let stream_ids: Vec<u64> = self
            .state
            .streams_of_device(device_instance_id)
            .filter(|s| s.is_alive())
            .map(|s| s.stream_id)
            .collect();
        for stream_id in stream_ids {
            self.teardown_stream(stream_id, StopReason::User);
        }
        if let Err(error) = self.provider.close_device(device_instance_id) {
            tracing::error!(
                device_instance_id,
                code = error.code_str(),
                "close_device failed"
            );
        }
    }

    /// Stop a stream if flowing, then destroy it.
    fn teardown_stream(&mut self, stream_id: u64, stop_reason: StopReason) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.is_alive() {
            return;
        }
        if matches!(stream.mode, StreamMode::Flowing | StreamMode::Starved) {
            if stream.pending_stop_reason == StopReason::None {
                stream.pending_stop_reason = stop_reason;
            }
            if let Err(error) = self.provider.stop_stream(stream_id) {
                tracing::warn!(stream_id, code = error.code_str(), "stop_stream failed");
            }
        }
        if let Some(stream) = self.state.streams.get_mut(&stream_id) {
            if let Some(handle) = stream.starve_timer.take() {
                self.timers.cancel(handle);
            }
            stream.advance_phase(Phase::TearingDown);
        }
        if let Err(error) = self.provider.destroy_stream(stream_id) {
            tracing::warn!(stream_id, code = error.code_str(), "destroy_stream failed");
        }
        self.dirty = true;
    }

    /// Preempt a repeating stream for a higher-priority capture.
    fn preempt_stream(&mut self, stream_id: u64) {
        let Some(stream) = self.state.streams.get_mut(&stream_id) else {
            return;
        };
        tracing::warn!(stream_id, "stream preempted by capture");
        stream.pending_stop_reason = StopReason::Preempted;
        if let Err(error) = self.provider.stop_stream(stream_id) {
            tracing::warn!(stream_id, code = error.code_str(), "preempt stop failed");
        }
        self.dirty = true;
    }

    fn restore_device_after_streaming(&mut self, device_instance_id: u64) {
        let flowing = self.state.device_has_flowing_stream(device_instance_id);
        if let Some(device) = self.state.devices.get_mut(&device_instance_id) {
            if device.mode == DeviceMode::Streaming && !flowing {
                device.set_mode(DeviceMode::Idle);
            }
        }
    }

    /// Finish a capture whose completion signal and member frames have all
    /// arrived.
    fn try_finalize_capture(&mut self, capture_id: u64) {
        let complete = self
            .state
            .captures
            .get(&capture_id)
            .map(|c| c.is_complete())
            .unwrap_or(false);
        if !complete {
            return;
        }
        let Some(capture) = self.state.captures.remove(&capture_id) else {
            return;
        };
        let now = self.clock.now_ns();

        for &instance_id in &capture.member_instances {
            let flowing = self.state.device_has_flowing_stream(instance_id);
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                device.active_capture_id = 0;
                if device.mode == DeviceMode::Capturing {
                    device.set_mode(if flowing {
                        DeviceMode::Streaming
                    } else {
                        DeviceMode::Idle
                    });
                }
            }
            self.maybe_arm_warm(instance_id);
        }

        if capture.rig_id != 0 {
            if let Some(rig) = self.state.rigs.get_mut(&capture.rig_id) {
                rig.captures_completed += 1;
                rig.last_capture_id = capture.capture_id;
                rig.last_capture_latency_ns = now.saturating_sub(capture.triggered_ns);
                rig.last_sync_skew_ns = capture.sync_skew_ns();
                rig.active_capture_id = 0;
                if rig.mode == RigMode::Collecting {
                    rig.set_mode(RigMode::Armed);
                }
            }
        }
        tracing::info!(capture_id, "capture completed");
        self.dirty = true;
    }

    /// Terminate a capture on failure: restore members, poison the rig.
    fn fail_capture(&mut self, capture_id: u64, error: ProviderError) {
        let Some(capture) = self.state.captures.remove(&capture_id) else {
            return;
        };
        tracing::error!(capture_id, code = error.code_str(), "capture failed");

        for &instance_id in &capture.member_instances {
            let flowing = self.state.device_has_flowing_stream(instance_id);
            if let Some(device) = self.state.devices.get_mut(&instance_id) {
                if device.active_capture_id == capture_id {
                    device.active_capture_id = 0;
                }
                device.last_error_code = Some(error);
                device.errors_count += 1;
                if device.mode == DeviceMode::Capturing {
                    device.set_mode(if flowing {
                        DeviceMode::Streaming
                    } else {
                        DeviceMode::Idle
                    });
                }
            }
            self.maybe_arm_warm(instance_id);
        }

        if capture.rig_id != 0 {
            if let Some(rig) = self.state.rigs.get_mut(&capture.rig_id) {
                rig.captures_failed += 1;
                rig.error_code = Some(error);
                rig.active_capture_id = 0;
                if rig.mode != RigMode::Error {
                    rig.set_mode(RigMode::Error);
                }
            }
        }
        self.dirty = true;
    }

    // =========================================================================
    // Spec patches
    // =========================================================================

    fn camera_spec_safe(&self, hardware_id: &str) -> bool {
        !self.state.hardware_engaged(hardware_id)
            && !self
                .state
                .devices
                .values()
                .any(|d| d.hardware_id == hardware_id && d.active_capture_id != 0)
    }

    fn imaging_spec_safe(&self) -> bool {
        !self
            .state
            .devices
            .values()
            .any(|d| (d.engaged && d.is_alive()) || d.active_capture_id != 0)
    }

    fn apply_camera_patch_now(&mut self, hardware_id: &str, patch: &[u8]) -> Result<()> {
        match self.camera_specs.apply_patch(hardware_id, patch)? {
            Some(version) => {
                if let Err(error) =
                    self.provider
                        .apply_camera_spec_patch(hardware_id, version, patch)
                {
                    tracing::warn!(
                        hardware_id,
                        code = error.code_str(),
                        "provider refused camera spec patch"
                    );
                }
                for device in self.state.devices.values_mut() {
                    if device.hardware_id == hardware_id && device.is_alive() {
                        device.camera_spec_version = version;
                    }
                }
                tracing::info!(hardware_id, version, "camera spec updated");
                self.dirty = true;
                Ok(())
            }
            // Identical content: idempotent success.
            None => Ok(()),
        }
    }

    fn apply_imaging_patch_now(&mut self, patch: &[u8]) -> Result<()> {
        match self.imaging_spec.apply_patch(patch)? {
            Some(version) => {
                if let Err(error) = self.provider.apply_imaging_spec_patch(version, patch) {
                    tracing::warn!(code = error.code_str(), "provider refused imaging patch");
                }
                tracing::info!(version, "imaging spec updated");
                self.dirty = true;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Retry deferred `WhenSafe` patches against current state.
    fn try_apply_pending_patches(&mut self) {
        if self.pending_patches.is_empty() || self.phase != RunPhase::Running {
            return;
        }
        let pending = std::mem::take(&mut self.pending_patches);
        for patch in pending {
            match patch {
                PendingPatch::Camera { hardware_id, patch } => {
                    if self.camera_spec_safe(&hardware_id) {
                        if let Err(error) = self.apply_camera_patch_now(&hardware_id, &patch) {
                            tracing::warn!(%hardware_id, %error, "deferred camera patch failed");
                        }
                    } else {
                        self.pending_patches
                            .push(PendingPatch::Camera { hardware_id, patch });
                    }
                }
                PendingPatch::Imaging { patch } => {
                    if self.imaging_spec_safe() {
                        if let Err(error) = self.apply_imaging_patch_now(&patch) {
                            tracing::warn!(%error, "deferred imaging patch failed");
                        }
                    } else {
                        self.pending_patches.push(PendingPatch::Imaging { patch });
                    }
                }
            }
        }
    }

    // =========================================================================
    // Retention & publish
    // =========================================================================

    /// Earliest retention expiry across registry records and destroyed
    /// entities; keeps exactly one sweep timer pending.
    fn schedule_retention_check(&mut self) {
        let retention_ns = self.config.retention_ns();
        if self.phase != RunPhase::Running {
            return;
        }
        let mut next = self.registry.next_expiry(retention_ns);
        let entity_expiries = self
            .state
            .devices
            .values()
            .map(|d| d.destroyed_ns)
            .chain(self.state.streams.values().map(|s| s.destroyed_ns))
            .chain(self.state.rigs.values().map(|r| r.destroyed_ns))
            .filter(|&ns| ns != 0)
            .map(|ns| ns.saturating_add(retention_ns));
        for expiry in entity_expiries {
            next = Some(next.map_or(expiry, |n: u64| n.min(expiry)));
        }
        let Some(deadline) = next else {
            return;
        };
        if self.retention_timer.is_some() && self.retention_deadline_ns <= deadline {
            return;
        }
        if let Some(handle) = self.retention_timer.take() {
            self.timers.cancel(handle);
        }
        self.retention_timer = Some(self.timers.schedule(deadline, TimerTag::RetentionSweep));
        self.retention_deadline_ns = deadline;
    }

    /// Drop expired destroyed records and entities.
    fn run_sweep(&mut self, now_ns: u64) {
        let retention_ns = self.config.retention_ns();
        let removed = self.registry.sweep(now_ns, retention_ns);
        if removed > 0 {
            tracing::debug!(removed, "retention sweep");
            self.dirty = true;
        }

        let expired = |destroyed_ns: u64| {
            destroyed_ns != 0 && destroyed_ns.saturating_add(retention_ns) <= now_ns
        };
        let before = self.state.devices.len() + self.state.streams.len() + self.state.rigs.len();
        self.state.devices.retain(|_, d| !expired(d.destroyed_ns));
        self.state.streams.retain(|_, s| !expired(s.destroyed_ns));
        self.state.rigs.retain(|_, r| !expired(r.destroyed_ns));
        let after = self.state.devices.len() + self.state.streams.len() + self.state.rigs.len();
        if after != before {
            tracing::debug!(purged = before - after, "expired entities purged");
            self.dirty = true;
        }
    }

    fn publish_internal(&mut self) {
        self.try_apply_pending_patches();
        let now = self.clock.now_ns();
        if self.phase == RunPhase::Running {
            self.run_sweep(now);
            self.schedule_retention_check();
        }
        let snapshot = self.builder.build(
            &self.state,
            &self.registry,
            self.imaging_spec.version(),
            now,
        );
        self.publisher.publish(snapshot);
        self.dirty = false;
    }
}

/// Default still profile derived from the capability union: largest mode,
/// preferring JPEG.
fn default_still_profile(caps: &super::specs::CapabilitySet) -> StillProfile {
    let mode = caps.modes.first();
    StillProfile {
        width: mode.map(|m| m.max_width).unwrap_or(1920),
        height: mode.map(|m| m.max_height).unwrap_or(1080),
        format_fourcc: mode
            .and_then(|m| {
                if m.still_formats.contains(&super::formats::FOURCC_JPEG) {
                    Some(super::formats::FOURCC_JPEG)
                } else {
                    m.still_formats.first().copied()
                }
            })
            .unwrap_or(super::formats::FOURCC_JPEG),
    }
}

impl CoreHandle {
    /// Latest published snapshot. Lock-free; safe from any thread.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.load()
    }

    fn next_correlation_id(&self) -> u64 {
        self.correlation.fetch_add(1, Ordering::Relaxed)
    }

    fn submit_op(&self, op: CommandOp) -> Result<()> {
        self.commands.submit(Command {
            correlation_id: self.next_correlation_id(),
            op,
        })
    }

    pub fn enumerate_endpoints(&self) -> Result<Pending<Vec<CameraEndpoint>>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::EnumerateEndpoints { reply: Some(reply) })?;
        Ok(pending)
    }

    pub fn engage_device(&self, hardware_id: &str) -> Result<Pending<u64>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::EngageDevice {
            hardware_id: hardware_id.to_string(),
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn disengage_device(&self, device_instance_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::DisengageDevice {
            device_instance_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn set_warm_policy(&self, device_instance_id: u64, warm_hold_ms: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::SetWarmPolicy {
            device_instance_id,
            warm_hold_ms,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn create_stream(
        &self,
        device_instance_id: u64,
        profile: StreamProfile,
    ) -> Result<Pending<u64>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::CreateStream {
            device_instance_id,
            profile,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn destroy_stream(&self, stream_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::DestroyStream {
            stream_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn start_stream(&self, stream_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::StartStream {
            stream_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn stop_stream(&self, stream_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::StopStream {
            stream_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn set_still_capture_profile(
        &self,
        device_instance_id: u64,
        profile: StillProfile,
    ) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::SetStillCaptureProfile {
            device_instance_id,
            profile,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn trigger_device_capture(&self, device_instance_id: u64) -> Result<Pending<u64>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::TriggerDeviceCapture {
            device_instance_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn create_rig(
        &self,
        name: &str,
        members: Vec<String>,
        config: RigConfig,
    ) -> Result<Pending<u64>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::CreateRig {
            name: name.to_string(),
            members,
            config,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn destroy_rig(&self, rig_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::DestroyRig {
            rig_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn arm_rig(&self, rig_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::ArmRig {
            rig_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn disarm_rig(&self, rig_id: u64) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::DisarmRig {
            rig_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn trigger_rig_sync_capture(&self, rig_id: u64) -> Result<Pending<u64>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::TriggerRigSyncCapture {
            rig_id,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn update_camera_spec(
        &self,
        hardware_id: &str,
        patch: Vec<u8>,
        apply_mode: ApplyMode,
    ) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::UpdateCameraSpec {
            hardware_id: hardware_id.to_string(),
            patch,
            apply_mode,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn update_imaging_spec(&self, patch: Vec<u8>, apply_mode: ApplyMode) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::UpdateImagingSpec {
            patch,
            apply_mode,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    pub fn shutdown(&self) -> Result<Pending<()>> {
        let (reply, pending) = Pending::pair();
        self.submit_op(CommandOp::Shutdown { reply: Some(reply) })?;
        Ok(pending)
    }
}

/// Dedicated-thread wrapper around [`Core`].
pub struct CoreRuntime {
    thread: Option<JoinHandle<()>>,
    handle: CoreHandle,
}

impl CoreRuntime {
    /// Spawn the core loop on its own thread with a monotonic clock.
    pub fn spawn(provider: Box<dyn CameraProvider>, config: CoreConfig) -> Result<Self> {
        let clock = Arc::new(MonotonicClock::new());
        let (mut core, handle) = Core::new(provider, config, clock)?;
        let thread = std::thread::Builder::new()
            .name("cambang-core".to_string())
            .spawn(move || core.run())
            .map_err(|e| CoreError::TransientFailure(format!("spawn failed: {e}")))?;
        Ok(Self {
            thread: Some(thread),
            handle,
        })
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    /// Request shutdown and join the core thread.
    pub fn shutdown_and_join(mut self) -> Result<()> {
        let pending = self.handle.shutdown()?;
        pending.wait()?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

impl Drop for CoreRuntime {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Ok(pending) = self.handle.shutdown() {
                let _ = pending.wait();
            }
            let _ = thread.join();
        }
    }
}
