//! End-to-end session against the synthetic provider.
//!
//! Engages a camera, streams a preview, takes a still, and tears down,
//! printing each published snapshot generation.
//!
//! Run with: cargo run --example synthetic_session

use std::sync::Arc;

use cambang::core::{
    Core, CoreConfig, MonotonicClock, StreamIntent, StreamProfile,
};
use cambang::providers::SyntheticProvider;

fn main() -> cambang::Result<()> {
    let clock = Arc::new(MonotonicClock::new());
    let (provider, synth) = SyntheticProvider::new(&[("camA", "Front")], clock.clone());

    let (mut core, handle) = Core::new(Box::new(provider), CoreConfig::default(), clock)?;
    core.add_publish_observer(Box::new(|generation, topology_generation| {
        println!("published gen {generation} (topology {topology_generation})");
    }));

    let core_thread = std::thread::spawn(move || core.run());

    let endpoints = handle.enumerate_endpoints()?.wait()?;
    println!("endpoints: {endpoints:?}");

    let instance = handle.engage_device("camA")?.wait()?;
    let stream_id = handle
        .create_stream(instance, StreamProfile {
            intent: StreamIntent::Preview,
            width: 1280,
            height: 720,
            format_fourcc: cambang::core::formats::FOURCC_NV12,
            target_fps_min: 0,
            target_fps_max: 0,
            replace_existing: false,
        })?
        .wait()?;
    handle.start_stream(stream_id)?.wait()?;

    for _ in 0..5 {
        synth.emit_stream_frame(stream_id);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let capture_id = handle.trigger_device_capture(instance)?.wait()?;
    println!("capture {capture_id} done");

    let snapshot = handle.snapshot();
    println!(
        "devices: {}, streams: {}, native objects: {}",
        snapshot.devices.len(),
        snapshot.streams.len(),
        snapshot.native_objects.len()
    );

    handle.shutdown()?.wait()?;
    let _ = core_thread.join();
    Ok(())
}
