// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! CamBANG: a camera-orchestration runtime.
//!
//! Mediates between a host application and platform camera backends. The
//! core owns all policy on a single-writer event loop: arbitration between
//! rig-synchronised captures, device stills and repeating streams; a
//! lifecycle registry with retention windows; warm-hold teardown
//! scheduling; and atomically published immutable state snapshots.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cambang::core::{CoreConfig, CoreRuntime, MonotonicClock};
//! use cambang::providers::SyntheticProvider;
//!
//! let clock = Arc::new(MonotonicClock::new());
//! let (provider, _synth) = SyntheticProvider::new(&[("camA", "Front")], clock);
//! let runtime = CoreRuntime::spawn(Box::new(provider), CoreConfig::default()).unwrap();
//!
//! let handle = runtime.handle();
//! let instance_id = handle.engage_device("camA").unwrap().wait().unwrap();
//! println!("engaged: {instance_id}, snapshot gen {}", handle.snapshot().generation);
//!
//! runtime.shutdown_and_join().unwrap();
//! ```

pub mod core;
pub mod providers;

pub use crate::core::{Core, CoreConfig, CoreError, CoreHandle, CoreRuntime, Result, Snapshot};
