// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Core runtime configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the core loop. All values are defaults subject to tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// How long destroyed records (native objects, devices, streams, rigs)
    /// remain observable in snapshots, in milliseconds.
    pub retention_ms: u64,

    /// A flowing stream with no frame for this long is marked starved.
    pub starve_ms: u64,

    /// Maximum events/commands drained per loop iteration. `usize::MAX`
    /// means full drain.
    pub drain_max: usize,

    /// Capacity of the host command queue.
    pub command_queue_capacity: usize,

    /// Capacity of the provider event queue.
    pub event_queue_capacity: usize,

    /// Warm-hold applied to devices that never received an explicit policy.
    /// Zero disables warm holds.
    pub default_warm_hold_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retention_ms: 5_000,
            starve_ms: 1_000,
            drain_max: usize::MAX,
            command_queue_capacity: 256,
            event_queue_capacity: 1_024,
            default_warm_hold_ms: 0,
        }
    }
}

impl CoreConfig {
    pub fn retention_ns(&self) -> u64 {
        self.retention_ms * 1_000_000
    }

    pub fn starve_ns(&self) -> u64 {
        self.starve_ms * 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.retention_ms, 5_000);
        assert_eq!(cfg.retention_ns(), 5_000_000_000);
        assert_eq!(cfg.starve_ns(), 1_000_000_000);
        assert_eq!(cfg.drain_max, usize::MAX);
        assert_eq!(cfg.default_warm_hold_ms, 0);
    }
}
