// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Atomic snapshot publication.
//!
//! The current snapshot lives in an [`arc_swap::ArcSwap`] cell: the core
//! stores with release ordering, readers load with acquire and keep the
//! `Arc` as long as they like. Observers run synchronously on the
//! publishing thread after the swap and must not reenter the core.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::snapshot::Snapshot;

/// Shared read side of the publisher. Cheap to clone via `Arc`.
pub struct SnapshotCell {
    inner: ArcSwap<Snapshot>,
}

impl SnapshotCell {
    fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }

    /// Latest published snapshot. Lock-free.
    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }
}

/// Signature of a publish observer: `(generation, topology_generation)`.
pub type PublishObserver = Box<dyn Fn(u64, u64) + Send>;

/// Writer side: owned by the core thread.
pub struct SnapshotPublisher {
    cell: Arc<SnapshotCell>,
    generation: u64,
    observers: Vec<PublishObserver>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(SnapshotCell::new()),
            generation: 0,
            observers: Vec::new(),
        }
    }

    pub fn cell(&self) -> Arc<SnapshotCell> {
        Arc::clone(&self.cell)
    }

    /// Register an observer invoked synchronously after every publish.
    pub fn add_observer(&mut self, observer: PublishObserver) {
        self.observers.push(observer);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stamp the next generation, swap the snapshot in, and signal
    /// observers. Returns `(generation, topology_generation)`.
    pub fn publish(&mut self, mut snapshot: Snapshot) -> (u64, u64) {
        self.generation += 1;
        snapshot.generation = self.generation;
        let topology_generation = snapshot.topology_generation;

        self.cell.inner.store(Arc::new(snapshot));
        tracing::debug!(
            generation = self.generation,
            topology_generation,
            "snapshot published"
        );

        for observer in &self.observers {
            observer(self.generation, topology_generation);
        }
        (self.generation, topology_generation)
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_generations_are_strictly_increasing() {
        let mut publisher = SnapshotPublisher::new();
        let cell = publisher.cell();
        assert_eq!(cell.load().generation, 0);

        let (g1, _) = publisher.publish(Snapshot::empty());
        let (g2, _) = publisher.publish(Snapshot::empty());
        assert_eq!(g1, 1);
        assert_eq!(g2, 2);
        assert_eq!(cell.load().generation, 2);
    }

    #[test]
    fn test_readers_keep_old_snapshots() {
        let mut publisher = SnapshotPublisher::new();
        let cell = publisher.cell();

        publisher.publish(Snapshot::empty());
        let held = cell.load();
        publisher.publish(Snapshot::empty());

        assert_eq!(held.generation, 1);
        assert_eq!(cell.load().generation, 2);
    }

    #[test]
    fn test_observers_signalled_after_swap() {
        let mut publisher = SnapshotPublisher::new();
        let cell = publisher.cell();

        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_observer = Arc::clone(&seen);
        let cell_in_observer = Arc::clone(&cell);
        publisher.add_observer(Box::new(move |generation, topology_generation| {
            // The swap happens before the signal: the cell already holds
            // the published generation.
            assert_eq!(cell_in_observer.load().generation, generation);
            seen_in_observer
                .lock()
                .push((generation, topology_generation));
        }));

        publisher.publish(Snapshot::empty());
        publisher.publish(Snapshot::empty());

        assert_eq!(seen.lock().as_slice(), &[(1, 0), (2, 0)]);
    }
}
