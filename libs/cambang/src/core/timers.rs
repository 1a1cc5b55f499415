// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deadline timer heap.
//!
//! A min-heap keyed by absolute monotonic deadline. Cancellation is logical:
//! a cancelled handle is tombstoned and dropped when its entry reaches the
//! top of the heap. Deadlines come from a [`super::clock::Clock`]; no wall
//! clock is involved.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// What a due timer means to the core loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTag {
    /// Warm-hold window for a device elapsed; begin teardown.
    WarmExpiry { device_instance_id: u64 },
    /// A destroyed record's retention window may have elapsed.
    RetentionSweep,
    /// A flowing stream has not produced a frame recently.
    StreamStarvation { stream_id: u64 },
}

/// Opaque handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline_ns: u64,
    seq: u64,
    tag: TimerTag,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ns
            .cmp(&other.deadline_ns)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending deadlines with tombstone cancellation.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Seqs scheduled and neither fired nor cancelled.
    live: HashSet<u64>,
    /// Seqs cancelled but whose entries are still buried in the heap.
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `tag` to fire at the absolute deadline.
    pub fn schedule(&mut self, deadline_ns: u64, tag: TimerTag) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Reverse(Entry {
            deadline_ns,
            seq,
            tag,
        }));
        TimerHandle(seq)
    }

    /// Logically cancel a timer. Returns false if the handle already fired
    /// or was cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.live.remove(&handle.0) {
            self.cancelled.insert(handle.0);
            true
        } else {
            false
        }
    }

    /// Earliest live deadline, if any. Drains tombstones off the top.
    pub fn peek_deadline(&mut self) -> Option<u64> {
        self.drain_cancelled_top();
        self.heap.peek().map(|Reverse(e)| e.deadline_ns)
    }

    /// Pop every live timer with `deadline <= now`, in deadline order.
    pub fn pop_due(&mut self, now_ns: u64) -> Vec<TimerTag> {
        let mut due = Vec::new();
        loop {
            self.drain_cancelled_top();
            match self.heap.peek() {
                Some(Reverse(e)) if e.deadline_ns <= now_ns => {
                    let Reverse(e) = self.heap.pop().expect("peeked entry");
                    self.live.remove(&e.seq);
                    due.push(e.tag);
                }
                _ => break,
            }
        }
        due
    }

    /// Drop all pending timers (shutdown).
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.cancelled.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn drain_cancelled_top(&mut self) {
        while let Some(Reverse(e)) = self.heap.peek() {
            if self.cancelled.remove(&e.seq) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}
