//! Min-heap of event deadlines.
//!
//! Cancellation is lazy: re-arming or removing a timeout bumps the slot's
//! timer generation, and expired entries whose generation no longer matches
//! are discarded by the caller instead of being dug out of the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// A deadline entry for one event slot.
#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    slot: usize,
    /// Matches the slot's timer generation at arm time.
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of armed timeouts ordered by deadline.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms a deadline for `slot` under the given timer generation.
    pub(crate) fn insert(&mut self, slot: usize, generation: u64, deadline: Instant) {
        self.heap.push(TimerEntry {
            deadline,
            slot,
            generation,
        });
    }

    /// Returns the earliest armed deadline, stale entries included.
    #[must_use]
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Returns the head entry without removing it.
    #[must_use]
    pub(crate) fn peek(&self) -> Option<(usize, u64, Instant)> {
        self.heap.peek().map(|e| (e.slot, e.generation, e.deadline))
    }

    /// Removes and returns the head entry.
    pub(crate) fn pop(&mut self) -> Option<(usize, u64, Instant)> {
        self.heap.pop().map(|e| (e.slot, e.generation, e.deadline))
    }

    /// Pops every entry with `deadline <= now`, in deadline order. The
    /// caller filters out entries whose generation went stale.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<(usize, u64)> {
        let mut expired = Vec::new();
        while self.heap.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                expired.push((entry.slot, entry.generation));
            }
        }
        expired
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
