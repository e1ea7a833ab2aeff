//! The live timer heap.
//!
//! Wall-clock timers for [`crate::clock::LiveClock`]. Entries are ordered
//! by deadline, with a registration sequence breaking ties so equal
//! deadlines fire in registration order. The executor drains due entries
//! between scheduling passes and parks until the next deadline when the
//! ready queue is empty.

use crate::clock::WakeFn;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    wake: WakeFn,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest entry first.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, wake: WakeFn) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            wake,
        });
    }

    /// Removes and returns every wake whose deadline has passed, in
    /// firing order. The caller invokes them after releasing the lock.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<WakeFn> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                due.push(entry.wake);
            }
        }
        due
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
