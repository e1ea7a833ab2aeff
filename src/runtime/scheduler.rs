//! Scheduling of runnable fibers.
//!
//! The executor hands every runnable fiber to a [`Scheduler`] and drains
//! work one [`Task`] at a time. The policy is pluggable through
//! [`crate::RuntimeConfig::scheduler`]; the default is [`FifoScheduler`],
//! a FIFO with sequence-number deduplication so a resume racing a yield
//! cannot double-run a fiber.

use crate::fiber::runtime::FiberCell;
use core::fmt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// An opaque runnable fiber handed to a [`Scheduler`].
pub struct Task(pub(crate) Arc<FiberCell>);

impl Task {
    /// A key identifying the underlying fiber, stable for its lifetime.
    ///
    /// Scheduling the same key twice is allowed; the extra run is a
    /// harmless no-op quantum, but policies may use the key to
    /// deduplicate.
    #[must_use]
    pub fn key(&self) -> u64 {
        self.0.seq
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("key", &self.0.seq).finish()
    }
}

/// The scheduling policy for runnable fibers.
///
/// Implementations decide the order tasks come back out; the executor
/// makes no fairness assumptions beyond every scheduled task eventually
/// being returned by [`Scheduler::take`].
pub trait Scheduler: Send + Sync {
    /// Enqueues a runnable task. Returns whether it was newly added;
    /// `false` means an entry for the same fiber was already queued.
    fn schedule(&self, task: Task) -> bool;

    /// Removes the next task to run, if any.
    fn take(&self) -> Option<Task>;

    /// The number of queued tasks.
    fn len(&self) -> usize;

    /// True when no task is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default scheduler: FIFO with duplicate suppression.
#[derive(Default)]
pub struct FifoScheduler {
    queue: Mutex<ReadyQueue>,
}

impl FifoScheduler {
    /// An empty FIFO scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for FifoScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoScheduler")
            .field("len", &self.len())
            .finish()
    }
}

impl Scheduler for FifoScheduler {
    fn schedule(&self, task: Task) -> bool {
        self.queue.lock().push(task.0)
    }

    fn take(&self) -> Option<Task> {
        self.queue.lock().pop().map(Task)
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[derive(Default)]
struct ReadyQueue {
    queue: VecDeque<Arc<FiberCell>>,
    enqueued: HashSet<u64>,
}

impl ReadyQueue {
    /// Enqueues `cell` unless it is already queued. Returns whether it
    /// was added.
    fn push(&mut self, cell: Arc<FiberCell>) -> bool {
        if self.enqueued.insert(cell.seq) {
            self.queue.push_back(cell);
            true
        } else {
            false
        }
    }

    fn pop(&mut self) -> Option<Arc<FiberCell>> {
        let cell = self.queue.pop_front()?;
        self.enqueued.remove(&cell.seq);
        Some(cell)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::effect::Op;
    use crate::types::FiberId;
    use std::collections::HashMap;
    use std::sync::Weak;

    fn task(seq: u64) -> Task {
        Task(FiberCell::create(
            FiberId::runtime(seq, 0),
            seq,
            Op::Yield,
            HashMap::new(),
            Context::new(),
            Weak::new(),
        ))
    }

    #[test]
    fn fifo_order() {
        let scheduler = FifoScheduler::new();
        assert!(scheduler.schedule(task(1)));
        assert!(scheduler.schedule(task(2)));
        assert_eq!(scheduler.take().map(|t| t.key()), Some(1));
        assert_eq!(scheduler.take().map(|t| t.key()), Some(2));
        assert!(scheduler.take().is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn duplicate_schedule_is_suppressed() {
        let scheduler = FifoScheduler::new();
        let one = task(1);
        let again = Task(Arc::clone(&one.0));
        assert!(scheduler.schedule(one));
        assert!(!scheduler.schedule(again));
        assert_eq!(scheduler.len(), 1);
        let popped = scheduler.take().unwrap();
        // Re-queueable after being taken.
        assert!(scheduler.schedule(popped));
    }
}
