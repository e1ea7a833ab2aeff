//! The runtime value and its executor.
//!
//! A [`Runtime`] is an explicit value, not a global: it owns a ready
//! queue of runnable fibers, a timer heap for the live clock, and the
//! default clock service. Execution is single-threaded and cooperative:
//! the executor pops one fiber, drives it for a bounded quantum, performs
//! the quantum's post-actions (registrations, observers, child
//! interrupts, STM wakeups) outside the fiber lock, and repeats.
//!
//! Two driving modes are provided: [`Runtime::block_on`] parks the
//! calling thread between scheduling passes and wakes on resumptions and
//! timer deadlines; [`Runtime::run_until_idle`] drains the ready queue
//! deterministically and returns, which is the mode tests combine with
//! [`crate::TestClock`].

pub mod scheduler;
pub(crate) mod timer;

use crate::clock::{Clock, ClockService, LiveClock};
use crate::context::Context;
use crate::effect::Effect;
use crate::error::ConfigError;
use crate::fiber::runtime::{interrupt_as, run_quantum, FiberCell, Post, Quantum};
use crate::fiber::Fiber;
use crate::types::{Exit, FiberId};
use parking_lot::{Condvar, Mutex};
use scheduler::{FifoScheduler, Scheduler, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use timer::TimerQueue;
use tracing::trace;

const DEFAULT_YIELD_OP_BUDGET: u32 = 2048;

/// Construction-time options for a [`Runtime`].
#[derive(Clone)]
pub struct RuntimeConfig {
    yield_op_budget: u32,
    context: Context,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            yield_op_budget: DEFAULT_YIELD_OP_BUDGET,
            context: Context::new(),
            clock: None,
            scheduler: None,
        }
    }
}

impl RuntimeConfig {
    /// The default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many operations a fiber may run before it is forced to
    /// yield. Must be non-zero.
    #[must_use]
    pub fn yield_op_budget(mut self, budget: u32) -> Self {
        self.yield_op_budget = budget;
        self
    }

    /// Sets the base context every root fiber starts with.
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Replaces the default live clock, typically with a
    /// [`crate::TestClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default FIFO scheduler with a custom policy.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

/// Condvar-based parking for [`Runtime::block_on`].
///
/// A generation counter closes the gap between the caller's final
/// emptiness check and the wait: the caller snapshots the generation
/// first, and the wait returns immediately if any notify has landed
/// since the snapshot.
pub(crate) struct IdleSignal {
    generation: Mutex<u64>,
    signal: Condvar,
}

impl IdleSignal {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            signal: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.signal.notify_all();
    }

    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn wait_if_unchanged(&self, seen: u64) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.signal.wait(&mut generation);
        }
    }

    fn wait_until_if_unchanged(&self, seen: u64, deadline: Instant) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            let _ = self.signal.wait_until(&mut generation, deadline);
        }
    }
}

/// Shared executor state; [`RuntimeHandle`] clones reach it from fibers,
/// clocks, and resume handles.
pub(crate) struct RuntimeShared {
    yield_op_budget: u32,
    base_context: Context,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    pub(crate) timers: Arc<Mutex<TimerQueue>>,
    pub(crate) idle: Arc<IdleSignal>,
    next_seq: AtomicU64,
}

pub(crate) type RuntimeHandle = Arc<RuntimeShared>;

impl RuntimeShared {
    pub(crate) fn yield_op_budget(&self) -> u32 {
        self.yield_op_budget
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Allocates a fresh fiber sequence number and id.
    pub(crate) fn next_fiber(&self) -> (u64, FiberId) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        (seq, FiberId::runtime(seq, self.clock.now_millis()))
    }

    /// Queues a fiber and wakes a parked [`Runtime::block_on`] caller.
    pub(crate) fn schedule(&self, cell: Arc<FiberCell>) {
        let added = self.scheduler.schedule(Task(cell));
        if added {
            self.idle.notify();
        }
    }

    fn ready_len(&self) -> usize {
        self.scheduler.len()
    }

    /// Runs one fiber for one quantum. Returns false if the scheduler
    /// had no task.
    fn tick(self: &Arc<Self>) -> bool {
        let Some(Task(cell)) = self.scheduler.take() else {
            return false;
        };
        let Quantum { post, wakeups } = run_quantum(&cell, self);
        for wake in wakeups {
            wake.fire();
        }
        match post {
            Post::Idle => {}
            Post::Reschedule => self.schedule(cell),
            Post::Register { register, handle } => register(handle),
            Post::Done {
                exit,
                observers,
                children,
                parent,
            } => {
                trace!(fiber = %cell.id, interrupted = exit.is_interrupted(), "fiber done");
                for observer in observers {
                    observer(exit.clone());
                }
                for child in children {
                    interrupt_as(&child, cell.id.clone(), self);
                }
                if let Some(parent) = parent.upgrade() {
                    parent
                        .inner
                        .lock()
                        .children
                        .retain(|sibling| !Arc::ptr_eq(sibling, &cell));
                }
            }
        }
        true
    }

    /// Fires every due live timer. Returns how many fired.
    fn fire_due_timers(&self) -> usize {
        let due = self.timers.lock().pop_due(Instant::now());
        let count = due.len();
        for wake in due {
            wake();
        }
        count
    }
}

/// A single-threaded, cooperatively scheduled fiber executor.
pub struct Runtime {
    shared: RuntimeHandle,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime with the default configuration: live clock, empty base
    /// context.
    #[must_use]
    pub fn new() -> Self {
        // The default config is always valid.
        match Self::with_config(RuntimeConfig::default()) {
            Ok(runtime) => runtime,
            Err(_) => unreachable!("default runtime config is valid"),
        }
    }

    /// A runtime with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroYieldBudget`] if the yield budget is
    /// zero.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, ConfigError> {
        if config.yield_op_budget == 0 {
            return Err(ConfigError::ZeroYieldBudget);
        }
        let timers = Arc::new(Mutex::new(TimerQueue::new()));
        let idle = Arc::new(IdleSignal::new());
        let clock = config.clock.clone().unwrap_or_else(|| {
            Arc::new(LiveClock::new(Arc::clone(&timers), Arc::clone(&idle)))
        });
        let mut base_context = config.context.clone();
        if !base_context.contains::<ClockService>() {
            base_context = base_context.with(ClockService(Arc::clone(&clock)));
        }
        Ok(Self {
            shared: Arc::new(RuntimeShared {
                yield_op_budget: config.yield_op_budget,
                base_context,
                clock,
                scheduler: config
                    .scheduler
                    .unwrap_or_else(|| Arc::new(FifoScheduler::new())),
                timers,
                idle,
                next_seq: AtomicU64::new(1),
            }),
        })
    }

    fn spawn_cell(&self, op: crate::effect::Op) -> Arc<FiberCell> {
        let (seq, id) = self.shared.next_fiber();
        let cell = FiberCell::create(
            id,
            seq,
            op,
            HashMap::new(),
            self.shared.base_context.clone(),
            Weak::new(),
        );
        self.shared.schedule(Arc::clone(&cell));
        cell
    }

    /// Starts `effect` as a root fiber and returns its handle without
    /// driving it. Combine with [`Runtime::run_until_idle`].
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Send + Sync + 'static,
    {
        let cell = self.spawn_cell(effect.op);
        Fiber::from_raw(crate::fiber::runtime::RawFiber { cell })
    }

    /// Runs `effect` to completion on the calling thread and returns its
    /// exit.
    ///
    /// Parks the thread while no fiber is runnable, waking on external
    /// resumptions and live-timer deadlines. With a virtual clock
    /// installed this can park forever on a sleeping program; use
    /// [`Runtime::spawn`] with [`Runtime::run_until_idle`] and explicit
    /// clock advancement instead.
    pub fn block_on<A, E>(&self, effect: Effect<A, E>) -> Exit<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        let cell = self.spawn_cell(effect.op);
        loop {
            while self.shared.tick() {}
            if let Some(exit) = cell.typed_exit::<A>() {
                return exit;
            }
            if self.shared.fire_due_timers() > 0 {
                continue;
            }
            // Snapshot before the final emptiness check: a resume landing
            // after the check bumps the generation and the wait below
            // returns immediately instead of missing it.
            let seen = self.shared.idle.generation();
            if self.shared.ready_len() > 0 {
                continue;
            }
            match self.shared.timers.lock().next_deadline() {
                Some(deadline) => self.shared.idle.wait_until_if_unchanged(seen, deadline),
                None => self.shared.idle.wait_if_unchanged(seen),
            }
        }
    }

    /// Drives the ready queue until no fiber is runnable, without
    /// blocking on timers. Returns the number of quanta executed.
    ///
    /// Deterministic: with a [`crate::TestClock`] installed, runs exactly
    /// the work enabled so far.
    pub fn run_until_idle(&self) -> usize {
        let mut quanta = 0;
        loop {
            let ran = self.shared.tick();
            if ran {
                quanta += 1;
                continue;
            }
            // Live timers already due still count as available work.
            if self.shared.fire_due_timers() == 0 {
                return quanta;
            }
        }
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("ready", &self.shared.ready_len())
            .field("live_timers", &self.shared.timers.lock().is_empty())
            .finish()
    }
}
