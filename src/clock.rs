//! The clock service.
//!
//! Time enters the runtime only through the [`Clock`] trait: reading the
//! current time and scheduling a wake after a delay. The runtime installs
//! a [`LiveClock`] by default; tests install a [`TestClock`] whose time
//! only moves when explicitly advanced, making sleep- and timeout-based
//! code fully deterministic.
//!
//! The effect constructors here ([`sleep`], [`now_millis`]) resolve the
//! clock at execution time: a [`ClockService`] bound in the ambient
//! context shadows the runtime default, so a subtree can run on virtual
//! time inside an otherwise live program.

use crate::effect::{boxed, unit_value, Effect, Op};
use crate::runtime::timer::TimerQueue;
use crate::runtime::IdleSignal;
use core::fmt;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A deferred wake callback.
pub type WakeFn = Box<dyn FnOnce() + Send>;

/// The time source and timer scheduler used by sleeps and timeouts.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the clock's epoch.
    fn now_millis(&self) -> u64;

    /// Arranges for `wake` to be invoked once `after` has elapsed.
    fn schedule_wake(&self, after: Duration, wake: WakeFn);
}

/// The context binding for a clock, provided per-subtree via
/// [`crate::Effect::provide`].
#[derive(Debug, Clone)]
pub struct ClockService(pub Arc<dyn Clock>);

/// Wall-clock time backed by the runtime's timer heap.
pub struct LiveClock {
    timers: Arc<Mutex<TimerQueue>>,
    idle: Arc<IdleSignal>,
}

impl LiveClock {
    pub(crate) fn new(timers: Arc<Mutex<TimerQueue>>, idle: Arc<IdleSignal>) -> Self {
        Self { timers, idle }
    }
}

impl fmt::Debug for LiveClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClock").finish_non_exhaustive()
    }
}

impl Clock for LiveClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
            })
    }

    fn schedule_wake(&self, after: Duration, wake: WakeFn) {
        self.timers.lock().schedule(Instant::now() + after, wake);
        // A parked executor may need to shorten its sleep.
        self.idle.notify();
    }
}

struct Sleeper {
    deadline_millis: u64,
    seq: u64,
    wake: WakeFn,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_millis == other.deadline_millis && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap: earliest deadline, then registration order.
        (other.deadline_millis, other.seq).cmp(&(self.deadline_millis, self.seq))
    }
}

struct TestClockState {
    now_millis: u64,
    next_seq: u64,
    sleepers: BinaryHeap<Sleeper>,
}

/// A virtual clock for deterministic tests.
///
/// Time never moves on its own. [`TestClock::adjust`] advances it,
/// firing every pending wake whose deadline falls within the advanced
/// window, in deadline order (registration order for ties). A wake that
/// schedules a new sleep inside the window fires in the same advance.
pub struct TestClock {
    state: Mutex<TestClockState>,
}

impl TestClock {
    /// A virtual clock starting at millisecond 0.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::starting_at(0)
    }

    /// A virtual clock starting at `start_millis`.
    #[must_use]
    pub fn starting_at(start_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TestClockState {
                now_millis: start_millis,
                next_seq: 0,
                sleepers: BinaryHeap::new(),
            }),
        })
    }

    /// The current virtual time in milliseconds.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.state.lock().now_millis
    }

    /// The number of pending sleeps.
    #[must_use]
    pub fn pending_sleepers(&self) -> usize {
        self.state.lock().sleepers.len()
    }

    /// Advances virtual time by `by`, firing due wakes in order.
    pub fn adjust(&self, by: Duration) {
        let target = {
            let state = self.state.lock();
            state
                .now_millis
                .saturating_add(u64::try_from(by.as_millis()).unwrap_or(u64::MAX))
        };
        self.advance_to(target);
    }

    /// Sets virtual time to `target_millis`, firing due wakes. Moving
    /// backwards is a no-op.
    pub fn advance_to(&self, target_millis: u64) {
        loop {
            // One sleeper per lock acquisition: a fired wake may schedule
            // another sleeper inside the window.
            let wake = {
                let mut state = self.state.lock();
                if target_millis < state.now_millis {
                    return;
                }
                match state.sleepers.peek() {
                    Some(sleeper) if sleeper.deadline_millis <= target_millis => {
                        let sleeper = match state.sleepers.pop() {
                            Some(s) => s,
                            None => return,
                        };
                        state.now_millis = state.now_millis.max(sleeper.deadline_millis);
                        Some(sleeper.wake)
                    }
                    _ => {
                        state.now_millis = target_millis;
                        None
                    }
                }
            };
            match wake {
                Some(wake) => {
                    debug!(now = self.now(), "test clock firing sleeper");
                    wake();
                }
                None => return,
            }
        }
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestClock")
            .field("now_millis", &state.now_millis)
            .field("sleepers", &state.sleepers.len())
            .finish()
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.now()
    }

    fn schedule_wake(&self, after: Duration, wake: WakeFn) {
        let mut state = self.state.lock();
        let deadline_millis = state
            .now_millis
            .saturating_add(u64::try_from(after.as_millis()).unwrap_or(u64::MAX));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleepers.push(Sleeper {
            deadline_millis,
            seq,
            wake,
        });
    }
}

/// Suspends the fiber until `duration` has elapsed on the effective
/// clock.
#[must_use]
pub fn sleep<E: 'static>(duration: Duration) -> Effect<(), E> {
    Effect::with_fiber(move |ctx| {
        let clock = ctx.clock();
        Op::Async(Box::new(move |handle| {
            clock.schedule_wake(
                duration,
                Box::new(move || {
                    handle.resume(Op::Succeed(unit_value()));
                }),
            );
        }))
    })
}

/// Reads the effective clock's current time in milliseconds.
#[must_use]
pub fn now_millis<E: 'static>() -> Effect<u64, E> {
    Effect::with_fiber(|ctx| {
        let now = ctx.clock().now_millis();
        Op::Succeed(boxed(now))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_clock_starts_where_told_and_only_moves_on_adjust() {
        let clock = TestClock::starting_at(500);
        assert_eq!(clock.now(), 500);
        clock.adjust(Duration::from_millis(250));
        assert_eq!(clock.now(), 750);
    }

    #[test]
    fn sleepers_fire_in_deadline_order() {
        let clock = TestClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [(1_u32, 30_u64), (2, 10), (3, 20)] {
            let order = Arc::clone(&order);
            clock.schedule_wake(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(label)),
            );
        }
        clock.adjust(Duration::from_millis(25));
        assert_eq!(*order.lock(), vec![2, 3]);
        assert_eq!(clock.pending_sleepers(), 1);
        clock.adjust(Duration::from_millis(5));
        assert_eq!(*order.lock(), vec![2, 3, 1]);
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let clock = TestClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in [1_u32, 2, 3] {
            let order = Arc::clone(&order);
            clock.schedule_wake(
                Duration::from_millis(10),
                Box::new(move || order.lock().push(label)),
            );
        }
        clock.adjust(Duration::from_millis(10));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn wake_scheduled_inside_window_fires_in_same_advance() {
        let clock = TestClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let clock2 = Arc::clone(&clock);
            let fired2 = Arc::clone(&fired);
            clock.schedule_wake(
                Duration::from_millis(10),
                Box::new(move || {
                    let fired3 = Arc::clone(&fired2);
                    fired2.fetch_add(1, Ordering::SeqCst);
                    clock2.schedule_wake(
                        Duration::from_millis(5),
                        Box::new(move || {
                            fired3.fetch_add(1, Ordering::SeqCst);
                        }),
                    );
                }),
            );
        }
        clock.adjust(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(clock.now(), 20);
    }

    #[test]
    fn advance_backwards_is_a_no_op() {
        let clock = TestClock::starting_at(100);
        clock.advance_to(50);
        assert_eq!(clock.now(), 100);
    }
}
