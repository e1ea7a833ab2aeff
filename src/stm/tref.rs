//! Transactional references.

use crate::stm::{Stm, TxStep};
use crate::types::Cause;
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TREF_ID: AtomicU64 = AtomicU64::new(1);

/// A deferred wakeup for a transaction parked on retry.
///
/// Commits fire these outside all locks. `is_spent` reports whether the
/// underlying park was already consumed, letting registration prune dead
/// entries from watch lists.
pub(crate) struct StmWakeup {
    wake: Box<dyn FnOnce() + Send>,
    spent: Box<dyn Fn() -> bool + Send>,
}

impl StmWakeup {
    pub(crate) fn new<W, S>(wake: W, spent: S) -> Self
    where
        W: FnOnce() + Send + 'static,
        S: Fn() -> bool + Send + 'static,
    {
        Self {
            wake: Box::new(wake),
            spent: Box::new(spent),
        }
    }

    /// Consumes the wakeup, resuming the parked transaction.
    pub(crate) fn fire(self) {
        (self.wake)();
    }

    /// True once the parked fiber has been resumed through another path.
    pub(crate) fn is_spent(&self) -> bool {
        (self.spent)()
    }
}

/// The shared state of one transactional cell.
pub(crate) struct TRefState {
    pub(crate) value: Arc<dyn Any + Send + Sync>,
    /// Bumped on every committed write; journals validate against it.
    pub(crate) version: u64,
    /// Parked retries watching this ref. Drained on every committed
    /// write; spent entries are harmless no-ops.
    pub(crate) waiters: Vec<StmWakeup>,
}

pub(crate) struct TRefInner {
    /// Global allocation order; commit locks refs in this order.
    pub(crate) id: u64,
    pub(crate) state: Mutex<TRefState>,
}

/// A mutable cell readable and writable only inside [`Stm`]
/// transactions.
///
/// Cloning the handle refers to the same cell.
pub struct TRef<A> {
    pub(crate) inner: Arc<TRefInner>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef").field("id", &self.inner.id).finish()
    }
}

impl<A: Clone + Send + Sync + 'static> TRef<A> {
    /// Creates a cell holding `initial`.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self {
            inner: Arc::new(TRefInner {
                id: NEXT_TREF_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(TRefState {
                    value: Arc::new(initial),
                    version: 0,
                    waiters: Vec::new(),
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Reads the cell inside a transaction.
    #[must_use]
    pub fn get<E>(&self) -> Stm<A, E> {
        let inner = Arc::clone(&self.inner);
        Stm::from_fn(move |journal| {
            let value = journal.read(&inner);
            match value.downcast_ref::<A>() {
                Some(a) => TxStep::Done(Box::new(a.clone())),
                None => TxStep::Fail(Cause::die(crate::effect::ValueTypeMismatch {
                    expected: std::any::type_name::<A>(),
                })),
            }
        })
    }

    /// Writes the cell inside a transaction.
    #[must_use]
    pub fn set<E>(&self, value: A) -> Stm<(), E> {
        let inner = Arc::clone(&self.inner);
        Stm::from_fn(move |journal| {
            journal.write(&inner, Arc::new(value.clone()));
            TxStep::Done(Box::new(()))
        })
    }

    /// Applies `f` to the current value inside a transaction.
    pub fn update<E, F>(&self, f: F) -> Stm<(), E>
    where
        E: 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        let this = self.clone();
        self.get::<E>().flat_map(move |a| this.set(f(a)))
    }

    /// Reads, replaces, and returns a derived value inside a
    /// transaction.
    pub fn modify<B, E, F>(&self, f: F) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
        E: 'static,
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let this = self.clone();
        self.get::<E>().flat_map(move |a| {
            let (out, next) = f(a);
            this.set(next).map(move |()| out.clone())
        })
    }

    /// Reads the last committed value without a transaction.
    ///
    /// A snapshot: concurrent commits may change the cell immediately
    /// after. Intended for assertions and debugging. `None` only if the
    /// erased value is not of type `A`, which cannot happen for cells
    /// built through [`TRef::new`].
    #[must_use]
    pub fn get_committed(&self) -> Option<A> {
        self.inner.state.lock().value.downcast_ref::<A>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = TRef::new(0_i32);
        let b = TRef::new(0_i32);
        assert!(a.inner.id < b.inner.id);
    }

    #[test]
    fn committed_read_sees_initial_value() {
        let cell = TRef::new(41_i32);
        assert_eq!(cell.get_committed(), Some(41));
    }

    #[test]
    fn spent_wakeups_report_spent_and_fresh_ones_fire() {
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let wakeup = StmWakeup::new(
            move || fired2.store(true, Ordering::SeqCst),
            || false,
        );
        assert!(!wakeup.is_spent());
        wakeup.fire();
        assert!(fired.load(Ordering::SeqCst));

        let dead = StmWakeup::new(|| {}, || true);
        assert!(dead.is_spent());
    }

    #[test]
    fn reparked_retries_do_not_accumulate_spent_waiters() {
        use crate::stm::Stm;
        use crate::test_utils::{init_test_logging, test_runtime};
        use crate::types::Never;

        init_test_logging();
        let (rt, _clock) = test_runtime();
        let gate: TRef<i32> = TRef::new(0);
        let silent: TRef<i32> = TRef::new(0);

        // Watches both refs; only gate commits ever arrive, so every
        // wake re-parks a fresh waiter on silent.
        let watch_gate = gate.clone();
        let watch_silent = silent.clone();
        let waiter = rt.spawn(
            watch_gate
                .get::<Never>()
                .zip(watch_silent.get())
                .flat_map(|(open, _)| Stm::<(), Never>::check(open >= 5))
                .commit(),
        );
        rt.run_until_idle();
        assert!(waiter.status().is_suspended());

        for round in 1..5 {
            let exit = rt.block_on(gate.set::<Never>(round).commit());
            assert!(exit.is_success());
            rt.run_until_idle();
        }
        assert!(waiter.status().is_suspended());
        assert!(silent.inner.state.lock().waiters.len() <= 1);

        let exit = rt.block_on(gate.set::<Never>(5).commit());
        assert!(exit.is_success());
        rt.run_until_idle();
        assert!(waiter.status().is_done());
    }
}
