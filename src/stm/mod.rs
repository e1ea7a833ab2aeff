//! Optimistic software transactional memory.
//!
//! An [`Stm`] value describes a transaction over [`TRef`] cells. Running
//! one stages reads and writes in a [`Journal`]; nothing touches shared
//! state until commit, which locks the touched refs in id order, verifies
//! that every read version is unchanged, and applies the writes
//! atomically. A version mismatch is a silent conflict: the transaction
//! reruns from scratch. [`Stm::retry`] parks the fiber until one of the
//! refs it read is committed by another transaction.
//!
//! Transaction bodies are re-runnable `Fn` closures; side effects inside
//! them would be repeated on conflict and belong outside the transaction.

pub(crate) mod journal;
pub(crate) mod tref;

pub use tref::TRef;

pub(crate) use journal::{CommitOutcome, Journal};
pub(crate) use tref::StmWakeup;

use crate::effect::{downcast_value, AnyValue, Effect, Op};
use crate::types::{Cause, Never};
use core::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// One evaluation of a transaction body.
pub(crate) enum TxStep {
    Done(AnyValue),
    Fail(Cause),
    Retry,
}

pub(crate) type TxFn = Arc<dyn Fn(&mut Journal) -> TxStep + Send + Sync>;

/// A re-runnable, erased transaction body.
#[derive(Clone)]
pub(crate) struct Txn {
    pub(crate) run: TxFn,
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn").finish_non_exhaustive()
    }
}

/// A composable transaction producing `A` or failing with `E`.
///
/// Values must be `Clone` (a conflict reruns the body, so nothing may be
/// consumed) in addition to the usual `Send + Sync + 'static`.
pub struct Stm<A, E = Never> {
    pub(crate) txn: Txn,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            txn: self.txn.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm").finish_non_exhaustive()
    }
}

impl<A, E> Stm<A, E> {
    pub(crate) fn from_txn(txn: Txn) -> Self {
        Self {
            txn,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut Journal) -> TxStep + Send + Sync + 'static,
    {
        Self::from_txn(Txn { run: Arc::new(f) })
    }
}

impl<A: Clone + Send + Sync + 'static, E: 'static> Stm<A, E> {
    /// A transaction that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_fn(move |_| TxStep::Done(Box::new(value.clone())))
    }

    /// A transaction that computes a value each attempt.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_fn(move |_| TxStep::Done(Box::new(f())))
    }

    /// A transaction that parks the caller until a read ref changes.
    ///
    /// Retry inside a transaction discards its staged writes; the rerun
    /// happens after some ref in its read set is committed to.
    #[must_use]
    pub fn retry() -> Self {
        Self::from_fn(|_| TxStep::Retry)
    }

    /// Sequences `f` after this transaction, inside the same atomic
    /// scope.
    pub fn flat_map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        let first = self.txn;
        Stm::from_fn(move |journal| match (first.run)(journal) {
            TxStep::Done(value) => match downcast_value::<A>(value) {
                Ok(a) => (f(a).txn.run)(journal),
                Err(cause) => TxStep::Fail(cause),
            },
            other => other,
        })
    }

    /// Maps the result.
    pub fn map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Sequences two transactions, pairing their results.
    pub fn zip<B>(self, that: Stm<B, E>) -> Stm<(A, B), E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |a| {
            let a = a.clone();
            that.clone().map(move |b| (a.clone(), b))
        })
    }

    /// Tries this transaction; if it retries, runs `that` instead with
    /// the staged writes rolled back. Failures are not caught.
    #[must_use]
    pub fn or_else(self, that: Stm<A, E>) -> Self {
        let first = self.txn;
        let second = that.txn;
        Self::from_fn(move |journal| {
            let snapshot = journal.snapshot();
            match (first.run)(journal) {
                TxStep::Retry => {
                    journal.restore(snapshot);
                    (second.run)(journal)
                }
                other => other,
            }
        })
    }

    /// Converts the transaction into an effect that commits atomically,
    /// rerunning on conflict and parking on retry.
    #[must_use]
    pub fn commit(self) -> Effect<A, E> {
        Effect::from_op(Op::Transaction(self.txn))
    }
}

impl<A, E> Stm<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: fmt::Debug + Clone + Send + Sync + 'static,
{
    /// A transaction that fails with a typed error.
    ///
    /// Failure aborts the transaction: staged writes are discarded.
    pub fn fail(error: E) -> Self {
        Self::from_fn(move |_| TxStep::Fail(Cause::fail(error.clone())))
    }

    /// A conditional retry: proceeds only when `condition` holds.
    #[must_use]
    pub fn check(condition: bool) -> Stm<(), E> {
        if condition {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }
}
