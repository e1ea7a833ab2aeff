//! Fiber-local state with fork/join propagation.
//!
//! A [`FiberRef`] is a cell whose value is local to each fiber. When a
//! fiber forks, the child starts from `fork(parent_value)`; when a fiber
//! is joined, the joiner's value becomes `join(joiner_value,
//! child_value)`. The defaults are inherit-on-fork and
//! take-child-on-join.
//!
//! Values are stored erased inside the fiber record; the typed surface
//! re-types on access and a mismatch is a defect.

use crate::effect::{boxed, unit_value, Effect, Op};
use crate::types::{Cause, Never};
use core::fmt;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

type Erased = Arc<dyn Any + Send + Sync>;

/// The erased fork/join behavior of a ref, shared by every fiber that
/// stores a value for it.
pub(crate) struct RefSemantics {
    pub(crate) initial: Erased,
    pub(crate) fork: Box<dyn Fn(&Erased) -> Erased + Send + Sync>,
    pub(crate) join: Box<dyn Fn(&Erased, &Erased) -> Erased + Send + Sync>,
}

/// A fiber-local cell of type `A`.
///
/// Cloning the handle refers to the same logical ref.
pub struct FiberRef<A> {
    id: u64,
    semantics: Arc<RefSemantics>,
    initial: Arc<A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            semantics: Arc::clone(&self.semantics),
            initial: Arc::clone(&self.initial),
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef").field("id", &self.id).finish()
    }
}

impl<A: Clone + Send + Sync + 'static> FiberRef<A> {
    /// Creates a ref with inherit-on-fork and take-child-on-join
    /// semantics.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self::with_semantics(initial, |a: &A| a.clone(), |_, child: &A| child.clone())
    }

    /// Creates a ref with explicit fork and join functions.
    pub fn with_semantics<F, J>(initial: A, fork: F, join: J) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        let initial = Arc::new(initial);
        let semantics = RefSemantics {
            initial: Arc::clone(&initial) as Erased,
            fork: Box::new(move |value| match value.downcast_ref::<A>() {
                Some(a) => Arc::new(fork(a)),
                None => Arc::clone(value),
            }),
            join: Box::new(move |parent, child| {
                match (parent.downcast_ref::<A>(), child.downcast_ref::<A>()) {
                    (Some(p), Some(c)) => Arc::new(join(p, c)),
                    _ => Arc::clone(child),
                }
            }),
        };
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            semantics: Arc::new(semantics),
            initial,
        }
    }

    /// Reads the current fiber's value (or the initial value if this
    /// fiber never set one).
    #[must_use]
    pub fn get<E: 'static>(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::with_fiber(move |ctx| {
            let value = ctx
                .ref_value(this.id)
                .unwrap_or_else(|| Arc::clone(&this.semantics.initial));
            match value.downcast_ref::<A>() {
                Some(a) => Op::Succeed(boxed(a.clone())),
                None => Op::Fail(Box::new(|| {
                    Cause::die(crate::effect::ValueTypeMismatch {
                        expected: std::any::type_name::<A>(),
                    })
                })),
            }
        })
    }

    /// Sets the current fiber's value.
    #[must_use]
    pub fn set<E: 'static>(&self, value: A) -> Effect<(), E> {
        let this = self.clone();
        Effect::with_fiber(move |ctx| {
            ctx.set_ref(this.id, Arc::new(value), Arc::clone(&this.semantics));
            Op::Succeed(unit_value())
        })
    }

    /// Updates the current fiber's value in place.
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: 'static,
        F: FnOnce(A) -> A + Send + 'static,
    {
        let this = self.clone();
        self.get::<E>()
            .flat_map(move |current| this.set(f(current)))
    }

    /// Reads and replaces in one step, returning a derived value.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
        E: 'static,
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        let this = self.clone();
        self.get::<E>().flat_map(move |current| {
            let (out, next) = f(current);
            this.set(next).map(move |()| out)
        })
    }

    /// Runs `effect` with this fiber's value set to `value`, restoring
    /// the previous value (or absence) afterwards, even on failure or
    /// interruption.
    pub fn locally<B, E>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
        E: 'static,
    {
        let set_ref = self.clone();
        let restore_ref = self.clone();
        Effect::with_fiber(move |ctx| {
            let previous = ctx.ref_value(set_ref.id);
            ctx.set_ref(set_ref.id, Arc::new(value), Arc::clone(&set_ref.semantics));
            let restore = Effect::<(), Never>::with_fiber(move |ctx| {
                match previous {
                    Some(old) => ctx.set_ref(restore_ref.id, old, Arc::clone(&restore_ref.semantics)),
                    None => ctx.remove_ref(restore_ref.id),
                }
                Op::Succeed(unit_value())
            });
            effect.ensuring(restore).op
        })
    }

    /// The ref's initial value.
    #[must_use]
    pub fn initial(&self) -> A {
        (*self.initial).clone()
    }
}
