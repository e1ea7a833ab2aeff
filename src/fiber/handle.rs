//! Typed fiber handles.

use crate::effect::{boxed, unit_value, Effect, Op};
use crate::fiber::runtime::{interrupt_as, typed_exit_value, RawFiber};
use crate::types::{Exit, FiberId, FiberStatus};
use core::fmt;
use std::marker::PhantomData;

/// A handle to a running (or completed) fiber producing `A` or failing
/// with `E`.
///
/// Handles are cheap to clone and do not keep the fiber running: dropping
/// every handle detaches observation but the fiber itself continues until
/// it completes or is interrupted.
pub struct Fiber<A, E = crate::types::Never> {
    raw: RawFiber,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.raw.cell.id)
            .field("status", &self.raw.cell.status())
            .finish()
    }
}

impl<A, E> Fiber<A, E> {
    pub(crate) fn from_raw(raw: RawFiber) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> RawFiber {
        self.raw.clone()
    }

    /// The fiber's id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.raw.cell.id.clone()
    }

    /// The fiber's current lifecycle status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.raw.cell.status()
    }
}

impl<A: Clone + Send + Sync + 'static, E: 'static> Fiber<A, E> {
    /// Waits for the fiber to complete and produces its exit.
    ///
    /// Never fails: failure is inside the returned [`Exit`]. Does not
    /// propagate the fiber's ref values; use [`Fiber::join`] for that.
    #[must_use]
    pub fn await_exit(&self) -> Effect<Exit<A>, crate::types::Never> {
        let cell = std::sync::Arc::clone(&self.raw.cell);
        Effect::from_op(Op::Async(Box::new(move |handle| {
            cell.on_exit(Box::new(move |exit| {
                handle.resume(Op::Succeed(boxed(typed_exit_value::<A>(&exit))));
            }));
        })))
    }

    /// Waits for the fiber, merges its ref values into the caller, and
    /// propagates its outcome: success becomes the value, failure fails
    /// the caller with the fiber's cause.
    #[must_use]
    pub fn join(&self) -> Effect<A, E> {
        let cell = std::sync::Arc::clone(&self.raw.cell);
        self.await_exit()
            .flat_map(move |exit| {
                Effect::<A, crate::types::Never>::with_fiber(move |ctx| {
                    ctx.merge_child_refs(&cell);
                    match exit {
                        Exit::Success(value) => Op::Succeed(boxed(value)),
                        Exit::Failure(cause) => Op::Fail(Box::new(move || cause)),
                    }
                })
            })
            .cast_error()
    }

    /// Returns the fiber's exit if it has already completed.
    #[must_use]
    pub fn poll(&self) -> Effect<Option<Exit<A>>, crate::types::Never> {
        let cell = std::sync::Arc::clone(&self.raw.cell);
        Effect::sync(move || cell.typed_exit::<A>())
    }

    /// Interrupts the fiber (and its non-daemon descendants), attributed
    /// to the calling fiber, and waits for it to complete.
    ///
    /// The resulting exit is interrupted unless the fiber had already
    /// completed or an uninterruptible region finished it another way.
    #[must_use]
    pub fn interrupt(&self) -> Effect<Exit<A>, crate::types::Never> {
        let this = self.clone();
        self.interrupt_as_fork()
            .flat_map(move |()| this.await_exit())
    }

    /// Requests interruption without waiting for the fiber to finish.
    #[must_use]
    pub fn interrupt_as_fork(&self) -> Effect<(), crate::types::Never> {
        let cell = std::sync::Arc::clone(&self.raw.cell);
        Effect::with_fiber(move |ctx| {
            let by = ctx.fiber_id();
            let rt = ctx.runtime_handle();
            // The fan-out locks other fibers, so it must run after this
            // fiber's lock is released: piggyback on an async hop.
            Op::Async(Box::new(move |handle| {
                interrupt_as(&cell, by, &rt);
                handle.resume(Op::Succeed(unit_value()));
            }))
        })
    }
}
