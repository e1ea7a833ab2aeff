//! Effect descriptions and their combinators.
//!
//! An [`Effect`] is a *description* of a computation: an immutable tree of
//! operations that does nothing until a fiber interprets it. The typed
//! `Effect<A, E>` surface wraps an erased [`Op`] tree; values cross the
//! interpreter as `Box<dyn Any>` and are re-typed at the API boundary.
//! A failed downcast is a runtime defect (`Cause::die`), never a panic.
//!
//! Construction is cheap: combinators allocate AST nodes, nothing runs.
//! Execution happens through [`crate::Runtime::block_on`] or by forking
//! fibers from inside another effect.

use crate::clock;
use crate::context::Context;
use crate::fiber::runtime::{interrupt_as, FiberCtx, RawFiber, ResumeHandle};
use crate::fiber::Fiber;
use crate::stm::Txn;
use crate::types::{Cause, Never};
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The erased value representation used inside the interpreter.
pub(crate) type AnyValue = Box<dyn Any + Send + Sync>;
/// A success continuation.
pub(crate) type ThenFn = Box<dyn FnOnce(AnyValue) -> Op + Send>;
/// A failure continuation.
pub(crate) type FailFn = Box<dyn FnOnce(Cause) -> Op + Send>;
/// A lazily-built cause.
pub(crate) type CauseFn = Box<dyn FnOnce() -> Cause + Send>;
/// An async registration: receives the resume handle for the suspended
/// fiber and arranges for it to be called exactly once, later.
pub(crate) type RegisterFn = Box<dyn FnOnce(ResumeHandle) + Send>;
/// A fiber-introspection step.
pub(crate) type WithFiberFn = Box<dyn FnOnce(&mut FiberCtx<'_>) -> Op + Send>;

/// The closed operation tree interpreted by the fiber runtime loop.
///
/// Every combinator on [`Effect`] compiles down to these nodes; the
/// evaluator in `fiber::runtime` matches on them exhaustively.
pub(crate) enum Op {
    /// An already-computed value.
    Succeed(AnyValue),
    /// A synchronous side effect producing a value.
    Sync(Box<dyn FnOnce() -> AnyValue + Send>),
    /// A failure with a lazily-built cause.
    Fail(CauseFn),
    /// Sequential composition: run `first`, feed its value to `then`.
    FlatMap(Box<Op>, ThenFn),
    /// Run `first`; on success continue with `success`, on any cause
    /// continue with `failure`.
    Fold {
        first: Box<Op>,
        success: ThenFn,
        failure: FailFn,
    },
    /// Suspend the fiber and hand a resume handle to `register`.
    Async(RegisterFn),
    /// Fork `child` as a new fiber; the value is the raw fiber handle.
    Fork { child: Box<Op>, daemon: bool },
    /// Yield to the scheduler, resuming with `()` on the next pass.
    Yield,
    /// Run `body` with interruptibility set to `interruptible`,
    /// restoring the previous setting afterwards.
    Masked {
        interruptible: bool,
        body: Box<Op>,
    },
    /// Run `body`, then `finalizer` uninterruptibly on any exit path.
    Ensuring { body: Box<Op>, finalizer: Box<Op> },
    /// One step computed with access to the running fiber's state.
    WithFiber(WithFiberFn),
    /// Run `body` with `context` as the ambient context.
    Provide { context: Context, body: Box<Op> },
    /// Trampolined loop: while `cond()` holds, run `body()`.
    While {
        cond: Box<dyn FnMut() -> bool + Send>,
        body: Box<dyn FnMut() -> Op + Send>,
    },
    /// Run an STM transaction to commit, conflict-retry, or parked retry.
    Transaction(Txn),
}

impl Op {
    /// True for nodes whose interpretation only installs continuation,
    /// finalizer, mask, or context frames.
    ///
    /// The interrupt checkpoint skips these so that an interrupt arriving
    /// before a fiber's first step still sees its `Ensuring` finalizers
    /// and mask regions on the frame stack when the unwind begins.
    pub(crate) fn installs_frames(&self) -> bool {
        matches!(
            self,
            Self::FlatMap(..)
                | Self::Fold { .. }
                | Self::Ensuring { .. }
                | Self::Masked { .. }
                | Self::Provide { .. }
        )
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Succeed(_) => "Succeed",
            Self::Sync(_) => "Sync",
            Self::Fail(_) => "Fail",
            Self::FlatMap(..) => "FlatMap",
            Self::Fold { .. } => "Fold",
            Self::Async(_) => "Async",
            Self::Fork { .. } => "Fork",
            Self::Yield => "Yield",
            Self::Masked { .. } => "Masked",
            Self::Ensuring { .. } => "Ensuring",
            Self::WithFiber(_) => "WithFiber",
            Self::Provide { .. } => "Provide",
            Self::While { .. } => "While",
            Self::Transaction(_) => "Transaction",
        };
        write!(f, "Op::{tag}")
    }
}

/// Defect raised when an interpreter value fails to downcast to the type
/// the surrounding combinator expected.
#[derive(Debug, Clone)]
pub struct ValueTypeMismatch {
    /// The type the combinator expected.
    pub expected: &'static str,
}

/// Defect raised when [`Effect::service`] finds no binding.
#[derive(Debug, Clone)]
pub struct MissingService {
    /// The requested service type.
    pub service: &'static str,
}

pub(crate) fn boxed<A: Send + Sync + 'static>(value: A) -> AnyValue {
    Box::new(value)
}

pub(crate) fn unit_value() -> AnyValue {
    Box::new(())
}

/// Re-types an erased value, converting a mismatch into a defect cause.
pub(crate) fn downcast_value<A: 'static>(value: AnyValue) -> Result<A, Cause> {
    value.downcast::<A>().map(|v| *v).map_err(|_| {
        Cause::die(ValueTypeMismatch {
            expected: std::any::type_name::<A>(),
        })
    })
}

fn succeed_op<A: Send + Sync + 'static>(value: A) -> Op {
    Op::Succeed(boxed(value))
}

fn fail_cause_op(cause: Cause) -> Op {
    Op::Fail(Box::new(move || cause))
}

/// A description of a computation producing `A` or failing with a typed
/// error `E` (alongside defects and interruption, which every effect can
/// produce).
///
/// Values must be `Send + Sync + 'static`; they may cross fiber
/// boundaries and be shared between joiners. Errors additionally need
/// `Clone + Debug` so they can be stored in a [`Cause`] and recovered.
pub struct Effect<A, E = Never> {
    pub(crate) op: Op,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({:?})", self.op)
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_op(op: Op) -> Self {
        Self {
            op,
            _marker: PhantomData,
        }
    }

    /// Reinterprets the error type without touching the failure channel.
    ///
    /// Sound because the error lives erased inside the cause; this is the
    /// escape hatch for widening `Effect<A, Never>` into any error type.
    pub(crate) fn cast_error<E2>(self) -> Effect<A, E2> {
        Effect::from_op(self.op)
    }
}

impl<A: Send + Sync + 'static, E: 'static> Effect<A, E> {
    /// An effect that immediately succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_op(succeed_op(value))
    }

    /// An effect that runs `thunk` when executed.
    pub fn sync<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_op(Op::Sync(Box::new(move || boxed(thunk()))))
    }

    /// An effect that fails with a pre-built cause.
    pub fn fail_cause(cause: Cause) -> Self {
        Self::from_op(fail_cause_op(cause))
    }

    /// An effect that dies with a defect.
    ///
    /// Defects bypass [`Effect::catch_all`]; only cause-level folds see
    /// them.
    pub fn die<D: fmt::Debug + Send + Sync + 'static>(defect: D) -> Self {
        Self::from_op(Op::Fail(Box::new(move || Cause::die(defect))))
    }

    /// An effect that never completes. Useful with races and timeouts.
    #[must_use]
    pub fn never() -> Self {
        // Dropping the handle leaves the fiber suspended until it is
        // interrupted from outside.
        Self::from_op(Op::Async(Box::new(|_handle| {})))
    }

    /// Registers an asynchronous computation.
    ///
    /// `register` receives a callback and must arrange for exactly one of
    /// its completion methods to be called later (extra calls are
    /// ignored; the first wins). The fiber suspends until then.
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(AsyncCallback<A, E>) + Send + 'static,
    {
        Self::from_op(Op::Async(Box::new(move |handle| {
            register(AsyncCallback {
                handle,
                _marker: PhantomData,
            });
        })))
    }

    /// Sequences `f` after this effect.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_op(Op::FlatMap(
            Box::new(self.op),
            Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => f(a).op,
                Err(cause) => fail_cause_op(cause),
            }),
        ))
    }

    /// Maps the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| Effect::succeed(f(a)))
    }

    /// Replaces the success value with `()`.
    pub fn unit_result(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Sequences `that` after this effect, pairing the results.
    pub fn zip<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Sequences `that` after this effect, keeping only its result.
    pub fn zip_right<B>(self, that: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |_| that)
    }

    /// Folds over the full cause: both branches see everything, including
    /// defects and interruptions.
    ///
    /// Note that a fiber with a pending interrupt request is re-
    /// interrupted at its next interruptible checkpoint, so interruption
    /// cannot be swallowed here.
    pub fn fold_cause<B, E2, S, F>(self, success: S, failure: F) -> Effect<B, E2>
    where
        B: Send + Sync + 'static,
        S: FnOnce(A) -> Effect<B, E2> + Send + 'static,
        F: FnOnce(Cause) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_op(Op::Fold {
            first: Box::new(self.op),
            success: Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => success(a).op,
                Err(cause) => fail_cause_op(cause),
            }),
            failure: Box::new(move |cause| failure(cause).op),
        })
    }

    /// Exposes the full cause as a value instead of a failure.
    pub fn cause(self) -> Effect<Option<Cause>, E> {
        self.fold_cause(
            |_| Effect::succeed(None),
            |cause| Effect::succeed(Some(cause)),
        )
    }

    /// Runs `finalizer` on any exit path — success, failure, or
    /// interruption — before the result propagates.
    ///
    /// The finalizer runs uninterruptibly; if it fails, its cause is
    /// sequenced after the original one.
    pub fn ensuring(self, finalizer: Effect<(), Never>) -> Self {
        Self::from_op(Op::Ensuring {
            body: Box::new(self.op),
            finalizer: Box::new(finalizer.op),
        })
    }

    /// Marks this effect uninterruptible: interruption is deferred until
    /// the region ends.
    #[must_use]
    pub fn uninterruptible(self) -> Self {
        Self::from_op(Op::Masked {
            interruptible: false,
            body: Box::new(self.op),
        })
    }

    /// Restores interruptibility inside an uninterruptible region.
    #[must_use]
    pub fn interruptible(self) -> Self {
        Self::from_op(Op::Masked {
            interruptible: true,
            body: Box::new(self.op),
        })
    }

    /// Forks this effect as a child fiber of the current fiber and
    /// returns its handle immediately.
    ///
    /// The child inherits the parent's context and forked fiber-ref
    /// values, and is interrupted when the parent is interrupted or
    /// completes.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        Self::fork_inner(self.op, false)
    }

    /// Forks this effect as a daemon fiber: it is not registered as a
    /// child and survives the parent's interruption and completion.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, E> {
        Self::fork_inner(self.op, true)
    }

    fn fork_inner(op: Op, daemon: bool) -> Effect<Fiber<A, E>, E> {
        Effect::from_op(Op::FlatMap(
            Box::new(Op::Fork {
                child: Box::new(op),
                daemon,
            }),
            Box::new(|value| match downcast_value::<RawFiber>(value) {
                Ok(raw) => succeed_op(Fiber::<A, E>::from_raw(raw)),
                Err(cause) => fail_cause_op(cause),
            }),
        ))
    }

    /// Runs `body` with `context` as the ambient context.
    #[must_use]
    pub fn provide(self, context: Context) -> Self {
        Self::from_op(Op::Provide {
            context,
            body: Box::new(self.op),
        })
    }

    /// Runs both effects as child fibers and pairs their results.
    ///
    /// If one side fails, the other is interrupted; if both fail, their
    /// causes combine with `Parallel` so neither is lost.
    pub fn zip_par<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        A: Clone,
        B: Clone + Send + Sync + 'static,
    {
        self.fork().flat_map(move |left: Fiber<A, E>| {
            that.fork().flat_map(move |right: Fiber<B, E>| {
                Effect::from_op(zip_par_coordinator::<A, B>(left.raw(), right.raw()))
            })
        })
    }

    /// Races two effects: the first to complete wins, and the loser is
    /// interrupted with the winner's fiber id as the interrupter.
    ///
    /// The winner's exit — success or failure — is the result.
    pub fn race(self, that: Self) -> Self
    where
        A: Clone,
    {
        self.fork().flat_map(move |left: Fiber<A, E>| {
            that.fork().flat_map(move |right: Fiber<A, E>| {
                Effect::from_op(race_coordinator::<A>(left.raw(), right.raw()))
            })
        })
    }

    /// Completes with `None` if this effect has not finished within
    /// `duration`, interrupting it.
    ///
    /// Built from [`Effect::race`] against a sleep, so the losing branch
    /// is interrupted rather than abandoned.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E>
    where
        A: Clone,
    {
        self.map(Some)
            .race(clock::sleep::<E>(duration).map(move |()| None))
    }

    /// The id of the fiber running this effect.
    #[must_use]
    pub fn fiber_id() -> Effect<crate::types::FiberId, E> {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| succeed_op(ctx.fiber_id()))))
    }

    /// The current ambient context.
    #[must_use]
    pub fn current_context() -> Effect<Context, E> {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| succeed_op(ctx.context()))))
    }

    /// Looks up a service from the ambient context, dying with a defect
    /// when it is not provided.
    #[must_use]
    pub fn service<S: Send + Sync + 'static>() -> Effect<Arc<S>, E> {
        Effect::from_op(Op::WithFiber(Box::new(|ctx| {
            match ctx.context().get::<S>() {
                Some(service) => succeed_op(service),
                None => Op::Fail(Box::new(|| {
                    Cause::die(MissingService {
                        service: std::any::type_name::<S>(),
                    })
                })),
            }
        })))
    }

    pub(crate) fn with_fiber<F>(f: F) -> Self
    where
        F: FnOnce(&mut FiberCtx<'_>) -> Op + Send + 'static,
    {
        Self::from_op(Op::WithFiber(Box::new(f)))
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + Sync + 'static,
    E: fmt::Debug + Clone + Send + Sync + 'static,
{
    /// An effect that fails with a typed error.
    pub fn fail(error: E) -> Self {
        Self::from_op(Op::Fail(Box::new(move || Cause::fail(error))))
    }

    /// Lifts a `Result` into an effect.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// Recovers from a typed failure.
    ///
    /// Sees only `Fail` causes carrying `E`; defects and interruptions
    /// pass through untouched.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: 'static,
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_cause(Effect::succeed, move |cause| {
            match cause.first_failure_of::<E>() {
                Some(error) => f(error),
                None => Effect::fail_cause(cause),
            }
        })
    }

    /// Maps the typed error.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: fmt::Debug + Clone + Send + Sync + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        self.catch_all(move |error| Effect::fail(f(error)))
    }

    /// Exposes success and typed failure as a `Result`; defects and
    /// interruptions still fail the effect.
    pub fn either(self) -> Effect<Result<A, E>, Never> {
        self.fold_cause(
            |a| Effect::succeed(Ok(a)),
            |cause| match cause.first_failure_of::<E>() {
                Some(error) => Effect::succeed(Err(error)),
                None => Effect::fail_cause(cause),
            },
        )
    }
}

impl<E> Effect<(), E> {
    /// The unit effect.
    #[must_use]
    pub fn unit() -> Self {
        Self::from_op(Op::Succeed(unit_value()))
    }

    /// Yields to the scheduler, letting other ready fibers run.
    #[must_use]
    pub fn yield_now() -> Self {
        Self::from_op(Op::Yield)
    }
}

impl<A: Send + Sync + 'static> Effect<A, Never> {
    /// Widens an infallible effect into any error type.
    #[must_use]
    pub fn widen_error<E2>(self) -> Effect<A, E2> {
        self.cast_error()
    }
}

/// Scoped resource acquisition: `acquire` runs uninterruptibly, `use_fn`
/// runs with interruption enabled, and `release` is guaranteed to run on
/// any exit path of the use effect.
pub fn acquire_release<A, B, E, U, R>(
    acquire: Effect<A, E>,
    use_fn: U,
    release: R,
) -> Effect<B, E>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
    E: 'static,
    U: FnOnce(A) -> Effect<B, E> + Send + 'static,
    R: FnOnce(A) -> Effect<(), Never> + Send + 'static,
{
    acquire.uninterruptible().flat_map(move |resource| {
        let for_release = resource.clone();
        use_fn(resource).ensuring(release(for_release))
    })
}

/// A trampolined while-loop: while `cond()` holds, run the effect built
/// by `body`. Loop state lives in the closures.
pub fn while_loop<E, C, B>(cond: C, body: B) -> Effect<(), E>
where
    C: FnMut() -> bool + Send + 'static,
    B: FnMut() -> Effect<(), E> + Send + 'static,
{
    let mut body = body;
    Effect::from_op(Op::While {
        cond: Box::new(cond),
        body: Box::new(move || body().op),
    })
}

/// The typed resume callback handed to [`Effect::async_`] registrations.
///
/// Cloneable; the first completion wins and later calls return `false`.
pub struct AsyncCallback<A, E = Never> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for AsyncCallback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallback").finish_non_exhaustive()
    }
}

impl<A: Send + Sync + 'static, E> AsyncCallback<A, E> {
    /// Resumes the fiber with a success value.
    pub fn succeed(&self, value: A) -> bool {
        self.handle.resume(succeed_op(value))
    }

    /// Resumes the fiber with a pre-built cause.
    pub fn fail_cause(&self, cause: Cause) -> bool {
        self.handle.resume(fail_cause_op(cause))
    }

    /// Resumes the fiber with a whole effect to continue with.
    pub fn resume_with(&self, effect: Effect<A, E>) -> bool {
        self.handle.resume(effect.op)
    }
}

impl<A, E> AsyncCallback<A, E>
where
    A: Send + Sync + 'static,
    E: fmt::Debug + Clone + Send + Sync + 'static,
{
    /// Resumes the fiber with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.handle.resume(Op::Fail(Box::new(move || Cause::fail(error))))
    }
}

fn exit_to_op<A: Clone + Send + Sync + 'static>(
    exit: crate::fiber::runtime::ExitRaw,
) -> Op {
    use crate::types::Exit;
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(a) => succeed_op(a.clone()),
            None => Op::Fail(Box::new(|| {
                Cause::die(ValueTypeMismatch {
                    expected: std::any::type_name::<A>(),
                })
            })),
        },
        Exit::Failure(cause) => fail_cause_op(cause),
    }
}

/// Builds the race coordinator op: observes both children, propagates
/// the first exit, interrupts the loser attributing the winner.
fn race_coordinator<A: Clone + Send + Sync + 'static>(left: RawFiber, right: RawFiber) -> Op {
    Op::WithFiber(Box::new(move |ctx| {
        let rt = ctx.runtime_handle();
        Op::Async(Box::new(move |handle| {
            let decided = Arc::new(AtomicBool::new(false));
            for (me, other) in [(left.clone(), right.clone()), (right, left)] {
                let decided = Arc::clone(&decided);
                let handle = handle.clone();
                let rt = rt.clone();
                let winner_id = me.cell.id.clone();
                let loser = other;
                me.cell.on_exit(Box::new(move |exit| {
                    if !decided.swap(true, Ordering::SeqCst) {
                        interrupt_as(&loser.cell, winner_id, &rt);
                        handle.resume(exit_to_op::<A>(exit));
                    }
                }));
            }
        }))
    }))
}

/// Builds the zip-par coordinator op: waits for both children, pairing
/// successes and combining concurrent failures with `Parallel`. The
/// first failing side interrupts the other.
fn zip_par_coordinator<A, B>(left: RawFiber, right: RawFiber) -> Op
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    use crate::fiber::runtime::ExitRaw;
    use crate::types::Exit;

    fn settle<A, B>(left: &ExitRaw, right: &ExitRaw) -> Op
    where
        A: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
    {
        match (left, right) {
            (Exit::Success(a), Exit::Success(b)) => {
                match (a.downcast_ref::<A>(), b.downcast_ref::<B>()) {
                    (Some(a), Some(b)) => succeed_op((a.clone(), b.clone())),
                    _ => Op::Fail(Box::new(|| {
                        Cause::die(ValueTypeMismatch {
                            expected: std::any::type_name::<(A, B)>(),
                        })
                    })),
                }
            }
            (Exit::Failure(l), Exit::Failure(r)) => {
                let cause = l.clone().both(r.clone());
                fail_cause_op(cause)
            }
            (Exit::Failure(cause), Exit::Success(_))
            | (Exit::Success(_), Exit::Failure(cause)) => fail_cause_op(cause.clone()),
        }
    }

    Op::WithFiber(Box::new(move |ctx| {
        let rt = ctx.runtime_handle();
        Op::Async(Box::new(move |handle| {
            let slots: Arc<Mutex<(Option<ExitRaw>, Option<ExitRaw>)>> =
                Arc::new(Mutex::new((None, None)));
            for (index, (me, other)) in [(left.clone(), right.clone()), (right, left)]
                .into_iter()
                .enumerate()
            {
                let slots = Arc::clone(&slots);
                let handle = handle.clone();
                let rt = rt.clone();
                let my_id = me.cell.id.clone();
                let loser = other;
                me.cell.on_exit(Box::new(move |exit| {
                    if exit.is_failure() {
                        interrupt_as(&loser.cell, my_id, &rt);
                    }
                    let settled = {
                        let mut guard = slots.lock();
                        if index == 0 {
                            guard.0 = Some(exit);
                        } else {
                            guard.1 = Some(exit);
                        }
                        match (&guard.0, &guard.1) {
                            (Some(l), Some(r)) => Some(settle::<A, B>(l, r)),
                            _ => None,
                        }
                    };
                    if let Some(op) = settled {
                        handle.resume(op);
                    }
                }));
            }
        }))
    }))
}
