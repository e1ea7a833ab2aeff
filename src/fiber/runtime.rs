//! The fiber record and the trampolined evaluator.
//!
//! Each fiber is a [`FiberCell`]: an id plus a mutex-guarded
//! [`FiberInner`] holding the pending operation, the continuation frame
//! stack, fiber-local refs, the ambient context, the child list, and the
//! exit slot. The executor calls [`run_quantum`] to drive one fiber for a
//! bounded number of operations; everything that must happen outside the
//! fiber lock (async registration, exit observers, child interruption,
//! STM wakeups) is returned as a [`Quantum`] and performed by the caller
//! after the lock is released.
//!
//! # Lock discipline
//!
//! A fiber's lock is held for the whole quantum. No code path acquires a
//! second fiber lock while holding one, with a single exception: a joiner
//! may lock a `Done` child to merge its ref values, and a completed
//! fiber's lock is never wanted by anyone holding another fiber's lock.
//! Queue, hub, and ref-cell locks are leaves.
//!
//! # Interruption
//!
//! Interruption is a request, not a preemption: [`interrupt_as`] records
//! the interrupter, fans out to non-daemon children, and resumes the
//! target only if it is parked interruptibly. The evaluator checks for
//! pending interrupters before executing each operation while
//! interruptible, so a pending interrupt cannot be swallowed by a fold:
//! the handler's continuation is itself preempted at its first
//! interruptible step.

use crate::clock::{Clock, ClockService};
use crate::context::Context;
use crate::effect::{unit_value, AnyValue, CauseFn, FailFn, Op, RegisterFn, ThenFn};
use crate::stm::{CommitOutcome, Journal, StmWakeup, TxStep};
use crate::types::{Cause, ErrorPayload, Exit, FiberId, FiberStatus};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::runtime::RuntimeHandle;

/// A fiber exit with the success value still erased.
pub(crate) type ExitRaw = Exit<Arc<dyn Any + Send + Sync>>;

/// A callback invoked exactly once with the fiber's exit.
pub(crate) type ObserverFn = Box<dyn FnOnce(ExitRaw) + Send>;

/// A fiber-local ref slot: the current value plus the fork/join semantics it
/// was created with.
#[derive(Clone)]
pub(crate) struct StoredRef {
    pub(crate) value: Arc<dyn Any + Send + Sync>,
    pub(crate) semantics: Arc<crate::fiber::fiber_ref::RefSemantics>,
}

/// An untyped fiber handle: the value type is recovered at the API edge.
#[derive(Clone)]
pub(crate) struct RawFiber {
    pub(crate) cell: Arc<FiberCell>,
}

/// The shared record for one fiber.
pub(crate) struct FiberCell {
    pub(crate) id: FiberId,
    pub(crate) seq: u64,
    pub(crate) inner: Mutex<FiberInner>,
}

/// The mutable state of a fiber, guarded by [`FiberCell::inner`].
pub(crate) struct FiberInner {
    pub(crate) status: FiberStatus,
    /// The operation to run next; `None` while executing or done.
    pub(crate) op: Option<Op>,
    pub(crate) frames: Vec<Frame>,
    /// Whether interruption may take effect right now.
    pub(crate) interruptible: bool,
    /// Fibers that have requested interruption.
    pub(crate) interrupters: BTreeSet<FiberId>,
    pub(crate) refs: HashMap<u64, StoredRef>,
    pub(crate) context: Context,
    /// Non-daemon children, interrupted when this fiber completes.
    pub(crate) children: Vec<Arc<FiberCell>>,
    /// Back-pointer for child-list deregistration on completion.
    pub(crate) parent: Weak<FiberCell>,
    pub(crate) exit: Option<ExitRaw>,
    pub(crate) observers: SmallVec<[ObserverFn; 2]>,
    /// The current park slot, when suspended.
    pub(crate) suspension: Option<Arc<Suspension>>,
}

/// A continuation frame on the fiber's stack.
pub(crate) enum Frame {
    /// Success continuation; skipped during failure unwinding.
    Then(ThenFn),
    /// Handles both success and any cause.
    Fold { success: ThenFn, failure: FailFn },
    /// A finalizer to run on whatever outcome reaches it.
    Finalizer(Op),
    /// Marks a running finalizer: holds the outcome to restore once the
    /// finalizer completes, and the mask to reinstate.
    AfterFinalizer {
        pending: Pending,
        prev_interruptible: bool,
    },
    /// Restores the interruptibility flag on exit from a masked region.
    RestoreMask { interruptible: bool },
    /// Restores the ambient context on exit from a provided region.
    RestoreContext(Context),
}

/// The outcome a finalizer interposed on.
pub(crate) enum Pending {
    Success(AnyValue),
    Failure(Cause),
}

/// The evaluator's current position.
enum Step {
    Run(Op),
    Succeed(AnyValue),
    Fail(Cause),
}

/// One-shot park slot for a suspended fiber.
pub(crate) struct Suspension {
    fired: AtomicBool,
    cell: Weak<FiberCell>,
    rt: RuntimeHandle,
}

/// The resume capability handed to async registrations.
///
/// The first [`ResumeHandle::resume`] wins; later calls return `false`.
#[derive(Clone)]
pub(crate) struct ResumeHandle {
    suspension: Arc<Suspension>,
}

impl ResumeHandle {
    /// Resumes the parked fiber with `op` as its next operation.
    ///
    /// Returns `false` if the slot was already consumed, the fiber is
    /// gone, or the park was superseded. Must not be called while holding
    /// any fiber lock.
    pub(crate) fn resume(&self, op: Op) -> bool {
        if self.suspension.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(cell) = self.suspension.cell.upgrade() else {
            return false;
        };
        {
            let mut inner = cell.inner.lock();
            if inner.status.is_done() {
                return false;
            }
            match &inner.suspension {
                Some(current) if Arc::ptr_eq(current, &self.suspension) => {}
                _ => return false,
            }
            inner.suspension = None;
            inner.op = Some(op);
            inner.status = FiberStatus::Running;
        }
        self.suspension.rt.schedule(cell);
        true
    }

    /// Returns true if the slot has already been consumed.
    pub(crate) fn is_spent(&self) -> bool {
        self.suspension.fired.load(Ordering::SeqCst)
    }
}

/// What the executor must do after a quantum, outside the fiber lock.
pub(crate) struct Quantum {
    pub(crate) post: Post,
    /// Deferred STM waiter wakeups from commits in this quantum.
    pub(crate) wakeups: Vec<StmWakeup>,
}

pub(crate) enum Post {
    /// Nothing to do (spurious schedule or still parked).
    Idle,
    /// The fiber yielded or exhausted its budget; requeue it.
    Reschedule,
    /// The fiber parked; invoke the registration with its resume handle.
    Register {
        register: RegisterFn,
        handle: ResumeHandle,
    },
    /// The fiber completed.
    Done {
        exit: ExitRaw,
        observers: Vec<ObserverFn>,
        children: Vec<Arc<FiberCell>>,
        parent: Weak<FiberCell>,
    },
}

impl FiberCell {
    pub(crate) fn create(
        id: FiberId,
        seq: u64,
        op: Op,
        refs: HashMap<u64, StoredRef>,
        context: Context,
        parent: Weak<FiberCell>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            seq,
            inner: Mutex::new(FiberInner {
                status: FiberStatus::Running,
                op: Some(op),
                frames: Vec::new(),
                interruptible: true,
                interrupters: BTreeSet::new(),
                refs,
                context,
                children: Vec::new(),
                parent,
                exit: None,
                observers: SmallVec::new(),
                suspension: None,
            }),
        })
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.inner.lock().status
    }

    pub(crate) fn exit(&self) -> Option<ExitRaw> {
        self.inner.lock().exit.clone()
    }

    /// Registers an exit observer, invoking it immediately (outside the
    /// lock) if the fiber is already done.
    ///
    /// Must not be called while holding any fiber lock.
    pub(crate) fn on_exit(&self, observer: ObserverFn) {
        let immediate = {
            let mut inner = self.inner.lock();
            match &inner.exit {
                Some(exit) => Some(exit.clone()),
                None => {
                    inner.observers.push(observer);
                    return;
                }
            }
        };
        if let Some(exit) = immediate {
            observer(exit);
        }
    }

    pub(crate) fn typed_exit<A: Clone + Send + Sync + 'static>(&self) -> Option<Exit<A>> {
        self.exit().map(|exit| typed_exit_value::<A>(&exit))
    }
}

/// Re-types a raw exit, turning a value-type mismatch into a defect.
pub(crate) fn typed_exit_value<A: Clone + Send + Sync + 'static>(exit: &ExitRaw) -> Exit<A> {
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(a) => Exit::Success(a.clone()),
            None => Exit::Failure(Cause::die(crate::effect::ValueTypeMismatch {
                expected: std::any::type_name::<A>(),
            })),
        },
        Exit::Failure(cause) => Exit::Failure(cause.clone()),
    }
}

/// Requests interruption of `cell` attributed to `by`.
///
/// Fans out to non-daemon children immediately. If the target is parked
/// interruptibly its park slot is consumed with an interrupt cause;
/// otherwise the request takes effect at the target's next interruptible
/// checkpoint. Must not be called while holding any fiber lock.
pub(crate) fn interrupt_as(cell: &Arc<FiberCell>, by: FiberId, rt: &RuntimeHandle) {
    let (park, children) = {
        let mut inner = cell.inner.lock();
        if inner.status.is_done() {
            return;
        }
        inner.interrupters.insert(by.clone());
        let park = if inner.status.is_suspended() && inner.interruptible {
            inner.suspension.clone()
        } else {
            None
        };
        (park, inner.children.clone())
    };
    for child in children {
        interrupt_as(&child, by.clone(), rt);
    }
    if let Some(suspension) = park {
        let cause = Cause::interrupt(by);
        let handle = ResumeHandle { suspension };
        handle.resume(Op::Fail(Box::new(move || cause)));
    }
}

/// View of the running fiber handed to `WithFiber` steps.
pub(crate) struct FiberCtx<'a> {
    pub(crate) id: &'a FiberId,
    pub(crate) inner: &'a mut FiberInner,
    pub(crate) rt: &'a RuntimeHandle,
}

impl FiberCtx<'_> {
    pub(crate) fn fiber_id(&self) -> FiberId {
        self.id.clone()
    }

    pub(crate) fn context(&self) -> Context {
        self.inner.context.clone()
    }

    pub(crate) fn runtime_handle(&self) -> RuntimeHandle {
        Arc::clone(self.rt)
    }

    /// The effective clock: a context-provided service shadows the
    /// runtime default.
    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.inner
            .context
            .get::<ClockService>()
            .map_or_else(|| self.rt.clock(), |service| Arc::clone(&service.0))
    }

    pub(crate) fn ref_value(&self, id: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.refs.get(&id).map(|slot| Arc::clone(&slot.value))
    }

    pub(crate) fn set_ref(
        &mut self,
        id: u64,
        value: Arc<dyn Any + Send + Sync>,
        semantics: Arc<crate::fiber::fiber_ref::RefSemantics>,
    ) {
        self.inner.refs.insert(id, StoredRef { value, semantics });
    }

    pub(crate) fn remove_ref(&mut self, id: u64) {
        self.inner.refs.remove(&id);
    }

    /// Merges a completed child's ref values into this fiber via each
    /// ref's join function. Called by joiners; `child` must be done.
    pub(crate) fn merge_child_refs(&mut self, child: &Arc<FiberCell>) {
        let child_refs: Vec<(u64, StoredRef)> = child
            .inner
            .lock()
            .refs
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        for (id, child_ref) in child_refs {
            let semantics = Arc::clone(&child_ref.semantics);
            let merged = match self.inner.refs.get(&id) {
                Some(parent_ref) => (semantics.join)(&parent_ref.value, &child_ref.value),
                None => (semantics.join)(&semantics.initial, &child_ref.value),
            };
            self.inner.refs.insert(id, StoredRef { value: merged, semantics });
        }
    }
}

fn panic_cause(payload: Box<dyn Any + Send>) -> Cause {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string());
    Cause::Die(ErrorPayload::from_message(message))
}

fn interrupt_cause(interrupters: &BTreeSet<FiberId>) -> Cause {
    interrupters
        .iter()
        .fold(Cause::empty(), |acc, id| acc.both(Cause::interrupt(id.clone())))
}

fn run_then(f: ThenFn, value: AnyValue) -> Step {
    match catch_unwind(AssertUnwindSafe(move || f(value))) {
        Ok(op) => Step::Run(op),
        Err(payload) => Step::Fail(panic_cause(payload)),
    }
}

fn run_fail(f: FailFn, cause: Cause) -> Step {
    match catch_unwind(AssertUnwindSafe(move || f(cause))) {
        Ok(op) => Step::Run(op),
        Err(payload) => Step::Fail(panic_cause(payload)),
    }
}

fn run_cause_thunk(f: CauseFn) -> Step {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(cause) => Step::Fail(cause),
        Err(payload) => Step::Fail(panic_cause(payload)),
    }
}

fn step_into_op(step: Step) -> Op {
    match step {
        Step::Run(op) => op,
        Step::Succeed(value) => Op::Succeed(value),
        Step::Fail(cause) => Op::Fail(Box::new(move || cause)),
    }
}

/// The result of executing one operation node.
enum Advance {
    Next(Step),
    Suspend(RegisterFn),
    Yielded,
}

/// Drives `cell` for one scheduling quantum.
///
/// Returns the post-actions the executor must perform after releasing the
/// fiber lock.
pub(crate) fn run_quantum(cell: &Arc<FiberCell>, rt: &RuntimeHandle) -> Quantum {
    let mut wakeups: Vec<StmWakeup> = Vec::new();
    let mut inner = cell.inner.lock();
    let Some(op) = inner.op.take() else {
        return Quantum {
            post: Post::Idle,
            wakeups,
        };
    };

    let budget = rt.yield_op_budget();
    let mut ops_used: u32 = 0;
    let mut step = Step::Run(op);

    loop {
        if ops_used >= budget {
            inner.op = Some(step_into_op(step));
            return Quantum {
                post: Post::Reschedule,
                wakeups,
            };
        }
        ops_used += 1;

        match step {
            Step::Run(op) => {
                // Frame-installing nodes pass through so an interrupt that
                // lands before the fiber's first step still finds its
                // finalizers and masks installed when the unwind starts.
                if inner.interruptible && !inner.interrupters.is_empty() && !op.installs_frames() {
                    step = Step::Fail(interrupt_cause(&inner.interrupters));
                    continue;
                }
                match run_op(cell, rt, &mut inner, op, &mut wakeups) {
                    Advance::Next(next) => step = next,
                    Advance::Suspend(register) => {
                        let suspension = Arc::new(Suspension {
                            fired: AtomicBool::new(false),
                            cell: Arc::downgrade(cell),
                            rt: Arc::clone(rt),
                        });
                        inner.status = FiberStatus::Suspended;
                        inner.suspension = Some(Arc::clone(&suspension));
                        return Quantum {
                            post: Post::Register {
                                register,
                                handle: ResumeHandle { suspension },
                            },
                            wakeups,
                        };
                    }
                    Advance::Yielded => {
                        inner.op = Some(Op::Succeed(unit_value()));
                        return Quantum {
                            post: Post::Reschedule,
                            wakeups,
                        };
                    }
                }
            }
            Step::Succeed(value) => match inner.frames.pop() {
                None => {
                    let shared: Arc<dyn Any + Send + Sync> = Arc::from(value);
                    let exit = Exit::Success(shared);
                    return Quantum {
                        post: complete(&mut inner, exit),
                        wakeups,
                    };
                }
                Some(Frame::Then(f)) | Some(Frame::Fold { success: f, .. }) => {
                    step = run_then(f, value);
                }
                Some(Frame::Finalizer(finalizer)) => {
                    let prev = inner.interruptible;
                    inner.frames.push(Frame::AfterFinalizer {
                        pending: Pending::Success(value),
                        prev_interruptible: prev,
                    });
                    inner.interruptible = false;
                    step = Step::Run(finalizer);
                }
                Some(Frame::AfterFinalizer {
                    pending,
                    prev_interruptible,
                }) => {
                    inner.interruptible = prev_interruptible;
                    // Re-enter through the checkpoint so an interrupt that
                    // arrived during the finalizer takes effect now.
                    step = match pending {
                        Pending::Success(v) => Step::Run(Op::Succeed(v)),
                        Pending::Failure(c) => Step::Fail(c),
                    };
                }
                Some(Frame::RestoreMask { interruptible }) => {
                    inner.interruptible = interruptible;
                    // Re-enter through the checkpoint so an interrupt that
                    // arrived inside the mask takes effect at the boundary.
                    step = Step::Run(Op::Succeed(value));
                }
                Some(Frame::RestoreContext(context)) => {
                    inner.context = context;
                    step = Step::Succeed(value);
                }
            },
            Step::Fail(cause) => match inner.frames.pop() {
                None => {
                    return Quantum {
                        post: complete(&mut inner, Exit::Failure(cause)),
                        wakeups,
                    };
                }
                Some(Frame::Then(_)) => step = Step::Fail(cause),
                Some(Frame::Fold { failure, .. }) => step = run_fail(failure, cause),
                Some(Frame::Finalizer(finalizer)) => {
                    let prev = inner.interruptible;
                    inner.frames.push(Frame::AfterFinalizer {
                        pending: Pending::Failure(cause),
                        prev_interruptible: prev,
                    });
                    inner.interruptible = false;
                    step = Step::Run(finalizer);
                }
                Some(Frame::AfterFinalizer {
                    pending,
                    prev_interruptible,
                }) => {
                    inner.interruptible = prev_interruptible;
                    // The finalizer itself failed; its cause is sequenced
                    // after the original one.
                    let combined = match pending {
                        Pending::Success(_) => cause,
                        Pending::Failure(original) => original.then(cause),
                    };
                    step = Step::Fail(combined);
                }
                Some(Frame::RestoreMask { interruptible }) => {
                    inner.interruptible = interruptible;
                    step = Step::Fail(cause);
                }
                Some(Frame::RestoreContext(context)) => {
                    inner.context = context;
                    step = Step::Fail(cause);
                }
            },
        }
    }
}

fn complete(inner: &mut MutexGuard<'_, FiberInner>, exit: ExitRaw) -> Post {
    inner.status = FiberStatus::Done;
    inner.exit = Some(exit.clone());
    inner.suspension = None;
    let observers = std::mem::take(&mut inner.observers).into_vec();
    let children = std::mem::take(&mut inner.children);
    let parent = std::mem::replace(&mut inner.parent, Weak::new());
    Post::Done {
        exit,
        observers,
        children,
        parent,
    }
}

#[allow(clippy::too_many_lines)]
fn run_op(
    cell: &Arc<FiberCell>,
    rt: &RuntimeHandle,
    inner: &mut MutexGuard<'_, FiberInner>,
    op: Op,
    wakeups: &mut Vec<StmWakeup>,
) -> Advance {
    match op {
        Op::Succeed(value) => Advance::Next(Step::Succeed(value)),
        Op::Sync(thunk) => match catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(value) => Advance::Next(Step::Succeed(value)),
            Err(payload) => Advance::Next(Step::Fail(panic_cause(payload))),
        },
        Op::Fail(thunk) => Advance::Next(run_cause_thunk(thunk)),
        Op::FlatMap(first, then) => {
            inner.frames.push(Frame::Then(then));
            Advance::Next(Step::Run(*first))
        }
        Op::Fold {
            first,
            success,
            failure,
        } => {
            inner.frames.push(Frame::Fold { success, failure });
            Advance::Next(Step::Run(*first))
        }
        Op::Async(register) => Advance::Suspend(register),
        Op::Fork { child, daemon } => {
            let child_refs: HashMap<u64, StoredRef> = inner
                .refs
                .iter()
                .map(|(id, slot)| {
                    let forked = (slot.semantics.fork)(&slot.value);
                    (
                        *id,
                        StoredRef {
                            value: forked,
                            semantics: Arc::clone(&slot.semantics),
                        },
                    )
                })
                .collect();
            let (seq, id) = rt.next_fiber();
            let parent = if daemon {
                Weak::new()
            } else {
                Arc::downgrade(cell)
            };
            let child_cell =
                FiberCell::create(id, seq, *child, child_refs, inner.context.clone(), parent);
            if !daemon {
                inner.children.push(Arc::clone(&child_cell));
            }
            rt.schedule(Arc::clone(&child_cell));
            Advance::Next(Step::Succeed(Box::new(RawFiber { cell: child_cell })))
        }
        Op::Yield => Advance::Yielded,
        Op::Masked {
            interruptible,
            body,
        } => {
            let previous = inner.interruptible;
            inner.frames.push(Frame::RestoreMask {
                interruptible: previous,
            });
            inner.interruptible = interruptible;
            Advance::Next(Step::Run(*body))
        }
        Op::Ensuring { body, finalizer } => {
            inner.frames.push(Frame::Finalizer(*finalizer));
            Advance::Next(Step::Run(*body))
        }
        Op::WithFiber(f) => {
            let mut ctx = FiberCtx {
                id: &cell.id,
                inner: &mut **inner,
                rt,
            };
            match catch_unwind(AssertUnwindSafe(move || f(&mut ctx))) {
                Ok(op) => Advance::Next(Step::Run(op)),
                Err(payload) => Advance::Next(Step::Fail(panic_cause(payload))),
            }
        }
        Op::Provide { context, body } => {
            let previous = std::mem::replace(&mut inner.context, context);
            inner.frames.push(Frame::RestoreContext(previous));
            Advance::Next(Step::Run(*body))
        }
        Op::While { mut cond, mut body } => {
            match catch_unwind(AssertUnwindSafe(|| cond())) {
                Err(payload) => Advance::Next(Step::Fail(panic_cause(payload))),
                Ok(false) => Advance::Next(Step::Succeed(unit_value())),
                Ok(true) => match catch_unwind(AssertUnwindSafe(|| body())) {
                    Err(payload) => Advance::Next(Step::Fail(panic_cause(payload))),
                    Ok(iteration) => {
                        inner.frames.push(Frame::Then(Box::new(move |_| Op::While {
                            cond,
                            body,
                        })));
                        Advance::Next(Step::Run(iteration))
                    }
                },
            }
        }
        Op::Transaction(txn) => {
            let mut journal = Journal::new();
            let run = Arc::clone(&txn.run);
            let outcome = catch_unwind(AssertUnwindSafe(|| run(&mut journal)));
            match outcome {
                Err(payload) => Advance::Next(Step::Fail(panic_cause(payload))),
                Ok(TxStep::Fail(cause)) => Advance::Next(Step::Fail(cause)),
                Ok(TxStep::Done(value)) => match journal.commit() {
                    CommitOutcome::Committed { mut woken } => {
                        wakeups.append(&mut woken);
                        Advance::Next(Step::Succeed(value))
                    }
                    // Another transaction slipped in; rerun from scratch.
                    CommitOutcome::Conflict => Advance::Next(Step::Run(Op::Transaction(txn))),
                },
                Ok(TxStep::Retry) => {
                    let watched = journal.watch_list();
                    Advance::Suspend(Box::new(move |handle| {
                        let mut changed = false;
                        for (tref, version) in watched {
                            let mut state = tref.state.lock();
                            if state.version != version {
                                changed = true;
                            }
                            // Drop waiters whose park was already consumed,
                            // so refs that are watched but never written do
                            // not accumulate dead entries.
                            state.waiters.retain(|waiter| !waiter.is_spent());
                            let wake_handle = handle.clone();
                            let wake_txn = txn.clone();
                            let spent_handle = handle.clone();
                            state.waiters.push(StmWakeup::new(
                                move || {
                                    wake_handle.resume(Op::Transaction(wake_txn));
                                },
                                move || spent_handle.is_spent(),
                            ));
                        }
                        // A commit may have landed between the failed
                        // attempt and waiter registration; rerun if so.
                        if changed {
                            handle.resume(Op::Transaction(txn));
                        }
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_cause_extracts_str_and_string() {
        let cause = panic_cause(Box::new("boom"));
        assert!(cause.is_die());
        assert!(cause.render().contains("boom"));

        let cause = panic_cause(Box::new("owned".to_string()));
        assert!(cause.render().contains("owned"));

        let cause = panic_cause(Box::new(42_u64));
        assert!(cause.render().contains("non-string"));
    }

    #[test]
    fn interrupt_cause_combines_all_requesters() {
        let mut set = BTreeSet::new();
        set.insert(FiberId::runtime(1, 0));
        set.insert(FiberId::runtime(2, 0));
        let cause = interrupt_cause(&set);
        assert_eq!(cause.interruptors().len(), 2);
    }

    #[test]
    fn typed_exit_mismatch_is_defect() {
        let exit: ExitRaw = Exit::Success(Arc::new(7_u32) as Arc<dyn Any + Send + Sync>);
        let typed = typed_exit_value::<String>(&exit);
        assert!(matches!(typed, Exit::Failure(c) if c.is_die()));
        let ok = typed_exit_value::<u32>(&exit);
        assert!(matches!(ok, Exit::Success(7)));
    }
}
