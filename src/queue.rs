//! Asynchronous queues.
//!
//! A [`Queue`] is a concurrent buffer with a capacity and an overflow
//! strategy:
//!
//! - back-pressure ([`Queue::bounded`]): offers park until space frees
//! - dropping ([`Queue::dropping`]): offers at capacity return `false`
//! - sliding ([`Queue::sliding`]): offers at capacity evict the oldest
//! - unbounded ([`Queue::unbounded`]): offers always succeed
//!
//! Takes park while the queue is empty. Parked operations are woken in
//! FIFO order; an item handed to a parked taker is never also buffered,
//! and a parked offeror's item enters the buffer only when space frees
//! (or a taker arrives). Shutdown wakes every parked operation with an
//! interruption attributed to no fiber and discards buffered items.
//!
//! All waking happens after the queue's own lock is released, so queue
//! operations never hold two locks at once.

use crate::effect::{boxed, Effect, Op};
use crate::error::{ConfigError, DequeueError, EnqueueError};
use crate::fiber::runtime::ResumeHandle;
use crate::types::{Cause, FiberId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    BackPressure,
    Dropping,
    Sliding,
}

struct QueueState<A> {
    buffer: VecDeque<A>,
    capacity: usize,
    strategy: Strategy,
    takers: VecDeque<ResumeHandle>,
    offerors: VecDeque<(A, ResumeHandle)>,
    shutdown: bool,
}

impl<A> QueueState<A> {
    /// Moves parked offerors' items into free buffer space, collecting
    /// their resumes. Offerors whose park was already consumed (an
    /// interrupted offer) are discarded along with their items.
    fn refill_from_offerors(&mut self, resumes: &mut Vec<(ResumeHandle, Op)>) {
        while self.buffer.len() < self.capacity {
            let Some((item, handle)) = self.offerors.pop_front() else {
                break;
            };
            if handle.is_spent() {
                continue;
            }
            self.buffer.push_back(item);
            resumes.push((handle, Op::Succeed(boxed(true))));
        }
    }
}

fn shutdown_cause() -> Cause {
    Cause::interrupt(FiberId::none())
}

/// A concurrent queue of `A` usable from any fiber.
///
/// Cloning the handle refers to the same queue.
pub struct Queue<A> {
    state: Arc<Mutex<QueueState<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> core::fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("size", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("strategy", &state.strategy)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<A: Send + Sync + 'static> Queue<A> {
    fn with_state(capacity: usize, strategy: Strategy) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                buffer: VecDeque::new(),
                capacity,
                strategy,
                takers: VecDeque::new(),
                offerors: VecDeque::new(),
                shutdown: false,
            })),
        }
    }

    /// A back-pressured queue: offers at capacity park.
    ///
    /// # Errors
    ///
    /// Rejects a zero capacity.
    pub fn bounded(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity { what: "queue" });
        }
        Ok(Self::with_state(capacity, Strategy::BackPressure))
    }

    /// A dropping queue: offers at capacity return `false`.
    ///
    /// # Errors
    ///
    /// Rejects a zero capacity.
    pub fn dropping(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity { what: "queue" });
        }
        Ok(Self::with_state(capacity, Strategy::Dropping))
    }

    /// A sliding queue: offers at capacity evict the oldest item.
    ///
    /// # Errors
    ///
    /// Rejects a zero capacity.
    pub fn sliding(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity { what: "queue" });
        }
        Ok(Self::with_state(capacity, Strategy::Sliding))
    }

    /// A queue with no capacity bound.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_state(usize::MAX, Strategy::BackPressure)
    }

    /// Offers an item. Resolves `true` when the item was admitted,
    /// `false` when a dropping queue rejected it. Parks on a full
    /// back-pressure queue. Fails with an interruption after shutdown.
    #[must_use]
    pub fn offer<E>(&self, item: A) -> Effect<bool, E> {
        let state = Arc::clone(&self.state);
        Effect::from_op(Op::Async(Box::new(move |handle| {
            let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
            {
                let mut guard = state.lock();
                if guard.shutdown {
                    resumes.push((handle, fail_op(shutdown_cause())));
                } else {
                    offer_locked(&mut guard, item, handle, &mut resumes);
                }
            }
            for (handle, op) in resumes {
                handle.resume(op);
            }
        })))
    }

    /// Takes the next item, parking while the queue is empty. Fails with
    /// an interruption after shutdown.
    #[must_use]
    pub fn take<E>(&self) -> Effect<A, E> {
        let state = Arc::clone(&self.state);
        Effect::from_op(Op::Async(Box::new(move |handle| {
            let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
            {
                let mut guard = state.lock();
                if guard.shutdown {
                    resumes.push((handle, fail_op(shutdown_cause())));
                } else if let Some(item) = guard.buffer.pop_front() {
                    guard.refill_from_offerors(&mut resumes);
                    resumes.push((handle, Op::Succeed(boxed(item))));
                } else {
                    guard.takers.push_back(handle);
                }
            }
            for (handle, op) in resumes {
                handle.resume(op);
            }
        })))
    }

    /// Takes every buffered item at once (possibly none), never parking.
    /// Fails with an interruption after shutdown.
    #[must_use]
    pub fn take_all<E>(&self) -> Effect<Vec<A>, E> {
        let state = Arc::clone(&self.state);
        Effect::from_op(Op::Async(Box::new(move |handle| {
            let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
            {
                let mut guard = state.lock();
                if guard.shutdown {
                    resumes.push((handle, fail_op(shutdown_cause())));
                } else {
                    let items: Vec<A> = guard.buffer.drain(..).collect();
                    guard.refill_from_offerors(&mut resumes);
                    resumes.push((handle, Op::Succeed(boxed(items))));
                }
            }
            for (handle, op) in resumes {
                handle.resume(op);
            }
        })))
    }

    /// Non-blocking take.
    ///
    /// # Errors
    ///
    /// [`DequeueError::Shutdown`] after shutdown, [`DequeueError::Empty`]
    /// when no item is buffered.
    pub fn try_take(&self) -> Result<A, DequeueError> {
        let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
        let result = {
            let mut guard = self.state.lock();
            if guard.shutdown {
                Err(DequeueError::Shutdown)
            } else if let Some(item) = guard.buffer.pop_front() {
                guard.refill_from_offerors(&mut resumes);
                Ok(item)
            } else {
                Err(DequeueError::Empty)
            }
        };
        for (handle, op) in resumes {
            handle.resume(op);
        }
        result
    }

    /// Non-blocking offer. Never parks: a full back-pressure queue
    /// reports [`EnqueueError::Full`] and the item is discarded.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Shutdown`] after shutdown, [`EnqueueError::Full`]
    /// when the item was not admitted.
    pub fn try_offer(&self, item: A) -> Result<bool, EnqueueError> {
        let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
        let result = {
            let mut guard = self.state.lock();
            if guard.shutdown {
                Err(EnqueueError::Shutdown)
            } else {
                let mut slot = Some(item);
                while let Some(taker) = guard.takers.pop_front() {
                    if taker.is_spent() {
                        continue;
                    }
                    if let Some(item) = slot.take() {
                        resumes.push((taker, Op::Succeed(boxed(item))));
                    }
                    break;
                }
                match slot {
                    None => Ok(true),
                    Some(item) if guard.buffer.len() < guard.capacity => {
                        guard.buffer.push_back(item);
                        Ok(true)
                    }
                    Some(item) => match guard.strategy {
                        Strategy::BackPressure => Err(EnqueueError::Full),
                        Strategy::Dropping => Ok(false),
                        Strategy::Sliding => {
                            guard.buffer.pop_front();
                            guard.buffer.push_back(item);
                            Ok(true)
                        }
                    },
                }
            }
        };
        for (handle, op) in resumes {
            handle.resume(op);
        }
        result
    }

    /// The number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().buffer.is_empty()
    }

    /// The queue's capacity (`usize::MAX` for unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// The number of buffered items, as an effect.
    #[must_use]
    pub fn size<E: 'static>(&self) -> Effect<usize, E> {
        let this = self.clone();
        Effect::sync(move || this.len())
    }

    /// Returns true if the queue has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Shuts the queue down: discards buffered items and wakes every
    /// parked offer and take with an interruption attributed to no
    /// fiber. Idempotent.
    pub fn shutdown_now(&self) {
        let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
        {
            let mut guard = self.state.lock();
            if guard.shutdown {
                return;
            }
            guard.shutdown = true;
            guard.buffer.clear();
            trace!(
                takers = guard.takers.len(),
                offerors = guard.offerors.len(),
                "queue shutdown"
            );
            for taker in guard.takers.drain(..) {
                resumes.push((taker, fail_op(shutdown_cause())));
            }
            for (_, offeror) in guard.offerors.drain(..) {
                resumes.push((offeror, fail_op(shutdown_cause())));
            }
        }
        for (handle, op) in resumes {
            handle.resume(op);
        }
    }

    /// [`Queue::shutdown_now`] as an effect.
    #[must_use]
    pub fn shutdown<E: 'static>(&self) -> Effect<(), E> {
        let this = self.clone();
        Effect::sync(move || this.shutdown_now())
    }
}

fn fail_op(cause: Cause) -> Op {
    Op::Fail(Box::new(move || cause))
}

fn offer_locked<A: Send + Sync + 'static>(
    state: &mut QueueState<A>,
    item: A,
    handle: ResumeHandle,
    resumes: &mut Vec<(ResumeHandle, Op)>,
) {
    // Hand directly to a parked taker when possible; spent parks (an
    // interrupted take) are skipped.
    while let Some(taker) = state.takers.pop_front() {
        if taker.is_spent() {
            continue;
        }
        resumes.push((taker, Op::Succeed(boxed(item))));
        resumes.push((handle, Op::Succeed(boxed(true))));
        return;
    }
    if state.buffer.len() < state.capacity {
        state.buffer.push_back(item);
        resumes.push((handle, Op::Succeed(boxed(true))));
        return;
    }
    match state.strategy {
        Strategy::BackPressure => state.offerors.push_back((item, handle)),
        Strategy::Dropping => resumes.push((handle, Op::Succeed(boxed(false)))),
        Strategy::Sliding => {
            state.buffer.pop_front();
            state.buffer.push_back(item);
            resumes.push((handle, Op::Succeed(boxed(true))));
        }
    }
}
