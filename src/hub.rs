//! Broadcast hubs.
//!
//! A [`Hub`] delivers every published item to every subscription that
//! existed at publish time, exactly once each. Items are kept in a
//! sequence-numbered deque with a per-item remaining-consumer count;
//! each [`Subscription`] holds a cursor into the sequence and an item is
//! retired as soon as its last outstanding subscriber consumes it (or
//! unsubscribes). A publish with no subscribers retires immediately.
//!
//! Subscribers that are parked waiting for the next item receive it
//! directly at publish time. Dropping a subscription unsubscribes it.
//! Shutdown wakes every parked subscriber with an interruption attributed
//! to no fiber, like queue shutdown.

use crate::effect::{boxed, Effect, Op};
use crate::error::DequeueError;
use crate::fiber::runtime::ResumeHandle;
use crate::types::{Cause, FiberId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

struct HubItem<A> {
    seq: u64,
    value: A,
    remaining: usize,
}

struct SubState {
    cursor: u64,
    parked: Option<ResumeHandle>,
}

struct HubState<A> {
    items: VecDeque<HubItem<A>>,
    next_seq: u64,
    subscribers: HashMap<u64, SubState>,
    next_sub_id: u64,
    shutdown: bool,
}

impl<A> HubState<A> {
    /// Drops fully-consumed items from the front of the deque.
    fn retire_consumed(&mut self) {
        while self
            .items
            .front()
            .is_some_and(|item| item.remaining == 0)
        {
            self.items.pop_front();
        }
    }
}

fn shutdown_cause() -> Cause {
    Cause::interrupt(FiberId::none())
}

fn fail_op(cause: Cause) -> Op {
    Op::Fail(Box::new(move || cause))
}

/// A broadcast hub of `A`.
///
/// Cloning the handle refers to the same hub.
pub struct Hub<A> {
    state: Arc<Mutex<HubState<A>>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> core::fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Hub")
            .field("pending_items", &state.items.len())
            .field("subscribers", &state.subscribers.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<A: Clone + Send + Sync + 'static> Hub<A> {
    /// A hub with no bound on retained items.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                items: VecDeque::new(),
                next_seq: 0,
                subscribers: HashMap::new(),
                next_sub_id: 0,
                shutdown: false,
            })),
        }
    }

    /// The number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Publishes an item to every current subscription.
    ///
    /// Resolves `true` once the item has been recorded for (and directly
    /// delivered to any parked) subscribers. An item published with no
    /// subscribers is dropped and still resolves `true`. Fails with an
    /// interruption after shutdown.
    #[must_use]
    pub fn publish<E>(&self, item: A) -> Effect<bool, E> {
        let state = Arc::clone(&self.state);
        Effect::from_op(Op::Async(Box::new(move |handle| {
            let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
            {
                let mut guard = state.lock();
                if guard.shutdown {
                    resumes.push((handle, fail_op(shutdown_cause())));
                } else {
                    publish_locked(&mut guard, item, &mut resumes);
                    resumes.push((handle, Op::Succeed(boxed(true))));
                }
            }
            for (handle, op) in resumes {
                handle.resume(op);
            }
        })))
    }

    /// Opens a subscription positioned after every already-published
    /// item: only items published from now on are received.
    #[must_use]
    pub fn subscribe<E: 'static>(&self) -> Effect<Subscription<A>, E> {
        let state = Arc::clone(&self.state);
        Effect::sync(move || {
            let mut guard = state.lock();
            let id = guard.next_sub_id;
            guard.next_sub_id += 1;
            let cursor = guard.next_seq;
            guard.subscribers.insert(
                id,
                SubState {
                    cursor,
                    parked: None,
                },
            );
            trace!(subscription = id, cursor, "hub subscribe");
            Subscription {
                state: Arc::clone(&state),
                id,
            }
        })
    }

    /// Returns true if the hub has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Shuts the hub down: drops retained items and subscriptions and
    /// wakes every parked subscriber with an interruption attributed to
    /// no fiber. Idempotent.
    pub fn shutdown_now(&self) {
        let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
        {
            let mut guard = self.state.lock();
            if guard.shutdown {
                return;
            }
            guard.shutdown = true;
            guard.items.clear();
            for sub in guard.subscribers.values_mut() {
                if let Some(handle) = sub.parked.take() {
                    resumes.push((handle, fail_op(shutdown_cause())));
                }
            }
            guard.subscribers.clear();
        }
        for (handle, op) in resumes {
            handle.resume(op);
        }
    }

    /// [`Hub::shutdown_now`] as an effect.
    #[must_use]
    pub fn shutdown<E: 'static>(&self) -> Effect<(), E> {
        let this = self.clone();
        Effect::sync(move || this.shutdown_now())
    }
}

fn publish_locked<A: Clone + Send + Sync + 'static>(
    state: &mut HubState<A>,
    item: A,
    resumes: &mut Vec<(ResumeHandle, Op)>,
) {
    let seq = state.next_seq;
    state.next_seq += 1;
    let mut remaining = state.subscribers.len();
    if remaining == 0 {
        return;
    }
    // Parked subscribers are always positioned at the tail, so this item
    // is theirs: deliver directly and advance their cursors.
    for sub in state.subscribers.values_mut() {
        let Some(handle) = sub.parked.take() else {
            continue;
        };
        if handle.is_spent() {
            // The park was consumed by an interrupt; the subscriber will
            // take this item later through its cursor.
            continue;
        }
        debug_assert_eq!(sub.cursor, seq);
        sub.cursor = seq + 1;
        remaining -= 1;
        resumes.push((handle, Op::Succeed(boxed(item.clone()))));
    }
    if remaining > 0 {
        state.items.push_back(HubItem {
            seq,
            value: item,
            remaining,
        });
    }
}

/// One subscriber's view of a [`Hub`].
///
/// Not cloneable: each subscription consumes its own copy of every item.
/// Dropping it unsubscribes and releases its share of retained items.
pub struct Subscription<A> {
    state: Arc<Mutex<HubState<A>>>,
    id: u64,
}

impl<A> core::fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<A: Clone + Send + Sync + 'static> Subscription<A> {
    /// Takes the next item for this subscription, parking until one is
    /// published. Fails with an interruption after hub shutdown.
    ///
    /// At most one take may be outstanding per subscription; a second
    /// concurrent take replaces the first's park.
    #[must_use]
    pub fn take<E>(&self) -> Effect<A, E> {
        let state = Arc::clone(&self.state);
        let id = self.id;
        Effect::from_op(Op::Async(Box::new(move |handle| {
            let mut resumes: Vec<(ResumeHandle, Op)> = Vec::new();
            {
                let mut guard = state.lock();
                if guard.shutdown {
                    resumes.push((handle, fail_op(shutdown_cause())));
                } else {
                    match take_locked(&mut guard, id) {
                        TakeOutcome::Item(item) => {
                            resumes.push((handle, Op::Succeed(boxed(item))));
                        }
                        TakeOutcome::Park => {
                            if let Some(sub) = guard.subscribers.get_mut(&id) {
                                sub.parked = Some(handle);
                            }
                        }
                        TakeOutcome::Gone => {
                            resumes.push((
                                handle,
                                Op::Fail(Box::new(|| {
                                    Cause::die(SubscriptionClosed)
                                })),
                            ));
                        }
                    }
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
    /// [`DequeueError::Shutdown`] after shutdown or unsubscribe,
    /// [`DequeueError::Empty`] when no item is pending.
    pub fn try_take(&self) -> Result<A, DequeueError> {
        let mut guard = self.state.lock();
        if guard.shutdown {
            return Err(DequeueError::Shutdown);
        }
        match take_locked(&mut guard, self.id) {
            TakeOutcome::Item(item) => Ok(item),
            TakeOutcome::Park => Err(DequeueError::Empty),
            TakeOutcome::Gone => Err(DequeueError::Shutdown),
        }
    }

    /// The number of items currently pending for this subscription.
    #[must_use]
    pub fn pending(&self) -> usize {
        let guard = self.state.lock();
        guard
            .subscribers
            .get(&self.id)
            .map_or(0, |sub| (guard.next_seq - sub.cursor) as usize)
    }
}

impl<A> Drop for Subscription<A> {
    fn drop(&mut self) {
        let mut guard = self.state.lock();
        let Some(sub) = guard.subscribers.remove(&self.id) else {
            return;
        };
        // Release this subscription's share of every pending item.
        for item in guard.items.iter_mut() {
            if item.seq >= sub.cursor && item.remaining > 0 {
                item.remaining -= 1;
            }
        }
        guard.retire_consumed();
    }
}

/// Defect raised when taking from an unsubscribed subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionClosed;

enum TakeOutcome<A> {
    Item(A),
    Park,
    Gone,
}

fn take_locked<A: Clone>(state: &mut HubState<A>, id: u64) -> TakeOutcome<A> {
    let Some(sub) = state.subscribers.get_mut(&id) else {
        return TakeOutcome::Gone;
    };
    // Cursors never trail the front: items are retired only once every
    // outstanding subscriber has consumed them.
    let cursor = sub.cursor;
    let Some(front_seq) = state.items.front().map(|item| item.seq) else {
        return TakeOutcome::Park;
    };
    let index = (cursor.saturating_sub(front_seq)) as usize;
    let Some(item) = state.items.get_mut(index) else {
        return TakeOutcome::Park;
    };
    let value = item.value.clone();
    item.remaining = item.remaining.saturating_sub(1);
    if let Some(sub) = state.subscribers.get_mut(&id) {
        sub.cursor = cursor + 1;
    }
    state.retire_consumed();
    TakeOutcome::Item(value)
}
