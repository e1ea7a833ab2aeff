//! Queue semantics: strategies, parking, hand-off, and shutdown.

use fibra::error::{DequeueError, EnqueueError};
use fibra::test_utils::{init_test_logging, test_runtime};
use fibra::{assert_exit_interrupted, assert_exit_success, test_complete, test_phase};
use fibra::{Effect, Exit, Never, Queue};

#[test]
fn items_are_taken_in_offer_order() {
    init_test_logging();
    test_phase!("fifo");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::unbounded();

    let take_q = q.clone();
    let program = q
        .offer::<Never>(1)
        .zip_right(q.offer(2))
        .zip_right(q.offer(3))
        .flat_map(move |_| {
            let q2 = take_q.clone();
            take_q.take().flat_map(move |a| {
                let q3 = q2.clone();
                q2.take()
                    .flat_map(move |b| q3.take().map(move |c| (a, b, c)))
            })
        });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, (1, 2, 3));
    test_complete!("items_are_taken_in_offer_order");
}

#[test]
fn full_bounded_queue_parks_the_offeror() {
    init_test_logging();
    test_phase!("backpressure");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::bounded(1).expect("capacity");

    let q1 = q.clone();
    let program = q.offer::<Never>(1).flat_map(move |first| {
        let q2 = q1.clone();
        q1.offer(2).fork().flat_map(move |offeror| {
            let q3 = q2.clone();
            // Give the offeror a turn so it parks against the full buffer.
            Effect::yield_now().flat_map(move |()| {
                q2.take().flat_map(move |a| {
                    offeror.join().flat_map(move |admitted| {
                        q3.take().map(move |b| (first, a, admitted, b))
                    })
                })
            })
        })
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, (true, 1, true, 2));
    test_complete!("full_bounded_queue_parks_the_offeror");
}

#[test]
fn dropping_queue_rejects_at_capacity() {
    init_test_logging();
    test_phase!("dropping");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::dropping(2).expect("capacity");

    let drain = q.clone();
    let program = q
        .offer::<Never>(1)
        .zip(q.offer(2))
        .zip(q.offer(3))
        .flat_map(move |(kept, dropped)| {
            drain.take_all().map(move |items| (kept, dropped, items))
        });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, ((true, true), false, vec![1, 2]));
    test_complete!("dropping_queue_rejects_at_capacity");
}

#[test]
fn sliding_queue_evicts_the_oldest() {
    init_test_logging();
    test_phase!("sliding");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::sliding(2).expect("capacity");

    let drain = q.clone();
    let program = q
        .offer::<Never>(1)
        .zip_right(q.offer(2))
        .zip_right(q.offer(3))
        .flat_map(move |admitted| drain.take_all().map(move |items| (admitted, items)));
    let exit = rt.block_on(program);
    assert_exit_success!(exit, (true, vec![2, 3]));
    test_complete!("sliding_queue_evicts_the_oldest");
}

#[test]
fn empty_queue_parks_the_taker() {
    init_test_logging();
    test_phase!("take-parks");
    let (rt, _clock) = test_runtime();
    let q: Queue<&'static str> = Queue::unbounded();

    let offer_q = q.clone();
    let program = q.take::<Never>().fork().flat_map(move |taker| {
        Effect::yield_now()
            .flat_map(move |()| offer_q.offer("wake"))
            .flat_map(move |admitted| taker.join().map(move |item| (admitted, item)))
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, (true, "wake"));
    test_complete!("empty_queue_parks_the_taker");
}

#[test]
fn take_all_drains_without_parking() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::unbounded();
    let exit = rt.block_on(q.take_all::<Never>());
    assert_exit_success!(exit, Vec::<i32>::new());
    assert!(q.is_empty());
}

#[test]
fn non_blocking_probes() {
    init_test_logging();
    test_phase!("try-ops");
    let q: Queue<i32> = Queue::bounded(1).expect("capacity");

    assert_eq!(q.try_offer(1), Ok(true));
    assert_eq!(q.try_offer(2), Err(EnqueueError::Full));
    assert_eq!(q.len(), 1);
    assert_eq!(q.try_take(), Ok(1));
    assert_eq!(q.try_take(), Err(DequeueError::Empty));

    let dropping: Queue<i32> = Queue::dropping(1).expect("capacity");
    assert_eq!(dropping.try_offer(1), Ok(true));
    assert_eq!(dropping.try_offer(2), Ok(false));

    let sliding: Queue<i32> = Queue::sliding(1).expect("capacity");
    assert_eq!(sliding.try_offer(1), Ok(true));
    assert_eq!(sliding.try_offer(2), Ok(true));
    assert_eq!(sliding.try_take(), Ok(2));

    q.shutdown_now();
    assert_eq!(q.try_offer(9), Err(EnqueueError::Shutdown));
    assert_eq!(q.try_take(), Err(DequeueError::Shutdown));
    test_complete!("non_blocking_probes");
}

#[test]
fn zero_capacity_is_rejected() {
    init_test_logging();
    assert!(Queue::<i32>::bounded(0).is_err());
    assert!(Queue::<i32>::dropping(0).is_err());
    assert!(Queue::<i32>::sliding(0).is_err());
}

#[test]
fn capacity_and_size_are_observable() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::bounded(4).expect("capacity");
    assert_eq!(q.capacity(), 4);
    assert_eq!(Queue::<i32>::unbounded().capacity(), usize::MAX);

    let size_q = q.clone();
    let program = q
        .offer::<Never>(1)
        .zip_right(q.offer(2))
        .flat_map(move |_| size_q.size());
    let exit = rt.block_on(program);
    assert_exit_success!(exit, 2);
    assert_eq!(q.len(), 2);
    assert!(!q.is_empty());
}

#[test]
fn shutdown_wakes_parked_takers_with_interruption() {
    init_test_logging();
    test_phase!("shutdown");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::unbounded();

    let taker = rt.spawn(q.take::<Never>());
    rt.run_until_idle();
    assert!(taker.status().is_suspended());

    q.shutdown_now();
    rt.run_until_idle();
    assert!(q.is_shutdown());
    assert!(taker.status().is_done());

    let exit = rt.block_on(taker.await_exit());
    match exit {
        Exit::Success(inner) => assert_exit_interrupted!(inner),
        Exit::Failure(cause) => unreachable!("await_exit failed:\n{}", cause.render()),
    }

    // Operations after shutdown fail the same way.
    let offer_exit = rt.block_on(q.offer::<Never>(1));
    assert_exit_interrupted!(offer_exit);
    let take_exit = rt.block_on(q.take::<Never>());
    assert_exit_interrupted!(take_exit);
    test_complete!("shutdown_wakes_parked_takers_with_interruption");
}

#[test]
fn shutdown_wakes_parked_offerors_with_interruption() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::bounded(1).expect("capacity");
    assert_eq!(q.try_offer(1), Ok(true));

    let offeror = rt.spawn(q.offer::<Never>(2));
    rt.run_until_idle();
    assert!(offeror.status().is_suspended());

    q.shutdown_now();
    rt.run_until_idle();
    let exit = rt.block_on(offeror.await_exit());
    match exit {
        Exit::Success(inner) => assert_exit_interrupted!(inner),
        Exit::Failure(cause) => unreachable!("await_exit failed:\n{}", cause.render()),
    }
}

#[test]
fn interrupted_taker_never_consumes_an_item() {
    init_test_logging();
    test_phase!("interrupted-taker");
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::unbounded();

    let taker = rt.spawn(q.take::<Never>());
    rt.run_until_idle();
    assert!(taker.status().is_suspended());

    // `interrupt` succeeds with the taker's exit; the interruption is
    // inside that inner exit.
    let interrupt_exit = rt.block_on(taker.interrupt());
    match interrupt_exit {
        Exit::Success(inner) => assert_exit_interrupted!(inner),
        Exit::Failure(cause) => unreachable!("interrupt failed:\n{}", cause.render()),
    }

    // The item must go to the buffer, not the dead park.
    let offer_exit = rt.block_on(q.offer::<Never>(5));
    assert_exit_success!(offer_exit, true);
    let take_exit = rt.block_on(q.take::<Never>());
    assert_exit_success!(take_exit, 5);
    test_complete!("interrupted_taker_never_consumes_an_item");
}

#[test]
fn interrupted_offerors_item_is_discarded() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let q: Queue<i32> = Queue::bounded(1).expect("capacity");
    assert_eq!(q.try_offer(1), Ok(true));

    let offeror = rt.spawn(q.offer::<Never>(2));
    rt.run_until_idle();
    let interrupt_exit = rt.block_on(offeror.interrupt());
    match interrupt_exit {
        Exit::Success(inner) => assert_exit_interrupted!(inner),
        Exit::Failure(cause) => unreachable!("interrupt failed:\n{}", cause.render()),
    }

    // Taking the buffered item frees space; the dead offeror's item must
    // not slip in behind it.
    let take_exit = rt.block_on(q.take::<Never>());
    assert_exit_success!(take_exit, 1);
    assert!(q.is_empty());
    assert_eq!(q.try_take(), Err(DequeueError::Empty));
}
