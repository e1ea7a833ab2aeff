//! Structured concurrency: parent/child lifetimes, interruption flow,
//! masking, and fiber-ref propagation.

use fibra::test_utils::{init_test_logging, test_runtime};
use fibra::{assert_exit_interrupted, assert_exit_success, test_complete, test_phase};
use fibra::{Effect, Exit, Fiber, FiberId, FiberRef, Never, Queue};
use parking_lot::Mutex;
use std::sync::Arc;

#[test]
fn parent_completion_interrupts_children() {
    init_test_logging();
    test_phase!("parent-scope");
    let (rt, _clock) = test_runtime();

    // The parent forks a never-ending child and immediately returns it.
    let parent = Effect::<(), Never>::never()
        .fork()
        .flat_map(Effect::succeed);
    let exit = rt.block_on(parent);
    let child: Fiber<(), Never> = match exit {
        Exit::Success(child) => child,
        Exit::Failure(cause) => unreachable!("parent failed:\n{}", cause.render()),
    };

    rt.run_until_idle();
    assert!(child.status().is_done());
    let child_exit = rt.block_on(child.await_exit());
    match child_exit {
        Exit::Success(inner) => assert_exit_interrupted!(inner),
        Exit::Failure(cause) => unreachable!("await_exit failed:\n{}", cause.render()),
    }
    test_complete!("parent_completion_interrupts_children");
}

#[test]
fn daemon_fibers_outlive_their_parent() {
    init_test_logging();
    test_phase!("daemon");
    let (rt, _clock) = test_runtime();

    let parent = Effect::<(), Never>::never()
        .fork_daemon()
        .flat_map(Effect::succeed);
    let exit = rt.block_on(parent);
    let daemon: Fiber<(), Never> = match exit {
        Exit::Success(daemon) => daemon,
        Exit::Failure(cause) => unreachable!("parent failed:\n{}", cause.render()),
    };

    rt.run_until_idle();
    assert!(daemon.status().is_suspended());
    test_complete!("daemon_fibers_outlive_their_parent");
}

#[test]
fn interruption_fans_out_to_grandchildren() {
    init_test_logging();
    test_phase!("transitive-interrupt");
    let (rt, _clock) = test_runtime();

    let handles: Queue<Fiber<(), Never>> = Queue::unbounded();
    let q = handles.clone();
    let child_body: Effect<(), Never> = Effect::<(), Never>::never()
        .fork()
        .flat_map(move |grandchild| q.offer(grandchild).widen_error())
        .flat_map(|_| Effect::never());

    let program = child_body.fork().flat_map(move |child| {
        handles.take::<Never>().flat_map(move |grandchild| {
            child.interrupt().flat_map(move |child_exit| {
                grandchild.await_exit().map(move |grandchild_exit| {
                    (child_exit.is_interrupted(), grandchild_exit.is_interrupted())
                })
            })
        })
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, (true, true));
    test_complete!("interruption_fans_out_to_grandchildren");
}

#[test]
fn interruption_is_attributed_to_the_requester() {
    init_test_logging();
    let (rt, _clock) = test_runtime();

    let program = Effect::<FiberId, Never>::fiber_id().flat_map(|my_id| {
        Effect::<(), Never>::never().fork().flat_map(move |child| {
            child.interrupt().map(move |exit| {
                let interruptors = exit
                    .cause()
                    .map(fibra::Cause::interruptors)
                    .unwrap_or_default();
                interruptors.contains(&my_id)
            })
        })
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
}

#[test]
fn interrupting_a_completed_fiber_returns_its_exit() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let program = Effect::<u8>::succeed(3).fork().flat_map(|child| {
        child
            .join()
            .flat_map(move |_| child.interrupt().map(|exit| exit.is_success()))
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
}

#[test]
fn join_propagates_child_failure() {
    init_test_logging();
    test_phase!("join");
    let (rt, _clock) = test_runtime();
    let program: Effect<i32, String> = Effect::<i32, String>::fail("child broke".to_string())
        .fork()
        .flat_map(|child| child.join());
    let exit = rt.block_on(program);
    match exit {
        Exit::Failure(cause) => {
            assert_eq!(
                cause.first_failure_of::<String>(),
                Some("child broke".to_string())
            );
        }
        Exit::Success(_) => unreachable!("expected the child's failure"),
    }
    test_complete!("join_propagates_child_failure");
}

#[test]
fn interruption_cannot_be_swallowed_by_fold() {
    init_test_logging();
    test_phase!("unswallowable-interrupt");
    let (rt, _clock) = test_runtime();

    // The child tries to convert any cause into a success; the pending
    // interrupt preempts the recovery continuation.
    let child_body: Effect<i32, Never> = Effect::<i32, Never>::never()
        .fold_cause(Effect::succeed, |_| Effect::succeed(-1));
    let program = child_body
        .fork()
        .flat_map(|child| child.interrupt().map(|exit| exit.is_interrupted()));
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
    test_complete!("interruption_cannot_be_swallowed_by_fold");
}

#[test]
fn uninterruptible_regions_defer_interruption() {
    init_test_logging();
    test_phase!("masking");
    let (rt, _clock) = test_runtime();
    let progress: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let steps = Arc::clone(&progress);
    // Masked work: three yields, then a record. Interrupt lands during
    // the first yield but must not take effect until the mask ends.
    let masked: Effect<(), Never> = Effect::yield_now()
        .flat_map(|()| Effect::yield_now())
        .flat_map(|()| Effect::yield_now())
        .flat_map(move |()| {
            let steps = Arc::clone(&steps);
            Effect::sync(move || steps.lock().push("masked work finished"))
        })
        .uninterruptible();

    let program = masked.fork().flat_map(|child| {
        Effect::yield_now()
            .flat_map(move |()| child.interrupt())
            .map(|exit| exit.is_interrupted())
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
    assert_eq!(*progress.lock(), vec!["masked work finished"]);
    test_complete!("uninterruptible_regions_defer_interruption");
}

#[test]
fn finalizers_run_on_interruption() {
    init_test_logging();
    test_phase!("interrupt-finalizer");
    let (rt, _clock) = test_runtime();
    let cleaned = Arc::new(Mutex::new(false));
    let cleaned2 = Arc::clone(&cleaned);

    let child_body: Effect<(), Never> = Effect::never().ensuring(Effect::sync(move || {
        *cleaned2.lock() = true;
    }));
    let program = child_body
        .fork()
        .flat_map(|child| child.interrupt().map(|exit| exit.is_interrupted()));
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
    assert!(*cleaned.lock());
    test_complete!("finalizers_run_on_interruption");
}

#[test]
fn finalizers_survive_interruption_before_first_step() {
    init_test_logging();
    test_phase!("early-interrupt-finalizer");
    let (rt, _clock) = test_runtime();
    let cleanups = Arc::new(Mutex::new(0_u32));
    let (inner_cleanup, outer_cleanup) = (Arc::clone(&cleanups), Arc::clone(&cleanups));

    // Fork and interrupt within one quantum: the child's interrupt is
    // pending before it executes a single step, yet both nested
    // finalizers must still be installed and run.
    let child_body: Effect<(), Never> = Effect::never()
        .ensuring(Effect::sync(move || *inner_cleanup.lock() += 1))
        .ensuring(Effect::sync(move || *outer_cleanup.lock() += 1));
    let program = child_body
        .fork()
        .flat_map(|child| child.interrupt().map(|exit| exit.is_interrupted()));
    let exit = rt.block_on(program);
    assert_exit_success!(exit, true);
    assert_eq!(*cleanups.lock(), 2);
    test_complete!("finalizers_survive_interruption_before_first_step");
}

#[test]
fn fiber_refs_are_inherited_on_fork() {
    init_test_logging();
    test_phase!("fiber-ref-fork");
    let (rt, _clock) = test_runtime();
    let tag: FiberRef<u32> = FiberRef::new(0);

    let child_tag = tag.clone();
    let program = tag.set::<Never>(5).flat_map(move |()| {
        child_tag
            .get::<Never>()
            .fork()
            .flat_map(|child| child.join())
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, 5);
    test_complete!("fiber_refs_are_inherited_on_fork");
}

#[test]
fn join_merges_child_ref_values() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let tag: FiberRef<u32> = FiberRef::new(0);

    let child_tag = tag.clone();
    let read_tag = tag.clone();
    let program = tag.set::<Never>(1).flat_map(move |()| {
        child_tag
            .set::<Never>(99)
            .fork()
            .flat_map(|child| child.join())
            .flat_map(move |()| read_tag.get())
    });
    let exit = rt.block_on(program);
    // Default join semantics: the child's value wins.
    assert_exit_success!(exit, 99);
}

#[test]
fn unjoined_children_do_not_leak_ref_values() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    let tag: FiberRef<u32> = FiberRef::new(0);

    let child_tag = tag.clone();
    let read_tag = tag.clone();
    let program = tag.set::<Never>(1).flat_map(move |()| {
        child_tag.set::<Never>(99).fork().flat_map(move |child| {
            child
                .await_exit()
                .flat_map(move |_| read_tag.get())
        })
    });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, 1);
}

#[test]
fn locally_restores_the_previous_value() {
    init_test_logging();
    test_phase!("fiber-ref-locally");
    let (rt, _clock) = test_runtime();
    let tag: FiberRef<&'static str> = FiberRef::new("outer");

    let inner_tag = tag.clone();
    let after_tag = tag.clone();
    let program = tag
        .locally("inner", inner_tag.get::<Never>())
        .flat_map(move |seen_inside| {
            after_tag.get().map(move |seen_after| (seen_inside, seen_after))
        });
    let exit = rt.block_on(program);
    assert_exit_success!(exit, ("inner", "outer"));
    test_complete!("locally_restores_the_previous_value");
}

#[test]
fn locally_inside_a_joined_child_does_not_leak() {
    init_test_logging();
    test_phase!("fiber-ref-locally-fork");
    let (rt, _clock) = test_runtime();
    let tag: FiberRef<&'static str> = FiberRef::new("parent");

    let child_tag = tag.clone();
    let read_tag = tag.clone();
    let child_body = child_tag.locally("child", child_tag.get::<Never>());
    let program = tag.set::<Never>("parent").flat_map(move |()| {
        child_body
            .fork()
            .flat_map(|child| child.join())
            .flat_map(move |seen_inside| {
                read_tag
                    .get()
                    .map(move |seen_after| (seen_inside, seen_after))
            })
    });
    let exit = rt.block_on(program);
    // The override was scoped to the child; the join merge carries the
    // child's restored value, so the parent still sees its own.
    assert_exit_success!(exit, ("child", "parent"));
    test_complete!("locally_inside_a_joined_child_does_not_leak");
}

#[test]
fn custom_fork_join_semantics_apply() {
    init_test_logging();
    let (rt, _clock) = test_runtime();
    // Fork resets to zero; join sums parent and child.
    let counter: FiberRef<u32> = FiberRef::with_semantics(0, |_| 0, |parent, child| parent + child);

    let child_counter = counter.clone();
    let read_counter = counter.clone();
    let program = counter.set::<Never>(10).flat_map(move |()| {
        child_counter
            .update::<Never, _>(|n| n + 7)
            .fork()
            .flat_map(|child| child.join())
            .flat_map(move |()| read_counter.get())
    });
    let exit = rt.block_on(program);
    // Child forked at 0, added 7; join sums 10 + 7.
    assert_exit_success!(exit, 17);
}
