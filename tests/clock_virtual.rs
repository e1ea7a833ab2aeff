//! Sleep, timeout, and virtual-time behavior through the runtime.

use fibra::clock;
use fibra::test_utils::{init_test_logging, test_runtime};
use fibra::{assert_exit_success, test_complete, test_phase};
use fibra::{Effect, Exit, Never};
use std::time::Duration;

#[test]
fn sleep_completes_only_when_time_advances() {
    init_test_logging();
    test_phase!("sleep");
    let (rt, clock) = test_runtime();

    let sleeper = rt.spawn(clock::sleep::<Never>(Duration::from_millis(100)));
    rt.run_until_idle();
    assert!(sleeper.status().is_suspended());
    assert_eq!(clock.pending_sleepers(), 1);

    clock.adjust(Duration::from_millis(99));
    rt.run_until_idle();
    assert!(sleeper.status().is_suspended());

    clock.adjust(Duration::from_millis(1));
    rt.run_until_idle();
    assert!(sleeper.status().is_done());

    let exit = rt.block_on(sleeper.await_exit());
    match exit {
        Exit::Success(inner) => assert_exit_success!(inner, ()),
        Exit::Failure(cause) => unreachable!("await_exit failed:\n{}", cause.render()),
    }
    test_complete!("sleep_completes_only_when_time_advances");
}

#[test]
fn sleepers_complete_in_deadline_order() {
    init_test_logging();
    test_phase!("deadline-order");
    let (rt, clock) = test_runtime();

    let slow = rt.spawn(
        clock::sleep::<Never>(Duration::from_millis(30)).flat_map(|()| clock::now_millis()),
    );
    let fast = rt.spawn(
        clock::sleep::<Never>(Duration::from_millis(10)).flat_map(|()| clock::now_millis()),
    );
    rt.run_until_idle();
    assert_eq!(clock.pending_sleepers(), 2);

    // Advance exactly to each deadline so the woken fiber reads the
    // deadline time when it next runs.
    clock.adjust(Duration::from_millis(10));
    rt.run_until_idle();
    assert!(fast.status().is_done());
    assert!(slow.status().is_suspended());

    clock.adjust(Duration::from_millis(20));
    rt.run_until_idle();

    let fast_woke = rt.block_on(fast.join());
    assert_exit_success!(fast_woke, 10);
    let slow_woke = rt.block_on(slow.join());
    assert_exit_success!(slow_woke, 30);
    test_complete!("sleepers_complete_in_deadline_order");
}

#[test]
fn now_millis_reflects_virtual_time() {
    init_test_logging();
    let (rt, clock) = test_runtime();
    clock.adjust(Duration::from_millis(1234));
    let exit = rt.block_on(clock::now_millis::<Never>());
    assert_exit_success!(exit, 1234);
}

#[test]
fn timeout_yields_the_value_when_it_beats_the_clock() {
    init_test_logging();
    test_phase!("timeout-fast");
    let (rt, _clock) = test_runtime();
    let exit = rt.block_on(Effect::<i32>::succeed(7).timeout(Duration::from_millis(50)));
    assert_exit_success!(exit, Some(7));
    test_complete!("timeout_yields_the_value_when_it_beats_the_clock");
}

#[test]
fn timeout_yields_none_when_the_clock_wins() {
    init_test_logging();
    test_phase!("timeout-slow");
    let (rt, clock) = test_runtime();

    let slow: Effect<i32, Never> =
        clock::sleep::<Never>(Duration::from_millis(100)).map(|()| 7);
    let fiber = rt.spawn(slow.timeout(Duration::from_millis(20)));
    rt.run_until_idle();
    assert!(fiber.status().is_suspended());

    clock.adjust(Duration::from_millis(20));
    rt.run_until_idle();
    assert!(fiber.status().is_done());

    let joined = rt.block_on(fiber.join());
    assert_exit_success!(joined, None::<i32>);
    test_complete!("timeout_yields_none_when_the_clock_wins");
}

#[test]
fn racing_sleeps_the_earlier_deadline_wins() {
    init_test_logging();
    test_phase!("race-sleeps");
    let (rt, clock) = test_runtime();

    let early: Effect<&'static str, Never> =
        clock::sleep::<Never>(Duration::from_millis(10)).map(|()| "early");
    let late: Effect<&'static str, Never> =
        clock::sleep::<Never>(Duration::from_millis(50)).map(|()| "late");
    let fiber = rt.spawn(early.race(late));
    rt.run_until_idle();

    clock.adjust(Duration::from_millis(60));
    rt.run_until_idle();

    let joined = rt.block_on(fiber.join());
    assert_exit_success!(joined, "early");
    test_complete!("racing_sleeps_the_earlier_deadline_wins");
}

#[test]
fn sequential_sleeps_accumulate_virtual_time() {
    init_test_logging();
    let (rt, clock) = test_runtime();

    let program = clock::sleep::<Never>(Duration::from_millis(10))
        .flat_map(|()| clock::sleep(Duration::from_millis(10)))
        .flat_map(|()| clock::now_millis());
    let fiber = rt.spawn(program);
    rt.run_until_idle();

    // The second sleep is only registered once the fiber runs again, so
    // each leg needs its own advance.
    clock.adjust(Duration::from_millis(10));
    rt.run_until_idle();
    assert!(fiber.status().is_suspended());

    clock.adjust(Duration::from_millis(10));
    rt.run_until_idle();
    assert!(fiber.status().is_done());

    let joined = rt.block_on(fiber.join());
    assert_exit_success!(joined, 20);
}
