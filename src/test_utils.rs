//! Test utilities for fibra.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Deterministic runtime constructors (virtual clock, small yield
//!   budget)
//! - Exit assertion macros
//!
//! # Example
//! ```
//! use fibra::test_utils::{init_test_logging, test_runtime};
//! use fibra::Effect;
//!
//! fn my_test() {
//!     init_test_logging();
//!     let (runtime, clock) = test_runtime();
//!     let fiber = runtime.spawn(Effect::<i32>::succeed(42));
//!     runtime.run_until_idle();
//!     let _ = clock;
//!     assert!(fiber.status().is_done());
//! }
//! ```

use crate::clock::TestClock;
use crate::runtime::{Runtime, RuntimeConfig};
use std::sync::{Arc, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Yield budget used by deterministic test runtimes; small enough to
/// exercise preemption in ordinary tests.
pub const TEST_YIELD_OP_BUDGET: u32 = 128;

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Create a deterministic runtime on a virtual clock starting at 0.
///
/// Drive it with [`Runtime::run_until_idle`] and advance time through
/// the returned [`TestClock`].
#[must_use]
pub fn test_runtime() -> (Runtime, Arc<TestClock>) {
    init_test_logging();
    let clock = TestClock::new();
    let runtime = Runtime::with_config(
        RuntimeConfig::new()
            .yield_op_budget(TEST_YIELD_OP_BUDGET)
            .clock(clock.clone()),
    )
    .expect("test runtime config is valid");
    (runtime, clock)
}

/// Create a deterministic runtime with an explicit yield budget.
#[must_use]
pub fn test_runtime_with_budget(budget: u32) -> (Runtime, Arc<TestClock>) {
    init_test_logging();
    let clock = TestClock::new();
    let runtime = Runtime::with_config(
        RuntimeConfig::new()
            .yield_op_budget(budget)
            .clock(clock.clone()),
    )
    .expect("test runtime config is valid");
    (runtime, clock)
}

/// Log a major test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that an exit is a success with a specific value.
#[macro_export]
macro_rules! assert_exit_success {
    ($exit:expr, $expected:expr) => {
        match $exit {
            $crate::Exit::Success(v) => assert_eq!(v, $expected),
            $crate::Exit::Failure(cause) => {
                unreachable!("expected success, got failure:\n{}", cause.render())
            }
        }
    };
}

/// Assert that an exit failed with a typed error.
#[macro_export]
macro_rules! assert_exit_failure {
    ($exit:expr, $err_ty:ty, $expected:expr) => {
        match $exit {
            $crate::Exit::Failure(cause) => {
                assert_eq!(cause.first_failure_of::<$err_ty>(), Some($expected));
            }
            $crate::Exit::Success(v) => {
                unreachable!("expected failure, got success: {:?}", v)
            }
        }
    };
}

/// Assert that an exit was caused purely by interruption.
#[macro_export]
macro_rules! assert_exit_interrupted {
    ($exit:expr) => {
        match $exit {
            $crate::Exit::Failure(cause) => {
                assert!(
                    cause.is_interrupted_only(),
                    "expected pure interruption, got:\n{}",
                    cause.render()
                );
            }
            $crate::Exit::Success(v) => {
                unreachable!("expected interruption, got success: {:?}", v)
            }
        }
    };
}

/// Assert that an exit died with a defect.
#[macro_export]
macro_rules! assert_exit_defect {
    ($exit:expr) => {
        match $exit {
            $crate::Exit::Failure(cause) => {
                assert!(cause.is_die(), "expected defect, got:\n{}", cause.render());
            }
            $crate::Exit::Success(v) => {
                unreachable!("expected defect, got success: {:?}", v)
            }
        }
    };
}
