//! Fibra: a fiber-based effect runtime.
//!
//! # Overview
//!
//! Fibra executes *effect descriptions* — immutable trees of operations —
//! on lightweight, cooperatively scheduled fibers. The runtime is built on
//! the principle that concurrency structure should be explicit: every
//! forked fiber is a child of the fiber that forked it, interruption flows
//! along that tree, and failure is a structured value rather than a bare
//! error.
//!
//! # Core Guarantees
//!
//! - **Trampolined evaluation**: arbitrarily deep `flat_map` chains run in
//!   constant native stack space
//! - **Cooperative preemption**: fibers yield after a configurable
//!   operation budget; suspension points are exactly async registrations,
//!   joins, STM retries, queue/hub blocking, and yields
//! - **Structured failure**: `Fail` (typed, recoverable), `Die` (defect),
//!   and `Interrupt` (cancellation) are never conflated; concurrent
//!   failures combine with `Parallel` instead of dropping one side
//! - **Finalizer safety**: `ensuring` finalizers run exactly once, in
//!   reverse acquisition order, uninterruptibly, even when interrupted
//! - **Optimistic STM**: transactions stage reads/writes in a journal and
//!   commit atomically under a version check; conflicts retry silently
//! - **Deterministic testing**: a single-threaded executor plus a virtual
//!   test clock make time-dependent code testable without real delays
//!
//! # Module Structure
//!
//! - [`types`]: Core types (fiber identity, lifecycle status, `Cause`,
//!   `Exit`)
//! - [`effect`]: The effect description surface and its combinators
//! - [`fiber`]: Fiber records, fiber-local refs, and the evaluator loop
//! - [`runtime`]: The runtime value, pluggable scheduler, and timer heap
//! - [`clock`]: Clock service with live and virtual implementations
//! - [`queue`]: Bounded/unbounded/dropping/sliding concurrent queues
//! - [`hub`]: Broadcast hubs with per-subscriber cursors
//! - [`stm`]: Transactional refs, journals, and the commit protocol
//! - [`context`]: Typed service map threaded through fibers
//! - [`error`]: Operation-surface error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod clock;
pub mod context;
pub mod effect;
pub mod error;
pub mod fiber;
pub mod hub;
pub mod queue;
pub mod runtime;
pub mod stm;
pub mod test_utils;
pub mod types;

pub use clock::{Clock, LiveClock, TestClock};
pub use context::Context;
pub use effect::Effect;
pub use fiber::{Fiber, FiberRef};
pub use hub::{Hub, Subscription};
pub use queue::Queue;
pub use runtime::scheduler::{FifoScheduler, Scheduler, Task};
pub use runtime::{Runtime, RuntimeConfig};
pub use stm::{Stm, TRef};
pub use types::{Cause, Exit, FiberId, FiberStatus, Never};
