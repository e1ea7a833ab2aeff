//! Fiber records, handles, and the evaluator loop.
//!
//! A fiber is the unit of execution: it owns an operation stack, a
//! continuation frame stack, fiber-local ref values, and an ambient
//! context. The [`runtime`] submodule holds the interpreter that drives a
//! fiber for one scheduling quantum; [`Fiber`] is the typed handle other
//! fibers use to join, poll, or interrupt it; [`FiberRef`] is fiber-local
//! state with fork/join propagation.

pub(crate) mod fiber_ref;
pub(crate) mod handle;
pub(crate) mod runtime;

pub use fiber_ref::FiberRef;
pub use handle::Fiber;
