//! Core types for the fibra runtime.
//!
//! These types form the vocabulary of the runtime: fiber identity,
//! lifecycle status, the structured failure algebra, and terminal fiber
//! outcomes.

mod cause;
mod exit;
mod fiber_id;
mod status;

pub use cause::{Cause, ErrorPayload};
pub use exit::Exit;
pub use fiber_id::FiberId;
pub use status::FiberStatus;

use core::fmt;

/// An uninhabited error type for effects that cannot fail with a typed
/// error.
///
/// This is the default error parameter of [`crate::Effect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Never {}

impl fmt::Display for Never {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl std::error::Error for Never {}
