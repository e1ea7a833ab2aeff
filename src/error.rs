//! Operation-surface error types.
//!
//! Fiber failure itself travels as a [`crate::Cause`]; the enums here
//! cover the narrower, non-effect surfaces: non-blocking queue and hub
//! probes and runtime construction. They follow the per-surface error
//! enum shape (one enum per primitive, exhaustive variants) rather than a
//! single catch-all error type.

use thiserror::Error;

/// Error returned by non-blocking enqueue probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue has been shut down.
    #[error("queue is shut down")]
    Shutdown,
    /// The queue is at capacity and the strategy does not admit the item.
    #[error("queue is full")]
    Full,
}

/// Error returned by non-blocking dequeue probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DequeueError {
    /// The queue or subscription has been shut down.
    #[error("queue is shut down")]
    Shutdown,
    /// No item is currently available.
    #[error("queue is empty")]
    Empty,
}

/// Error returned when constructing a runtime or one of its primitives
/// with invalid parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A capacity parameter must be non-zero.
    #[error("{what} capacity must be non-zero")]
    ZeroCapacity {
        /// The primitive being constructed.
        what: &'static str,
    },
    /// The yield budget must be non-zero.
    #[error("yield op budget must be non-zero")]
    ZeroYieldBudget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(EnqueueError::Shutdown.to_string(), "queue is shut down");
        assert_eq!(EnqueueError::Full.to_string(), "queue is full");
        assert_eq!(DequeueError::Empty.to_string(), "queue is empty");
        assert_eq!(
            ConfigError::ZeroCapacity { what: "queue" }.to_string(),
            "queue capacity must be non-zero"
        );
    }
}
