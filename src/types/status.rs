//! Fiber lifecycle status.

use core::fmt;

/// The lifecycle state of a fiber.
///
/// A fiber is `Running` while it is executing or queued for execution,
/// `Suspended` while parked on an async registration, a join, an STM
/// retry, or a blocking queue/hub operation, and `Done` once its exit has
/// been set. Transitions out of `Done` never happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FiberStatus {
    /// Executing or queued for execution.
    #[default]
    Running,
    /// Parked awaiting an external resumption.
    Suspended,
    /// The exit has been set; observers have been or are being notified.
    Done,
}

impl FiberStatus {
    /// Returns true if the fiber has completed.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true if the fiber is parked.
    #[must_use]
    pub const fn is_suspended(self) -> bool {
        matches!(self, Self::Suspended)
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Done => write!(f, "done"),
        }
    }
}
