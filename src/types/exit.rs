//! Terminal fiber outcomes.

use super::{Cause, FiberId};
use core::fmt;

/// The terminal outcome of a fiber: success with a value, or failure with
/// a structured [`Cause`].
///
/// An exit is produced exactly once per fiber and then consumed by every
/// observer (joiners, `await`ers). The error type lives inside the cause;
/// use [`Cause::first_failure_of`] to recover it.
#[derive(Debug, Clone)]
pub enum Exit<A> {
    /// The fiber completed with a value.
    Success(A),
    /// The fiber failed, was interrupted, or died with a defect.
    Failure(Cause),
}

impl<A> Exit<A> {
    /// A successful exit.
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// A failed exit from a typed error.
    pub fn fail<E: fmt::Debug + Send + Sync + 'static>(error: E) -> Self {
        Self::Failure(Cause::fail(error))
    }

    /// A failed exit from a defect.
    pub fn die<D: fmt::Debug + Send + Sync + 'static>(defect: D) -> Self {
        Self::Failure(Cause::die(defect))
    }

    /// An interrupted exit attributed to `by`.
    #[must_use]
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Failure(Cause::interrupt(by))
    }

    /// Returns true if the exit is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if the exit is a failure of any kind.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true if the exit is caused purely by interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(cause) if cause.is_interrupted())
    }

    /// The failure cause, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Maps the success value.
    pub fn map<B, F: FnOnce(A) -> B>(self, f: F) -> Exit<B> {
        match self {
            Self::Success(value) => Exit::Success(f(value)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Converts to a `Result`, surfacing the cause as the error.
    pub fn into_result(self) -> Result<A, Cause> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(cause) => Err(cause),
        }
    }

    /// Converts to a `Result` with a typed error, when the cause's first
    /// failure holds one.
    ///
    /// Defects and interruptions surface as `Err(None)`.
    #[allow(clippy::missing_panics_doc)]
    pub fn into_typed_result<E: Clone + 'static>(self) -> Result<A, Option<E>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(cause) => Err(cause.first_failure_of::<E>()),
        }
    }

    /// Returns the success value or panics with the rendered cause.
    ///
    /// Test-oriented convenience, mirroring `Result::unwrap`.
    #[track_caller]
    pub fn unwrap(self) -> A {
        match self {
            Self::Success(value) => value,
            Self::Failure(cause) => {
                panic!("called `Exit::unwrap()` on a failure:\n{}", cause.render())
            }
        }
    }
}

impl<A, E: fmt::Debug + Send + Sync + 'static> From<Result<A, E>> for Exit<A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::fail(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_roundtrip() {
        let exit = Exit::succeed(42);
        assert!(exit.is_success());
        assert_eq!(exit.into_result().ok(), Some(42));
    }

    #[test]
    fn failure_carries_cause() {
        let exit: Exit<i32> = Exit::fail("boom");
        assert!(exit.is_failure());
        let cause = exit.cause().expect("cause");
        assert_eq!(cause.first_failure_of::<&str>(), Some("boom"));
    }

    #[test]
    fn typed_result_distinguishes_defects() {
        let failed: Exit<i32> = Exit::fail("boom");
        assert_eq!(failed.into_typed_result::<&str>(), Err(Some("boom")));

        let died: Exit<i32> = Exit::die("bug");
        assert_eq!(died.into_typed_result::<&str>(), Err(None));
    }

    #[test]
    fn interrupt_detection() {
        let exit: Exit<()> = Exit::interrupt(FiberId::runtime(1, 0));
        assert!(exit.is_interrupted());
        assert!(!Exit::succeed(()).is_interrupted());
    }

    #[test]
    #[should_panic(expected = "called `Exit::unwrap()` on a failure")]
    fn unwrap_panics_on_failure() {
        let exit: Exit<()> = Exit::fail("boom");
        let _ = exit.unwrap();
    }

    #[test]
    fn from_result() {
        let exit: Exit<i32> = Exit::from(Ok::<_, String>(3));
        assert!(exit.is_success());
        let exit: Exit<i32> = Exit::from(Err::<i32, _>("e".to_string()));
        assert!(exit.is_failure());
    }
}
