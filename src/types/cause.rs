//! The structured failure algebra.
//!
//! A [`Cause`] describes *why* a fiber failed, preserving the full
//! structure of the failure: typed errors (`Fail`), defects (`Die`),
//! interruptions (`Interrupt`), and their sequential/parallel
//! composition. Causes are immutable, persistent trees; subtrees are
//! `Arc`-shared so combining causes never copies them.
//!
//! The three leaf kinds are the runtime's error taxonomy and are never
//! conflated:
//!
//! - `Fail`: an expected, typed domain error — recoverable
//! - `Die`: a defect (panic, broken invariant) — fatal unless caught at
//!   the cause level
//! - `Interrupt`: cancellation, attributed to the interrupting fiber
//!
//! `Sequential` and `Parallel` are associative and have `Empty` as their
//! identity, so combining causes is cheap and lossless: when two parallel
//! branches both fail, both causes remain reachable.

use super::FiberId;
use core::fmt;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// An erased error or defect value.
///
/// Carries the original value for typed recovery plus a rendered form for
/// display, so a cause tree is printable without knowing the error types
/// inside it.
#[derive(Clone)]
pub struct ErrorPayload {
    value: Arc<dyn Any + Send + Sync>,
    rendered: Arc<str>,
}

impl ErrorPayload {
    /// Wraps a typed error value.
    pub fn new<E: fmt::Debug + Send + Sync + 'static>(error: E) -> Self {
        let rendered = format!("{error:?}");
        Self {
            value: Arc::new(error),
            rendered: rendered.into(),
        }
    }

    /// Wraps an already-rendered message, used for panic payloads.
    #[must_use]
    pub fn from_message(message: String) -> Self {
        Self {
            rendered: message.clone().into(),
            value: Arc::new(message),
        }
    }

    /// Attempts to recover the typed error by cloning it out.
    #[must_use]
    pub fn downcast<E: Clone + 'static>(&self) -> Option<E> {
        self.value.downcast_ref::<E>().cloned()
    }

    /// Returns true if the payload holds a value of type `E`.
    #[must_use]
    pub fn is<E: 'static>(&self) -> bool {
        self.value.downcast_ref::<E>().is_some()
    }

    /// The rendered form of the error.
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Debug for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered)
    }
}

/// A structured failure value.
#[derive(Debug, Clone)]
pub enum Cause {
    /// No failure. The identity of [`Cause::then`] and [`Cause::both`].
    Empty,
    /// An expected, typed error.
    Fail(ErrorPayload),
    /// A defect: a panic or violated invariant.
    Die(ErrorPayload),
    /// Interruption, attributed to the requesting fiber.
    Interrupt(FiberId),
    /// Two causes where the right happened after the left.
    Sequential(Arc<Cause>, Arc<Cause>),
    /// Two causes from concurrent branches.
    Parallel(Arc<Cause>, Arc<Cause>),
    /// A cause whose execution trace has been discarded.
    Stackless(Arc<Cause>),
}

impl Cause {
    /// The empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A typed error cause.
    pub fn fail<E: fmt::Debug + Send + Sync + 'static>(error: E) -> Self {
        Self::Fail(ErrorPayload::new(error))
    }

    /// A defect cause.
    pub fn die<D: fmt::Debug + Send + Sync + 'static>(defect: D) -> Self {
        Self::Die(ErrorPayload::new(defect))
    }

    /// An interruption cause attributed to `by`.
    #[must_use]
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Interrupt(by)
    }

    /// Sequences `other` after `self`. `Empty` is the identity.
    #[must_use]
    pub fn then(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Sequential(Arc::new(l), Arc::new(r)),
        }
    }

    /// Combines `self` and `other` as concurrent causes. `Empty` is the
    /// identity.
    #[must_use]
    pub fn both(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (l, r) => Self::Parallel(Arc::new(l), Arc::new(r)),
        }
    }

    /// Wraps this cause as stackless.
    #[must_use]
    pub fn stackless(self) -> Self {
        Self::Stackless(Arc::new(self))
    }

    /// Returns true if the cause is `Empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns true if any leaf is an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.leaves().any(|leaf| matches!(leaf, Self::Interrupt(_)))
    }

    /// Returns true if the cause contains only interruption leaves (and
    /// at least one).
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        let mut any = false;
        for leaf in self.leaves() {
            match leaf {
                Self::Interrupt(_) => any = true,
                Self::Empty => {}
                _ => return false,
            }
        }
        any
    }

    /// Returns true if any leaf is a defect.
    #[must_use]
    pub fn is_die(&self) -> bool {
        self.leaves().any(|leaf| matches!(leaf, Self::Die(_)))
    }

    /// Returns true if any leaf is a typed failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.leaves().any(|leaf| matches!(leaf, Self::Fail(_)))
    }

    /// All typed-error payloads, left to right.
    #[must_use]
    pub fn failures(&self) -> Vec<ErrorPayload> {
        self.leaves()
            .filter_map(|leaf| match leaf {
                Self::Fail(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// All defect payloads, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<ErrorPayload> {
        self.leaves()
            .filter_map(|leaf| match leaf {
                Self::Die(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// The set of fibers that contributed interruptions.
    #[must_use]
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        self.leaves()
            .filter_map(|leaf| match leaf {
                Self::Interrupt(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// The leftmost typed failure, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<ErrorPayload> {
        self.leaves().find_map(|leaf| match leaf {
            Self::Fail(payload) => Some(payload.clone()),
            _ => None,
        })
    }

    /// The leftmost typed failure recovered as `E`, if the payload holds
    /// that type.
    #[must_use]
    pub fn first_failure_of<E: Clone + 'static>(&self) -> Option<E> {
        self.first_failure().and_then(|payload| payload.downcast())
    }

    /// Iterates the leaves of the cause tree, left to right.
    ///
    /// Uses an explicit stack: cause trees built by deeply sequential
    /// programs can be tall.
    pub fn leaves(&self) -> impl Iterator<Item = &Cause> {
        Leaves { stack: vec![self] }
    }

    /// Renders the cause tree as an indented, human-readable dump.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        use core::fmt::Write as _;
        let pad = "  ".repeat(depth);
        match self {
            Self::Empty => {
                let _ = writeln!(out, "{pad}Empty");
            }
            Self::Fail(payload) => {
                let _ = writeln!(out, "{pad}Fail: {payload}");
            }
            Self::Die(payload) => {
                let _ = writeln!(out, "{pad}Die: {payload}");
            }
            Self::Interrupt(id) => {
                let _ = writeln!(out, "{pad}Interrupt: by {id}");
            }
            Self::Sequential(l, r) => {
                let _ = writeln!(out, "{pad}Sequential");
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
            Self::Parallel(l, r) => {
                let _ = writeln!(out, "{pad}Parallel");
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
            Self::Stackless(inner) => {
                let _ = writeln!(out, "{pad}Stackless");
                inner.render_into(out, depth + 1);
            }
        }
    }
}

fn empty_arc() -> Arc<Cause> {
    static EMPTY: OnceLock<Arc<Cause>> = OnceLock::new();
    Arc::clone(EMPTY.get_or_init(|| Arc::new(Cause::Empty)))
}

impl Cause {
    /// Detaches this node's children onto `out`, leaving shared empty
    /// placeholders behind.
    fn take_children(&mut self, out: &mut Vec<Arc<Cause>>) {
        match self {
            Self::Sequential(l, r) | Self::Parallel(l, r) => {
                out.push(std::mem::replace(l, empty_arc()));
                out.push(std::mem::replace(r, empty_arc()));
            }
            Self::Stackless(inner) => out.push(std::mem::replace(inner, empty_arc())),
            Self::Empty | Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => {}
        }
    }
}

// Tall trees from long `then` chains would overflow the native stack
// under the derived recursive drop; tear them down with a worklist
// instead. Shared subtrees are left to their remaining owners.
impl Drop for Cause {
    fn drop(&mut self) {
        let mut stack: Vec<Arc<Cause>> = Vec::new();
        self.take_children(&mut stack);
        while let Some(node) = stack.pop() {
            if let Some(mut inner) = Arc::into_inner(node) {
                inner.take_children(&mut stack);
            }
        }
    }
}

struct Leaves<'a> {
    stack: Vec<&'a Cause>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a Cause;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(cause) = self.stack.pop() {
            match cause {
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    // Right pushed first so the left leaf pops first.
                    self.stack.push(r);
                    self.stack.push(l);
                }
                Cause::Stackless(inner) => self.stack.push(inner),
                leaf => return Some(leaf),
            }
        }
        None
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_identity_for_then_and_both() {
        let fail = Cause::fail("boom");
        assert!(matches!(
            Cause::Empty.then(fail.clone()),
            Cause::Fail(_)
        ));
        assert!(matches!(fail.clone().then(Cause::Empty), Cause::Fail(_)));
        assert!(matches!(
            Cause::Empty.both(fail.clone()),
            Cause::Fail(_)
        ));
        assert!(matches!(fail.both(Cause::Empty), Cause::Fail(_)));
    }

    #[test]
    fn parallel_retains_both_failures() {
        let cause = Cause::fail("left").both(Cause::fail("right"));
        let failures = cause.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].downcast::<&str>(), Some("left"));
        assert_eq!(failures[1].downcast::<&str>(), Some("right"));
    }

    #[test]
    fn leaves_walk_left_to_right() {
        let cause = Cause::fail(1_i32)
            .then(Cause::fail(2_i32))
            .both(Cause::fail(3_i32));
        let seen: Vec<i32> = cause
            .failures()
            .iter()
            .filter_map(ErrorPayload::downcast::<i32>)
            .collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn interrupted_only_requires_all_interrupt_leaves() {
        let pure_interrupt = Cause::interrupt(FiberId::runtime(1, 0));
        assert!(pure_interrupt.is_interrupted_only());

        let mixed = Cause::interrupt(FiberId::runtime(1, 0)).then(Cause::fail("boom"));
        assert!(mixed.is_interrupted());
        assert!(!mixed.is_interrupted_only());

        assert!(!Cause::Empty.is_interrupted_only());
    }

    #[test]
    fn interruptors_deduplicate() {
        let id = FiberId::runtime(4, 0);
        let cause = Cause::interrupt(id.clone()).both(Cause::interrupt(id.clone()));
        let interruptors = cause.interruptors();
        assert_eq!(interruptors.len(), 1);
        assert!(interruptors.contains(&id));
    }

    #[test]
    fn typed_recovery_via_downcast() {
        #[derive(Debug, Clone, PartialEq)]
        struct AppError(u32);

        let cause = Cause::fail(AppError(7));
        assert_eq!(cause.first_failure_of::<AppError>(), Some(AppError(7)));
        assert_eq!(cause.first_failure_of::<String>(), None);
    }

    #[test]
    fn defects_are_not_failures() {
        let cause = Cause::die("invariant broken");
        assert!(cause.is_die());
        assert!(!cause.is_failure());
        assert!(cause.first_failure().is_none());
        assert_eq!(cause.defects().len(), 1);
    }

    #[test]
    fn render_shows_structure() {
        let cause = Cause::fail("a").both(Cause::die("b"));
        let rendered = cause.render();
        assert!(rendered.contains("Parallel"));
        assert!(rendered.contains("Fail: \"a\""));
        assert!(rendered.contains("Die: \"b\""));
    }

    #[test]
    fn tall_cause_trees_do_not_overflow_leaf_iteration() {
        let mut cause = Cause::fail(0_i32);
        for i in 1..20_000_i32 {
            cause = cause.then(Cause::fail(i));
        }
        assert_eq!(cause.failures().len(), 20_000);
    }

    #[test]
    fn dropping_tall_cause_trees_does_not_recurse() {
        let mut cause = Cause::fail(0_i32);
        for i in 1..100_000_i32 {
            cause = cause.then(Cause::fail(i));
        }
        drop(cause);
    }

    #[test]
    fn shared_subtrees_survive_a_sibling_drop() {
        let shared = Cause::fail("kept");
        let tree = shared.clone().then(Cause::fail("dropped"));
        drop(tree);
        assert_eq!(shared.first_failure_of::<&str>(), Some("kept"));
    }
}
