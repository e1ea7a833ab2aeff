//! Fiber identity.
//!
//! A fiber id is either absent (`None`), a single runtime-assigned id
//! (sequence number plus start timestamp), or a composite set of ids
//! formed when multiple fibers jointly cause an effect — for example a
//! parallel interruption. Composite ids are deduplicated sets and
//! equality is structural.

use core::fmt;
use std::collections::BTreeSet;

/// The identity of a fiber.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FiberId {
    /// No identity. The identity element of [`FiberId::combine`].
    None,
    /// A runtime-assigned identity.
    Runtime {
        /// Monotonically increasing sequence number, unique per runtime.
        sequence_number: u64,
        /// Wall-clock start time of the fiber in milliseconds.
        start_time_millis: u64,
    },
    /// A deduplicated set of runtime ids that jointly caused an effect.
    ///
    /// Composites are kept flat: members are always `Runtime` ids.
    Composite(BTreeSet<FiberId>),
}

impl FiberId {
    /// The absent fiber id.
    #[must_use]
    pub const fn none() -> Self {
        Self::None
    }

    /// Creates a runtime fiber id.
    #[must_use]
    pub const fn runtime(sequence_number: u64, start_time_millis: u64) -> Self {
        Self::Runtime {
            sequence_number,
            start_time_millis,
        }
    }

    /// Returns true if this id is `None`.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Combines two fiber ids into one.
    ///
    /// `None` is the identity; combining two distinct runtime ids forms a
    /// flat, deduplicated composite. Combining equal ids is idempotent.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, id) | (id, Self::None) => id,
            (left, right) if left == right => left,
            (left, right) => {
                let mut ids = BTreeSet::new();
                left.collect_into(&mut ids);
                right.collect_into(&mut ids);
                Self::from_set(ids)
            }
        }
    }

    /// Combines an iterator of fiber ids, treating `None` as identity.
    #[must_use]
    pub fn combine_all<I: IntoIterator<Item = Self>>(ids: I) -> Self {
        ids.into_iter().fold(Self::None, Self::combine)
    }

    /// Returns the set of runtime ids contained in this id.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.clone().collect_into(&mut out);
        out
    }

    fn collect_into(self, out: &mut BTreeSet<FiberId>) {
        match self {
            Self::None => {}
            id @ Self::Runtime { .. } => {
                out.insert(id);
            }
            Self::Composite(ids) => out.extend(ids),
        }
    }

    fn from_set(ids: BTreeSet<FiberId>) -> Self {
        match ids.len() {
            0 => Self::None,
            1 => ids.into_iter().next().unwrap_or(Self::None),
            _ => Self::Composite(ids),
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "#none"),
            Self::Runtime {
                sequence_number, ..
            } => write!(f, "#{sequence_number}"),
            Self::Composite(ids) => {
                write!(f, "#[")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{id}")?;
                }
                write!(f, "]")
            }
        }
    }
}
