//! Per-aggregate concurrency checks.
//!
//! Every aggregate has a sequence that starts at 0 (no events) and increases by
//! one for each appended event. A push names a [`CurrentSequence`] per aggregate
//! and the backend rejects the whole push if any check fails.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Concurrency check applied to an aggregate's current sequence before appending.
///
/// # Examples
///
/// ```
/// use eventstore_core::sequence::CurrentSequence;
///
/// assert!(CurrentSequence::Ignore.check(42));
/// assert!(CurrentSequence::Matches(0).check(0));
/// assert!(!CurrentSequence::Matches(0).check(1));
/// assert!(CurrentSequence::AtLeast(3).check(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CurrentSequence {
    /// Append unconditionally.
    #[default]
    Ignore,
    /// The current sequence must equal exactly this value.
    Matches(u32),
    /// The current sequence must be greater than or equal to this value.
    AtLeast(u32),
}

impl CurrentSequence {
    /// Returns `true` if `current` satisfies the check.
    #[must_use]
    pub const fn check(self, current: u32) -> bool {
        match self {
            Self::Ignore => true,
            Self::Matches(expected) => current == expected,
            Self::AtLeast(minimum) => current >= minimum,
        }
    }
}

impl fmt::Display for CurrentSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => write!(f, "any sequence"),
            Self::Matches(n) => write!(f, "sequence {n}"),
            Self::AtLeast(n) => write!(f, "sequence >= {n}"),
        }
    }
}
