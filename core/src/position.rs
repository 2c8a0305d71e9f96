//! Log-wide ordering key.
//!
//! A [`GlobalPosition`] orders every event across all aggregates and instances.
//! `position` is a coarse, transaction-scoped value (every event written by one
//! push shares it); `in_position_order` is the event's rank inside that push and
//! breaks ties.

use crate::error::{EventStoreError, codes};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Total order key of the event log.
///
/// Comparison looks at `position` first and `in_position_order` second, so two
/// events committed by the same transaction still have a strict order.
///
/// # Examples
///
/// ```
/// use eventstore_core::position::GlobalPosition;
///
/// let first = GlobalPosition::new(12.0, 0);
/// let second = GlobalPosition::new(12.0, 1);
/// let later = GlobalPosition::new(13.0, 0);
///
/// assert!(first.is_less(&second));
/// assert!(second.is_less(&later));
/// assert!(first < later);
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GlobalPosition {
    /// Transaction scoped position.
    pub position: f64,
    /// Rank of the event inside its transaction.
    pub in_position_order: u32,
}

impl GlobalPosition {
    /// The position before any event; every stored event is greater.
    pub const ZERO: Self = Self {
        position: 0.0,
        in_position_order: 0,
    };

    /// Create a new position.
    #[must_use]
    pub const fn new(position: f64, in_position_order: u32) -> Self {
        Self {
            position,
            in_position_order,
        }
    }

    /// Returns `true` if `self` sorts strictly before `other`.
    #[must_use]
    pub fn is_less(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Less
    }

    /// Returns `true` if no event has been observed yet.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl PartialEq for GlobalPosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GlobalPosition {}

impl PartialOrd for GlobalPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GlobalPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .total_cmp(&other.position)
            .then(self.in_position_order.cmp(&other.in_position_order))
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.in_position_order)
    }
}

/// Parses the `position:in_position_order` form written by `Display`.
impl FromStr for GlobalPosition {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EventStoreError::invalid_argument(codes::POSITION_INVALID, format!("invalid position: {s:?}"));

        let (position, order) = s.split_once(':').ok_or_else(invalid)?;
        let position: f64 = position.parse().map_err(|_| invalid())?;
        if !position.is_finite() {
            return Err(invalid());
        }
        Ok(Self::new(position, order.parse().map_err(|_| invalid())?))
    }
}
