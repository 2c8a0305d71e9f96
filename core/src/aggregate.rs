//! Aggregate identification.
//!
//! An aggregate names one stream of events: one org, one user, one instance.
//! `instance` partitions tenants and `owner` is the resource owning org inside
//! the tenant.

use crate::error::{EventStoreError, Result, codes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to one event stream.
///
/// # Partial equality
///
/// [`Aggregate::matches`] treats empty fields as wildcards, which is how filters
/// and projections compare aggregate references:
///
/// ```
/// use eventstore_core::aggregate::Aggregate;
///
/// let org = Aggregate::new("inst-1", "org", "org-1").with_owner("org-1");
/// let any_org = Aggregate::new("inst-1", "org", "");
///
/// assert!(any_org.matches(&org));
/// assert!(!org.matches(&any_org));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Aggregate id, unique per `(instance, aggregate_type)`.
    pub id: String,
    /// Aggregate type, the first segment of every event type it emits.
    pub aggregate_type: String,
    /// Tenant the aggregate belongs to.
    pub instance: String,
    /// Resource owner inside the tenant.
    pub owner: String,
}

impl Aggregate {
    /// Create an aggregate reference without an owner.
    #[must_use]
    pub fn new(
        instance: impl Into<String>,
        aggregate_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            instance: instance.into(),
            owner: String::new(),
        }
    }

    /// Set the resource owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Returns `true` if every non-empty field of `self` equals the field of `other`.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        fn field(wanted: &str, actual: &str) -> bool {
            wanted.is_empty() || wanted == actual
        }

        field(&self.id, &other.id)
            && field(&self.aggregate_type, &other.aggregate_type)
            && field(&self.instance, &other.instance)
            && field(&self.owner, &other.owner)
    }

    /// Check that the fields required to append events are present.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidArgument`] if the id or type is empty.
    pub fn validate(&self) -> Result<()> {
        if self.aggregate_type.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::AGGREGATE_TYPE_MISSING,
                format!("aggregate {self} has no type"),
            ));
        }
        if self.id.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::AGGREGATE_ID_MISSING,
                format!("aggregate of type {} has no id", self.aggregate_type),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance, self.aggregate_type, self.id)
    }
}
