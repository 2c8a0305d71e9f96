//! Unique constraints encoded in the event log.
//!
//! There is no unique index. A reservation is an ordinary event appended to a
//! synthetic aggregate whose id is the uniqueness key:
//!
//! ```text
//! aggregate type:  "unique_constraint"
//! aggregate id:    "<unique_type>:<unique_field>"
//! instance:        the push instance, or "" for global constraints
//! events:          unique_constraint.added / unique_constraint.removed
//! ```
//!
//! A key is reserved while the latest event of its aggregate is
//! `unique_constraint.added`. Backends read that latest event inside the push
//! transaction, decide with [`UniqueConstraint::reservation_command`], and append
//! with `CurrentSequence::Matches(latest_sequence)`, so two racing reservations
//! of the same key cannot both win.

use crate::aggregate::Aggregate;
use crate::error::{EventStoreError, Result, codes};
use crate::event::{Command, EventPayload, StorageEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate type of reservation streams.
pub const UNIQUE_AGGREGATE_TYPE: &str = "unique_constraint";

/// Payload of a reservation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraintAdded {
    /// Namespace of the key, e.g. `"org_name"`.
    pub unique_type: String,
    /// The reserved value.
    pub unique_field: String,
}

impl EventPayload for UniqueConstraintAdded {
    const EVENT_TYPE: &'static str = "unique_constraint.added";
}

/// Payload of a release event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraintRemoved {
    /// Namespace of the key.
    pub unique_type: String,
    /// The released value.
    pub unique_field: String,
}

impl EventPayload for UniqueConstraintRemoved {
    const EVENT_TYPE: &'static str = "unique_constraint.removed";
}

/// What a constraint does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueAction {
    /// Reserve the key; fails if it is already reserved.
    Add,
    /// Release the key; fails if it is not reserved.
    Remove,
    /// Release every non-global reservation of the push instance.
    InstanceRemove,
}

/// A uniqueness change applied atomically with a push.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Namespace of the key.
    pub unique_type: String,
    /// The value that must be unique.
    pub unique_field: String,
    /// Add, remove or instance wide removal.
    pub action: UniqueAction,
    /// Translatable message returned on collision, e.g. `"Errors.Org.AlreadyExists"`.
    pub error_message: String,
    /// Global constraints are not scoped by instance.
    pub is_global: bool,
}

impl UniqueConstraint {
    /// Reserve `(unique_type, unique_field)` inside the push instance.
    #[must_use]
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueAction::Add,
            error_message: error_message.into(),
            is_global: false,
        }
    }

    /// Reserve `(unique_type, unique_field)` across all instances.
    #[must_use]
    pub fn add_global(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            is_global: true,
            ..Self::add(unique_type, unique_field, error_message)
        }
    }

    /// Release `(unique_type, unique_field)` inside the push instance.
    #[must_use]
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueAction::Remove,
            error_message: String::new(),
            is_global: false,
        }
    }

    /// Release a global reservation.
    #[must_use]
    pub fn remove_global(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            is_global: true,
            ..Self::remove(unique_type, unique_field)
        }
    }

    /// Release every non-global reservation of the push instance.
    #[must_use]
    pub const fn remove_instance() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            action: UniqueAction::InstanceRemove,
            error_message: String::new(),
            is_global: false,
        }
    }

    /// Check that add/remove constraints name a key.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidArgument`] if type or field is empty.
    pub fn validate(&self) -> Result<()> {
        if self.action == UniqueAction::InstanceRemove {
            return Ok(());
        }
        if self.unique_type.is_empty() || self.unique_field.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::UNIQUE_INVALID,
                "unique constraint needs a type and a field",
            ));
        }
        Ok(())
    }

    /// The reservation aggregate of this constraint's key inside `instance`.
    #[must_use]
    pub fn reservation_aggregate(&self, instance: &str) -> Aggregate {
        let instance = if self.is_global { "" } else { instance };
        Aggregate::new(
            instance,
            UNIQUE_AGGREGATE_TYPE,
            format!("{}:{}", self.unique_type, self.unique_field),
        )
    }

    /// Decide the event to append given the latest event type of the key's
    /// reservation aggregate (`None` if it has no events).
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::UniqueConstraint`] with [`codes::UNIQUE_ALREADY_EXISTS`]
    ///   when adding a reserved key
    /// - [`EventStoreError::UniqueConstraint`] with [`codes::UNIQUE_NOT_FOUND`]
    ///   when removing a key that is not reserved
    /// - [`EventStoreError::InvalidArgument`] for instance wide removals, which are
    ///   expanded with [`active_reservations`] instead
    pub fn reservation_command(&self, creator: &str, latest_event_type: Option<&str>) -> Result<Command> {
        let reserved = latest_event_type == Some(UniqueConstraintAdded::EVENT_TYPE);
        match self.action {
            UniqueAction::Add if reserved => Err(EventStoreError::UniqueConstraint {
                code: codes::UNIQUE_ALREADY_EXISTS,
                message: self.collision_message(),
            }),
            UniqueAction::Add => Command::new(
                creator,
                &UniqueConstraintAdded {
                    unique_type: self.unique_type.clone(),
                    unique_field: self.unique_field.clone(),
                },
            ),
            UniqueAction::Remove if !reserved => Err(EventStoreError::UniqueConstraint {
                code: codes::UNIQUE_NOT_FOUND,
                message: self.collision_message(),
            }),
            UniqueAction::Remove => Command::new(
                creator,
                &UniqueConstraintRemoved {
                    unique_type: self.unique_type.clone(),
                    unique_field: self.unique_field.clone(),
                },
            ),
            UniqueAction::InstanceRemove => Err(EventStoreError::invalid_argument(
                codes::UNIQUE_INVALID,
                "instance removal has no single reservation",
            )),
        }
    }

    fn collision_message(&self) -> String {
        if self.error_message.is_empty() {
            format!("{}:{}", self.unique_type, self.unique_field)
        } else {
            self.error_message.clone()
        }
    }
}

/// Reservation aggregates whose latest event is a reservation.
///
/// `events` are events of [`UNIQUE_AGGREGATE_TYPE`] aggregates in ascending
/// position order.
#[must_use]
pub fn active_reservations(events: &[StorageEvent]) -> Vec<(Aggregate, u32)> {
    let mut latest: HashMap<&Aggregate, &StorageEvent> = HashMap::new();
    for event in events {
        if event.aggregate.aggregate_type == UNIQUE_AGGREGATE_TYPE {
            latest.insert(&event.aggregate, event);
        }
    }

    let mut active: Vec<(Aggregate, u32)> = latest
        .into_values()
        .filter(|event| event.is::<UniqueConstraintAdded>())
        .map(|event| (event.aggregate.clone(), event.sequence))
        .collect();
    active.sort_by(|a, b| a.0.id.cmp(&b.0.id));
    active
}

/// The release command for a reservation found by [`active_reservations`].
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidArgument`] if the aggregate id is not a
/// `"<type>:<field>"` key.
pub fn release_command(creator: &str, reservation: &Aggregate) -> Result<Command> {
    let (unique_type, unique_field) = reservation.id.split_once(':').ok_or_else(|| {
        EventStoreError::invalid_argument(
            codes::UNIQUE_INVALID,
            format!("{reservation} is not a reservation aggregate"),
        )
    })?;
    Command::new(
        creator,
        &UniqueConstraintRemoved {
            unique_type: unique_type.to_string(),
            unique_field: unique_field.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::GlobalPosition;
    use chrono::Utc;

    #[test]
    fn global_constraints_ignore_instance() {
        let local = UniqueConstraint::add("org_name", "Acme", "Errors.Org.AlreadyExists");
        let global = UniqueConstraint::add_global("username", "alice", "Errors.User.AlreadyExists");

        assert_eq!(local.reservation_aggregate("inst-1").instance, "inst-1");
        assert_eq!(local.reservation_aggregate("inst-1").id, "org_name:Acme");
        assert_eq!(global.reservation_aggregate("inst-1").instance, "");
    }

    #[test]
    fn add_on_free_key_reserves() {
        let constraint = UniqueConstraint::add("org_name", "Acme", "Errors.Org.AlreadyExists");
        let command = constraint.reservation_command("user-1", None);
        assert!(matches!(command, Ok(c) if c.event_type == "unique_constraint.added"));

        let after_release =
            constraint.reservation_command("user-1", Some(UniqueConstraintRemoved::EVENT_TYPE));
        assert!(after_release.is_ok());
    }

    #[test]
    fn double_add_is_precondition_failure() {
        let constraint = UniqueConstraint::add("org_name", "Acme", "Errors.Org.AlreadyExists");
        let err = constraint
            .reservation_command("user-1", Some(UniqueConstraintAdded::EVENT_TYPE))
            .err();

        match err {
            Some(EventStoreError::UniqueConstraint { code, message }) => {
                assert_eq!(code, codes::UNIQUE_ALREADY_EXISTS);
                assert_eq!(message, "Errors.Org.AlreadyExists");
            }
            other => unreachable!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn removing_unreserved_key_is_not_found() {
        let constraint = UniqueConstraint::remove("org_name", "Acme");
        let err = constraint.reservation_command("user-1", None).err();
        assert!(matches!(
            err,
            Some(EventStoreError::UniqueConstraint { code, .. }) if code == codes::UNIQUE_NOT_FOUND
        ));
    }

    #[test]
    fn validate_requires_key_except_instance_removal() {
        assert!(UniqueConstraint::add("", "Acme", "").validate().is_err());
        assert!(UniqueConstraint::remove("org_name", "").validate().is_err());
        assert!(UniqueConstraint::remove_instance().validate().is_ok());
    }

    fn reservation_event(id: &str, event_type: &str, sequence: u32) -> StorageEvent {
        StorageEvent {
            creator: "user-1".into(),
            event_type: event_type.into(),
            revision: 1,
            payload: crate::event::Payload::empty(),
            aggregate: Aggregate::new("inst-1", UNIQUE_AGGREGATE_TYPE, id),
            created_at: Utc::now(),
            position: GlobalPosition::new(f64::from(sequence), 0),
            sequence,
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn active_reservations_follow_latest_event() {
        let events = vec![
            reservation_event("org_name:Acme", UniqueConstraintAdded::EVENT_TYPE, 1),
            reservation_event("org_name:Beta", UniqueConstraintAdded::EVENT_TYPE, 1),
            reservation_event("org_name:Acme", UniqueConstraintRemoved::EVENT_TYPE, 2),
        ];

        let active = active_reservations(&events);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.id, "org_name:Beta");
        assert_eq!(active[0].1, 1);

        let release = release_command("system", &active[0].0).unwrap();
        let removed: UniqueConstraintRemoved = release.payload.unmarshal().unwrap();
        assert_eq!(removed.unique_type, "org_name");
        assert_eq!(removed.unique_field, "Beta");
    }
}
