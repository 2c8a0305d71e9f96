//! Lifecycle state tracking.
//!
//! Most read models need to know whether their object is active, deactivated
//! or removed. [`state_handlers`] builds that table from the event types of an
//! aggregate, and the resulting `Projection<ObjectState>` is embedded into a
//! richer projection with [`HandlerTable::embed`], keeping its own watermark.

use crate::handler::HandlerTable;
use eventstore_core::event::{StorageEvent, aggregate_type_of};
use serde::{Deserialize, Serialize};

/// Lifecycle of a projected object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    /// No lifecycle event seen yet.
    #[default]
    Unspecified,
    /// Added or reactivated.
    Active,
    /// Deactivated.
    Inactive,
    /// Removed; terminal.
    Removed,
}

impl ObjectState {
    /// Returns `true` for [`ObjectState::Active`] and [`ObjectState::Inactive`].
    #[must_use]
    pub const fn exists(self) -> bool {
        matches!(self, Self::Active | Self::Inactive)
    }
}

/// Event types driving the lifecycle of one aggregate type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateEvents {
    /// Events that create the object.
    pub added: Vec<String>,
    /// Events that reactivate the object.
    pub reactivated: Vec<String>,
    /// Events that deactivate the object.
    pub deactivated: Vec<String>,
    /// Events that remove the object.
    pub removed: Vec<String>,
}

impl StateEvents {
    /// No lifecycle events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a creation event type.
    #[must_use]
    pub fn added(mut self, event_type: impl Into<String>) -> Self {
        self.added.push(event_type.into());
        self
    }

    /// Add a reactivation event type.
    #[must_use]
    pub fn reactivated(mut self, event_type: impl Into<String>) -> Self {
        self.reactivated.push(event_type.into());
        self
    }

    /// Add a deactivation event type.
    #[must_use]
    pub fn deactivated(mut self, event_type: impl Into<String>) -> Self {
        self.deactivated.push(event_type.into());
        self
    }

    /// Add a removal event type.
    #[must_use]
    pub fn removed(mut self, event_type: impl Into<String>) -> Self {
        self.removed.push(event_type.into());
        self
    }
}

/// Handlers moving an [`ObjectState`] through its lifecycle.
///
/// Removal is terminal: later lifecycle events leave a removed object removed.
#[must_use]
pub fn state_handlers(events: &StateEvents) -> HandlerTable<ObjectState> {
    let transitions = [
        (&events.added, ObjectState::Active),
        (&events.reactivated, ObjectState::Active),
        (&events.deactivated, ObjectState::Inactive),
        (&events.removed, ObjectState::Removed),
    ];

    let mut table = HandlerTable::new();
    for (event_types, next) in transitions {
        for event_type in event_types {
            table = table.on_raw(
                aggregate_type_of(event_type),
                event_type.clone(),
                move |state: &mut ObjectState, _: &StorageEvent| {
                    if *state != ObjectState::Removed {
                        *state = next;
                    }
                    Ok(())
                },
            );
        }
    }
    table
}
