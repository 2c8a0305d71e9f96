//! A small organization domain for tests.
//!
//! Orgs are added with a name that is unique per instance, renamed,
//! deactivated, reactivated and removed. [`OrgList`] projects them into
//! [`OrgView`]s and serves both list and object read models.

use eventstore_core::aggregate::Aggregate;
use eventstore_core::environment::IdGenerator;
use eventstore_core::error::Result;
use eventstore_core::event::{Command, EventPayload, StorageEvent};
use eventstore_core::push::{PushAggregate, PushIntent};
use eventstore_core::sequence::CurrentSequence;
use eventstore_core::unique::UniqueConstraint;
use eventstore_projections::{
    HandlerTable, ObjectState, Projection, ReadModel, ReadModelKey, StateEvents, state_handlers,
};
use serde::{Deserialize, Serialize};

/// Aggregate type of orgs.
pub const ORG: &str = "org";

/// Unique type of org names.
pub const ORG_NAME: &str = "org_name";

/// Error message of a taken org name.
pub const ORG_NAME_TAKEN: &str = "Errors.Org.AlreadyExists";

/// Creator of fixture commands.
pub const CREATOR: &str = "user-1";

/// `org.added`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgAdded {
    /// Display name.
    pub name: String,
}

impl EventPayload for OrgAdded {
    const EVENT_TYPE: &'static str = "org.added";
}

/// `org.changed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgChanged {
    /// New display name.
    pub name: String,
}

impl EventPayload for OrgChanged {
    const EVENT_TYPE: &'static str = "org.changed";
}

/// `org.deactivated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgDeactivated {}

impl EventPayload for OrgDeactivated {
    const EVENT_TYPE: &'static str = "org.deactivated";
}

/// `org.reactivated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgReactivated {}

impl EventPayload for OrgReactivated {
    const EVENT_TYPE: &'static str = "org.reactivated";
}

/// `org.removed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRemoved {
    /// Name released by the removal.
    pub name: String,
}

impl EventPayload for OrgRemoved {
    const EVENT_TYPE: &'static str = "org.removed";
}

/// The org aggregate; orgs own themselves.
#[must_use]
pub fn org(instance: &str, id: &str) -> Aggregate {
    Aggregate::new(instance, ORG, id).with_owner(id)
}

/// Add an org, reserving its name. Fails if the org exists.
///
/// # Errors
///
/// Payload encoding errors.
pub fn add_org(instance: &str, id: &str, name: &str) -> Result<PushIntent> {
    Ok(PushIntent::new().aggregate(
        PushAggregate::new(org(instance, id))
            .current_sequence(CurrentSequence::Matches(0))
            .command(Command::new(CREATOR, &OrgAdded { name: name.to_string() })?)
            .unique(UniqueConstraint::add(ORG_NAME, name, ORG_NAME_TAKEN)),
    ))
}

/// Add an org under an id minted by `ids`; returns the id with the intent.
///
/// # Errors
///
/// Payload encoding errors.
pub fn create_org(instance: &str, ids: &dyn IdGenerator, name: &str) -> Result<(String, PushIntent)> {
    let id = ids.next_id();
    let intent = add_org(instance, &id, name)?;
    Ok((id, intent))
}

/// Rename an org, moving its name reservation.
///
/// # Errors
///
/// Payload encoding errors.
pub fn rename_org(instance: &str, id: &str, old_name: &str, new_name: &str) -> Result<PushIntent> {
    Ok(PushIntent::new().aggregate(
        PushAggregate::new(org(instance, id))
            .current_sequence(CurrentSequence::AtLeast(1))
            .command(Command::new(CREATOR, &OrgChanged { name: new_name.to_string() })?)
            .unique(UniqueConstraint::remove(ORG_NAME, old_name))
            .unique(UniqueConstraint::add(ORG_NAME, new_name, ORG_NAME_TAKEN)),
    ))
}

/// Deactivate an org.
///
/// # Errors
///
/// Payload encoding errors.
pub fn deactivate_org(instance: &str, id: &str) -> Result<PushIntent> {
    Ok(PushIntent::new().aggregate(
        PushAggregate::new(org(instance, id))
            .current_sequence(CurrentSequence::AtLeast(1))
            .command(Command::new(CREATOR, &OrgDeactivated {})?),
    ))
}

/// Remove an org, releasing its name.
///
/// # Errors
///
/// Payload encoding errors.
pub fn remove_org(instance: &str, id: &str, name: &str) -> Result<PushIntent> {
    Ok(PushIntent::new().aggregate(
        PushAggregate::new(org(instance, id))
            .current_sequence(CurrentSequence::AtLeast(1))
            .command(Command::new(CREATOR, &OrgRemoved { name: name.to_string() })?)
            .unique(UniqueConstraint::remove(ORG_NAME, name)),
    ))
}

/// Projected org.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgView {
    /// Org id.
    pub id: String,
    /// Current display name.
    pub name: String,
    /// Number of renames.
    pub renames: u32,
    /// Lifecycle, tracked with its own watermark.
    pub state: Projection<ObjectState>,
}

/// Lifecycle events of orgs.
#[must_use]
pub fn org_state_events() -> StateEvents {
    StateEvents::new()
        .added(OrgAdded::EVENT_TYPE)
        .deactivated(OrgDeactivated::EVENT_TYPE)
        .reactivated(OrgReactivated::EVENT_TYPE)
        .removed(OrgRemoved::EVENT_TYPE)
}

/// Handlers projecting org events into an [`OrgView`].
#[must_use]
pub fn org_handlers() -> HandlerTable<OrgView> {
    HandlerTable::<OrgView>::new()
        .on::<OrgAdded, _>(|view, event| {
            view.id.clone_from(&event.storage.aggregate.id);
            view.name.clone_from(&event.payload.name);
            Ok(())
        })
        .on::<OrgChanged, _>(|view, event| {
            view.name.clone_from(&event.payload.name);
            view.renames += 1;
            Ok(())
        })
        .embed(state_handlers(&org_state_events()), |view| &mut view.state)
}

/// Read model of orgs, keyed by org id.
pub struct OrgList {
    handlers: HandlerTable<OrgView>,
}

impl OrgList {
    /// Create the model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: org_handlers(),
        }
    }
}

impl Default for OrgList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModel for OrgList {
    type State = OrgView;

    fn name(&self) -> &'static str {
        "org_list"
    }

    fn handlers(&self) -> &HandlerTable<OrgView> {
        &self.handlers
    }

    fn init(&self, key: &ReadModelKey) -> OrgView {
        OrgView {
            id: key.id.clone(),
            ..OrgView::default()
        }
    }

    fn creates(&self, event: &StorageEvent) -> bool {
        event.is::<OrgAdded>()
    }

    fn removes(&self, event: &StorageEvent) -> bool {
        event.is::<OrgRemoved>()
    }
}
