//! Push intents: what one atomic append consists of.
//!
//! A [`PushIntent`] groups the commands of one or more aggregates, each under a
//! [`CurrentSequence`] check, with the unique constraints they change and the
//! [`Precondition`]s that must hold on already-durable events. Backends execute
//! the whole intent in one transaction; the planning steps that do not need
//! storage live here so every backend applies identical rules.

use crate::aggregate::Aggregate;
use crate::error::{EventStoreError, Result, codes};
use crate::event::{Command, EventPayload, StorageEvent, validate_event_type};
use crate::position::GlobalPosition;
use crate::query::Query;
use crate::sequence::CurrentSequence;
use crate::unique::{
    UNIQUE_AGGREGATE_TYPE, UniqueAction, UniqueConstraint, UniqueConstraintAdded,
    active_reservations, release_command,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Caller supplied check over the result of a precondition query.
pub type Validator = Arc<dyn Fn(&[StorageEvent]) -> Result<()> + Send + Sync>;

/// Read-before-write check evaluated inside the push transaction.
///
/// ```
/// use eventstore_core::error::{EventStoreError, codes};
/// use eventstore_core::push::Precondition;
/// use eventstore_core::query::{AggregateFilter, Filter, Query};
///
/// let org_exists = Precondition::new(
///     Query::new("inst-1").filter(Filter::new().aggregate(AggregateFilter::new("org").id("org-1"))),
///     |events| {
///         if events.is_empty() {
///             return Err(EventStoreError::precondition_failed(
///                 codes::PRECONDITION_FAILED,
///                 "org does not exist",
///             ));
///         }
///         Ok(())
///     },
/// );
/// assert!(org_exists.check(&[]).is_err());
/// ```
#[derive(Clone)]
pub struct Precondition {
    /// Read-only query run before appending.
    pub query: Query,
    validate: Validator,
}

impl Precondition {
    /// Pair a query with its validation function.
    pub fn new<F>(query: Query, validate: F) -> Self
    where
        F: Fn(&[StorageEvent]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            query,
            validate: Arc::new(validate),
        }
    }

    /// Run the validation function on the query result.
    ///
    /// # Errors
    ///
    /// Whatever the validation function returns.
    pub fn check(&self, events: &[StorageEvent]) -> Result<()> {
        (self.validate)(events)
    }
}

impl fmt::Debug for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Precondition")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// Commands for one aggregate plus its concurrency check.
#[derive(Debug, Clone)]
pub struct PushAggregate {
    /// Target stream.
    pub aggregate: Aggregate,
    /// Check against the stream's current sequence.
    pub current_sequence: CurrentSequence,
    /// Commands appended in order.
    pub commands: Vec<Command>,
    /// Unique constraints changed together with the commands.
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl PushAggregate {
    /// Append unconditionally to `aggregate`.
    #[must_use]
    pub const fn new(aggregate: Aggregate) -> Self {
        Self {
            aggregate,
            current_sequence: CurrentSequence::Ignore,
            commands: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    /// Set the concurrency check.
    #[must_use]
    pub const fn current_sequence(mut self, check: CurrentSequence) -> Self {
        self.current_sequence = check;
        self
    }

    /// Add a command.
    #[must_use]
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Add a unique constraint change.
    #[must_use]
    pub fn unique(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    fn validate(&self) -> Result<()> {
        self.aggregate.validate()?;
        if self.aggregate.instance.is_empty() && self.aggregate.aggregate_type != UNIQUE_AGGREGATE_TYPE {
            return Err(EventStoreError::invalid_argument(
                codes::INSTANCE_MISSING,
                format!("aggregate {} has no instance", self.aggregate),
            ));
        }
        if self.commands.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::COMMANDS_MISSING,
                format!("no commands for aggregate {}", self.aggregate),
            ));
        }
        for command in &self.commands {
            validate_event_type(&self.aggregate.aggregate_type, &command.event_type)?;
        }
        self.unique_constraints.iter().try_for_each(UniqueConstraint::validate)
    }
}

/// Everything appended by one atomic push.
#[derive(Debug, Clone, Default)]
pub struct PushIntent {
    /// Aggregates in append order.
    pub aggregates: Vec<PushAggregate>,
    /// Checks evaluated before appending.
    pub preconditions: Vec<Precondition>,
}

impl PushIntent {
    /// An empty intent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an aggregate's commands.
    #[must_use]
    pub fn aggregate(mut self, aggregate: PushAggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Add a precondition.
    #[must_use]
    pub fn precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    /// Check that the intent is well formed before it reaches storage.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidArgument`] for an empty intent, an
    /// aggregate without id, type, instance or commands, a command whose type
    /// is not prefixed by its aggregate type, or a malformed unique constraint.
    pub fn validate(&self) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::AGGREGATES_MISSING,
                "push without aggregates",
            ));
        }
        self.aggregates.iter().try_for_each(PushAggregate::validate)?;
        self.preconditions.iter().try_for_each(|p| p.query.validate())
    }

    /// Returns `true` if any aggregate changes unique constraints.
    #[must_use]
    pub fn has_unique_constraints(&self) -> bool {
        self.aggregates.iter().any(|a| !a.unique_constraints.is_empty())
    }

    /// Reservation aggregates touched by add/remove constraints.
    #[must_use]
    pub fn reservation_aggregates(&self) -> Vec<Aggregate> {
        let mut seen = Vec::new();
        for (aggregate, constraint) in self.constraints() {
            if constraint.action == UniqueAction::InstanceRemove {
                continue;
            }
            let reservation = constraint.reservation_aggregate(&aggregate.aggregate.instance);
            if !seen.contains(&reservation) {
                seen.push(reservation);
            }
        }
        seen
    }

    /// Instances whose reservations are released wholesale.
    #[must_use]
    pub fn removed_instances(&self) -> Vec<String> {
        let mut instances: Vec<String> = self
            .constraints()
            .filter(|(_, c)| c.action == UniqueAction::InstanceRemove)
            .map(|(a, _)| a.aggregate.instance.clone())
            .collect();
        instances.dedup();
        instances
    }

    /// Turn unique constraint changes into appends on reservation aggregates.
    ///
    /// `latest` holds the latest event type and sequence of every aggregate
    /// returned by [`reservation_aggregates`](Self::reservation_aggregates) that
    /// has events; `instance_reservations` holds the reservation events of every
    /// instance returned by [`removed_instances`](Self::removed_instances).
    ///
    /// Each reservation append is guarded by `Matches(latest sequence)`, so a
    /// concurrent push reserving the same key fails its concurrency check.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::UniqueConstraint`] when a key is already
    /// reserved or not reserved.
    pub fn unique_pushes(
        &self,
        latest: &HashMap<StreamKey, (String, u32)>,
        instance_reservations: &[StorageEvent],
    ) -> Result<Vec<PushAggregate>> {
        let mut planned: Vec<PushAggregate> = Vec::new();
        let mut state: HashMap<StreamKey, (String, u32)> = HashMap::new();

        for (aggregate, constraint) in self.constraints() {
            let creator = aggregate
                .commands
                .first()
                .map_or_else(String::new, |c| c.creator.clone());

            if constraint.action == UniqueAction::InstanceRemove {
                let instance = &aggregate.aggregate.instance;
                let events: Vec<StorageEvent> = instance_reservations
                    .iter()
                    .filter(|e| &e.aggregate.instance == instance)
                    .cloned()
                    .collect();
                // stored reservations plus the ones this push already touched
                let mut candidates = active_reservations(&events);
                for reservation in planned.iter().map(|p| &p.aggregate) {
                    let key = StreamKey::from(reservation);
                    if &reservation.instance == instance
                        && reservation.aggregate_type == UNIQUE_AGGREGATE_TYPE
                        && !candidates.iter().any(|(a, _)| StreamKey::from(a) == key)
                    {
                        candidates.push((reservation.clone(), 0));
                    }
                }
                candidates.sort_by(|a, b| a.0.id.cmp(&b.0.id));

                for (reservation, stored) in candidates {
                    let key = StreamKey::from(&reservation);
                    let (event_type, sequence) = state
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| (UniqueConstraintAdded::EVENT_TYPE.to_string(), stored));
                    if event_type != UniqueConstraintAdded::EVENT_TYPE {
                        continue;
                    }
                    let command = release_command(&creator, &reservation)?;
                    append_planned(&mut planned, &reservation, sequence, command.clone());
                    state.insert(key, (command.event_type, sequence + 1));
                }
                continue;
            }

            let reservation = constraint.reservation_aggregate(&aggregate.aggregate.instance);
            let key = StreamKey::from(&reservation);
            let current = state.get(&key).or_else(|| latest.get(&key)).cloned();
            let command =
                constraint.reservation_command(&creator, current.as_ref().map(|(t, _)| t.as_str()))?;
            let sequence = current.map_or(0, |(_, s)| s);
            append_planned(&mut planned, &reservation, sequence, command.clone());
            state.insert(key, (command.event_type, sequence + 1));
        }
        Ok(planned)
    }

    fn constraints(&self) -> impl Iterator<Item = (&PushAggregate, &UniqueConstraint)> {
        self.aggregates
            .iter()
            .flat_map(|a| a.unique_constraints.iter().map(move |c| (a, c)))
    }
}

fn append_planned(planned: &mut Vec<PushAggregate>, reservation: &Aggregate, sequence: u32, command: Command) {
    if let Some(existing) = planned.iter_mut().find(|p| &p.aggregate == reservation) {
        existing.commands.push(command);
    } else {
        planned.push(
            PushAggregate::new(reservation.clone())
                .current_sequence(CurrentSequence::Matches(sequence))
                .command(command),
        );
    }
}

/// Identity of one event stream, ignoring the owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Tenant.
    pub instance: String,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate id.
    pub id: String,
}

impl From<&Aggregate> for StreamKey {
    fn from(aggregate: &Aggregate) -> Self {
        Self {
            instance: aggregate.instance.clone(),
            aggregate_type: aggregate.aggregate_type.clone(),
            id: aggregate.id.clone(),
        }
    }
}

/// Check every concurrency condition and assign sequences and positions.
///
/// `sequences` holds the current sequence of each target stream (missing
/// streams are at 0). Every event of the push shares `position`; its rank in
/// the push becomes `in_position_order`. Streams listed more than once see the
/// sequence left by their earlier entries.
///
/// # Errors
///
/// Returns [`EventStoreError::ConcurrencyConflict`] for the first aggregate
/// whose check fails; nothing is produced in that case.
pub fn materialize(
    aggregates: &[PushAggregate],
    sequences: &HashMap<StreamKey, u32>,
    position: f64,
    created_at: DateTime<Utc>,
) -> Result<Vec<StorageEvent>> {
    let mut current: HashMap<StreamKey, u32> = HashMap::new();
    let mut events = Vec::new();
    let mut in_position_order = 0u32;

    for push in aggregates {
        let key = StreamKey::from(&push.aggregate);
        let actual = current
            .get(&key)
            .or_else(|| sequences.get(&key))
            .copied()
            .unwrap_or(0);
        if !push.current_sequence.check(actual) {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate: push.aggregate.to_string(),
                expected: push.current_sequence,
                actual,
            });
        }

        let mut sequence = actual;
        for command in &push.commands {
            sequence += 1;
            events.push(StorageEvent {
                creator: command.creator.clone(),
                event_type: command.event_type.clone(),
                revision: command.revision,
                payload: command.payload.clone(),
                aggregate: push.aggregate.clone(),
                created_at,
                position: GlobalPosition::new(position, in_position_order),
                sequence,
            });
            in_position_order += 1;
        }
        current.insert(key, sequence);
    }
    Ok(events)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::unique::UniqueConstraintRemoved;

    fn org(id: &str) -> Aggregate {
        Aggregate::new("inst-1", "org", id).with_owner(id)
    }

    fn added() -> Command {
        Command::raw("user-1", "org.added", 1, Payload::empty())
    }

    #[test]
    fn validate_rejects_incomplete_intents() {
        assert_eq!(
            PushIntent::new().validate().err().map(|e| e.code()),
            Some(codes::AGGREGATES_MISSING)
        );

        let no_commands = PushIntent::new().aggregate(PushAggregate::new(org("org-1")));
        assert_eq!(
            no_commands.validate().err().map(|e| e.code()),
            Some(codes::COMMANDS_MISSING)
        );

        let wrong_type = PushIntent::new().aggregate(
            PushAggregate::new(org("org-1")).command(Command::raw("u", "user.added", 1, Payload::empty())),
        );
        assert_eq!(
            wrong_type.validate().err().map(|e| e.code()),
            Some(codes::EVENT_TYPE_INVALID)
        );

        let no_instance = PushIntent::new()
            .aggregate(PushAggregate::new(Aggregate::new("", "org", "org-1")).command(added()));
        assert_eq!(
            no_instance.validate().err().map(|e| e.code()),
            Some(codes::INSTANCE_MISSING)
        );

        let ok = PushIntent::new().aggregate(PushAggregate::new(org("org-1")).command(added()));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn materialize_assigns_sequences_and_ranks() {
        let aggregates = vec![
            PushAggregate::new(org("org-1"))
                .current_sequence(CurrentSequence::Matches(0))
                .command(added())
                .command(Command::raw("user-1", "org.changed", 1, Payload::empty())),
            PushAggregate::new(org("org-2")).command(added()),
        ];
        let mut sequences = HashMap::new();
        sequences.insert(StreamKey::from(&org("org-2")), 4);

        let events = materialize(&aggregates, &sequences, 12.0, Utc::now()).unwrap();
        let summary: Vec<(&str, u32, u32)> = events
            .iter()
            .map(|e| (e.aggregate.id.as_str(), e.sequence, e.position.in_position_order))
            .collect();
        assert_eq!(summary, vec![("org-1", 1, 0), ("org-1", 2, 1), ("org-2", 5, 2)]);
        assert!(events.iter().all(|e| e.position.position == 12.0));
    }

    #[test]
    fn materialize_fails_whole_push_on_conflict() {
        let aggregates = vec![
            PushAggregate::new(org("org-1")).command(added()),
            PushAggregate::new(org("org-2"))
                .current_sequence(CurrentSequence::Matches(0))
                .command(added()),
        ];
        let mut sequences = HashMap::new();
        sequences.insert(StreamKey::from(&org("org-2")), 1);

        let err = materialize(&aggregates, &sequences, 1.0, Utc::now()).unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { actual: 1, .. }));
        assert!(err.is_precondition_failed());
    }

    #[test]
    fn repeated_stream_sees_earlier_entries() {
        let aggregates = vec![
            PushAggregate::new(org("org-1")).command(added()),
            PushAggregate::new(org("org-1"))
                .current_sequence(CurrentSequence::Matches(1))
                .command(added()),
        ];
        let events = materialize(&aggregates, &HashMap::new(), 1.0, Utc::now()).unwrap();
        assert_eq!(events[1].sequence, 2);
    }

    #[test]
    fn unique_pushes_guard_reservations_by_sequence() {
        let intent = PushIntent::new().aggregate(
            PushAggregate::new(org("org-1"))
                .command(added())
                .unique(UniqueConstraint::add("org_name", "acme", "Errors.Org.AlreadyExists")),
        );
        let reservation = intent.reservation_aggregates();
        assert_eq!(reservation.len(), 1);
        assert_eq!(reservation[0].id, "org_name:acme");

        let mut latest = HashMap::new();
        latest.insert(
            StreamKey::from(&reservation[0]),
            (UniqueConstraintRemoved::EVENT_TYPE.to_string(), 2),
        );
        let pushes = intent.unique_pushes(&latest, &[]).unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].current_sequence, CurrentSequence::Matches(2));
        assert_eq!(pushes[0].commands[0].event_type, UniqueConstraintAdded::EVENT_TYPE);
        assert_eq!(pushes[0].commands[0].creator, "user-1");

        latest.insert(
            StreamKey::from(&reservation[0]),
            (UniqueConstraintAdded::EVENT_TYPE.to_string(), 3),
        );
        let err = intent.unique_pushes(&latest, &[]).unwrap_err();
        assert_eq!(err.code(), codes::UNIQUE_ALREADY_EXISTS);
    }

    fn reserved(id: &str, sequence: u32) -> StorageEvent {
        StorageEvent {
            creator: "user-1".into(),
            event_type: UniqueConstraintAdded::EVENT_TYPE.into(),
            revision: 1,
            payload: Payload::empty(),
            aggregate: Aggregate::new("inst-1", UNIQUE_AGGREGATE_TYPE, id),
            created_at: Utc::now(),
            position: GlobalPosition::new(f64::from(sequence), 0),
            sequence,
        }
    }

    #[test]
    fn instance_removal_releases_keys_of_the_same_push() {
        let intent = PushIntent::new()
            .aggregate(
                PushAggregate::new(org("org-1"))
                    .command(added())
                    .unique(UniqueConstraint::add("org_name", "acme", ""))
                    .unique(UniqueConstraint::remove("org_name", "globex")),
            )
            .aggregate(
                PushAggregate::new(Aggregate::new("inst-1", "instance", "inst-1"))
                    .command(Command::raw("user-1", "instance.removed", 1, Payload::empty()))
                    .unique(UniqueConstraint::remove_instance()),
            );
        let stored = vec![reserved("org_name:globex", 3), reserved("org_name:initech", 1)];
        let mut latest = HashMap::new();
        latest.insert(
            StreamKey::from(&Aggregate::new("inst-1", UNIQUE_AGGREGATE_TYPE, "org_name:globex")),
            (UniqueConstraintAdded::EVENT_TYPE.to_string(), 3),
        );

        let pushes = intent.unique_pushes(&latest, &stored).unwrap();
        let summary: Vec<(&str, CurrentSequence, Vec<&str>)> = pushes
            .iter()
            .map(|p| {
                (
                    p.aggregate.id.as_str(),
                    p.current_sequence,
                    p.commands.iter().map(|c| c.event_type.as_str()).collect(),
                )
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                (
                    "org_name:acme",
                    CurrentSequence::Matches(0),
                    vec![UniqueConstraintAdded::EVENT_TYPE, UniqueConstraintRemoved::EVENT_TYPE]
                ),
                (
                    "org_name:globex",
                    CurrentSequence::Matches(3),
                    vec![UniqueConstraintRemoved::EVENT_TYPE]
                ),
                (
                    "org_name:initech",
                    CurrentSequence::Matches(1),
                    vec![UniqueConstraintRemoved::EVENT_TYPE]
                ),
            ]
        );
    }

    #[test]
    fn add_then_remove_in_one_push_chains_on_one_reservation() {
        let intent = PushIntent::new().aggregate(
            PushAggregate::new(org("org-1"))
                .command(added())
                .unique(UniqueConstraint::add("org_name", "acme", ""))
                .unique(UniqueConstraint::remove("org_name", "acme")),
        );
        let pushes = intent.unique_pushes(&HashMap::new(), &[]).unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].current_sequence, CurrentSequence::Matches(0));
        assert_eq!(pushes[0].commands.len(), 2);
    }
}
