//! Push pipeline scenarios against the in-memory store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use eventstore_core::aggregate::Aggregate;
use eventstore_core::error::{EventStoreError, codes};
use eventstore_core::event::{Command, Payload};
use eventstore_core::position::GlobalPosition;
use eventstore_core::push::{Precondition, PushAggregate, PushIntent};
use eventstore_core::query::{AggregateFilter, EventFilter, Filter, Query};
use eventstore_core::sequence::CurrentSequence;
use eventstore_core::store::EventStore;
use eventstore_core::unique::{UNIQUE_AGGREGATE_TYPE, UniqueConstraint};
use eventstore_testing::{InMemoryEventStore, SequentialIdGenerator};
use eventstore_testing::fixtures::{self, ORG, OrgAdded};
use futures::StreamExt;
use std::sync::Arc;

fn raw(event_type: &str) -> Command {
    Command::raw(fixtures::CREATOR, event_type, 1, Payload::empty())
}

fn org_exists(instance: &str, id: &str) -> Precondition {
    let query = Query::new(instance).filter(
        Filter::new().aggregate(
            AggregateFilter::new(ORG)
                .id(id)
                .event(EventFilter::new().event_type("org.added")),
        ),
    );
    Precondition::new(query, |events| {
        if events.is_empty() {
            return Err(EventStoreError::precondition_failed(
                codes::PRECONDITION_FAILED,
                "org does not exist",
            ));
        }
        Ok(())
    })
}

#[tokio::test]
async fn push_assigns_sequences_and_shared_position() {
    let store = InMemoryEventStore::new();

    let events = store
        .push(
            PushIntent::new()
                .aggregate(
                    PushAggregate::new(fixtures::org("inst-1", "org-1"))
                        .command(raw("org.added"))
                        .command(raw("org.changed")),
                )
                .aggregate(PushAggregate::new(Aggregate::new("inst-1", "user", "user-1")).command(raw("user.added"))),
        )
        .await
        .unwrap();

    let sequences: Vec<u32> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 1]);
    assert!(events.iter().all(|e| e.position.position == 1.0));
    let ranks: Vec<u32> = events.iter().map(|e| e.position.in_position_order).collect();
    assert_eq!(ranks, vec![0, 1, 2]);
}

#[tokio::test]
async fn failed_check_appends_nothing() {
    let store = InMemoryEventStore::new();
    store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    let before = store.len().unwrap();

    let result = store
        .push(
            PushIntent::new()
                .aggregate(PushAggregate::new(fixtures::org("inst-1", "org-2")).command(raw("org.added")))
                .aggregate(
                    PushAggregate::new(fixtures::org("inst-1", "org-1"))
                        .current_sequence(CurrentSequence::Matches(5))
                        .command(raw("org.changed")),
                ),
        )
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { expected: CurrentSequence::Matches(5), actual: 1, .. })
    ));
    assert_eq!(store.len().unwrap(), before);
}

#[tokio::test]
async fn concurrent_creates_have_one_winner() {
    let store = Arc::new(InMemoryEventStore::new());

    let pushes = (0..8).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .push(
                    PushIntent::new().aggregate(
                        PushAggregate::new(fixtures::org("inst-1", "org-1"))
                            .current_sequence(CurrentSequence::Matches(0))
                            .command(raw("org.added")),
                    ),
                )
                .await
        })
    });
    let results = futures::future::join_all(pushes).await;

    let winners = results.iter().filter(|r| r.as_ref().is_ok_and(Result::is_ok)).count();
    assert_eq!(winners, 1);
    assert_eq!(store.len().unwrap(), 1);
}

#[tokio::test]
async fn unique_names_round_trip() {
    let store = InMemoryEventStore::new();

    let added = store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(added[1].aggregate.aggregate_type, UNIQUE_AGGREGATE_TYPE);
    assert_eq!(added[1].aggregate.id, "org_name:Acme");

    let taken = store.push(fixtures::add_org("inst-1", "org-2", "Acme").unwrap()).await.err().unwrap();
    assert_eq!(taken.code(), codes::UNIQUE_ALREADY_EXISTS);
    assert!(taken.to_string().contains(fixtures::ORG_NAME_TAKEN));

    // other instances have their own names
    store.push(fixtures::add_org("inst-2", "org-2", "Acme").unwrap()).await.unwrap();

    store.push(fixtures::remove_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    store.push(fixtures::add_org("inst-1", "org-3", "Acme").unwrap()).await.unwrap();

    let reservations = store
        .filter(Query::new("inst-1").filter(Filter::new().aggregate(AggregateFilter::new(UNIQUE_AGGREGATE_TYPE).id("org_name:Acme"))))
        .await
        .unwrap();
    let types: Vec<&str> = reservations.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["unique_constraint.added", "unique_constraint.removed", "unique_constraint.added"]
    );
}

#[tokio::test]
async fn minted_ids_address_their_orgs() {
    let store = InMemoryEventStore::new();
    let ids = SequentialIdGenerator::new("org");

    let (acme, intent) = fixtures::create_org("inst-1", &ids, "Acme").unwrap();
    store.push(intent).await.unwrap();
    let (initech, intent) = fixtures::create_org("inst-1", &ids, "Initech").unwrap();
    store.push(intent).await.unwrap();
    assert_eq!((acme.as_str(), initech.as_str()), ("org-1", "org-2"));

    let events = store
        .filter(Query::new("inst-1").filter(Filter::new().aggregate(AggregateFilter::new(ORG).id(initech))))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload::<OrgAdded>().unwrap().name, "Initech");
}

#[tokio::test]
async fn releasing_a_free_name_fails() {
    let store = InMemoryEventStore::new();
    store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();

    let err = store
        .push(fixtures::rename_org("inst-1", "org-1", "Initech", "Globex").unwrap())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), codes::UNIQUE_NOT_FOUND);
    assert!(err.is_precondition_failed());
    assert_eq!(store.len().unwrap(), 2);
}

#[tokio::test]
async fn global_constraints_span_instances() {
    let store = InMemoryEventStore::new();
    let user = |instance: &str| {
        PushIntent::new().aggregate(
            PushAggregate::new(Aggregate::new(instance, "user", "user-1"))
                .command(raw("user.added"))
                .unique(UniqueConstraint::add_global("username", "alice", "Errors.User.AlreadyExists")),
        )
    };

    store.push(user("inst-1")).await.unwrap();
    let err = store.push(user("inst-2")).await.err().unwrap();
    assert_eq!(err.code(), codes::UNIQUE_ALREADY_EXISTS);
}

#[tokio::test]
async fn instance_removal_releases_every_name() {
    let store = InMemoryEventStore::new();
    store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    store.push(fixtures::add_org("inst-1", "org-2", "Initech").unwrap()).await.unwrap();
    store.push(fixtures::add_org("inst-2", "org-3", "Acme").unwrap()).await.unwrap();

    let released = store
        .push(
            PushIntent::new().aggregate(
                PushAggregate::new(Aggregate::new("inst-1", "instance", "inst-1"))
                    .command(raw("instance.removed"))
                    .unique(UniqueConstraint::remove_instance()),
            ),
        )
        .await
        .unwrap();

    let releases: Vec<&str> = released
        .iter()
        .filter(|e| e.event_type == "unique_constraint.removed")
        .map(|e| e.aggregate.id.as_str())
        .collect();
    assert_eq!(releases, vec!["org_name:Acme", "org_name:Initech"]);

    store.push(fixtures::add_org("inst-1", "org-4", "Acme").unwrap()).await.unwrap();
    let err = store.push(fixtures::add_org("inst-2", "org-5", "Acme").unwrap()).await.err().unwrap();
    assert_eq!(err.code(), codes::UNIQUE_ALREADY_EXISTS);
}

#[tokio::test]
async fn preconditions_guard_pushes() {
    let store = InMemoryEventStore::new();
    let grant = || {
        PushIntent::new()
            .aggregate(PushAggregate::new(Aggregate::new("inst-1", "user", "user-1")).command(raw("user.grant.added")))
            .precondition(org_exists("inst-1", "org-1"))
    };

    let err = store.push(grant()).await.err().unwrap();
    assert_eq!(err.code(), codes::PRECONDITION_FAILED);
    assert!(store.is_empty().unwrap());

    store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    store.push(grant()).await.unwrap();
}

#[tokio::test]
async fn cursor_resumes_inside_a_push() {
    let store = InMemoryEventStore::new();
    let mut batch = PushAggregate::new(fixtures::org("inst-1", "org-1")).command(raw("org.added"));
    for _ in 0..5 {
        batch = batch.command(raw("org.changed"));
    }
    store.push(PushIntent::new().aggregate(batch)).await.unwrap();
    store.push(fixtures::deactivate_org("inst-1", "org-1").unwrap()).await.unwrap();

    let events = store
        .filter(Query::new("inst-1").after(GlobalPosition::new(1.0, 4)))
        .await
        .unwrap();

    let positions: Vec<GlobalPosition> = events.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![GlobalPosition::new(1.0, 5), GlobalPosition::new(2.0, 0)]);
}

#[tokio::test]
async fn queries_combine_filters() {
    let store = InMemoryEventStore::new();
    store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    store
        .push(PushIntent::new().aggregate(PushAggregate::new(Aggregate::new("inst-1", "user", "user-1")).command(raw("user.added"))))
        .await
        .unwrap();
    store.push(fixtures::add_org("inst-2", "org-2", "Initech").unwrap()).await.unwrap();

    let query = Query::new("inst-1")
        .filter(Filter::new().aggregate(AggregateFilter::new(ORG)))
        .filter(Filter::new().aggregate(AggregateFilter::new("user")))
        .filter(Filter::new().aggregate(AggregateFilter::new(ORG).id("org-1")));
    let events = store.filter(query.clone()).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["org.added", "user.added"]);

    let newest = store.filter(query.descending().limit(1)).await.unwrap();
    assert_eq!(newest[0].event_type, "user.added");

    let typed = store
        .filter(Query::all_instances().filter(Filter::new().aggregate(AggregateFilter::new(ORG))))
        .await
        .unwrap();
    let names: Vec<String> = typed.iter().map(|e| e.payload::<OrgAdded>().unwrap().name).collect();
    assert_eq!(names, vec!["Acme", "Initech"]);
}

#[tokio::test]
async fn filter_existing_requires_events() {
    let store = InMemoryEventStore::new();
    let err = store.filter_existing(Query::new("inst-1")).await.err().unwrap();
    assert!(err.is_not_found());
    assert_eq!(err.code(), codes::EVENTS_NOT_FOUND);
}

#[tokio::test]
async fn subscribers_receive_committed_positions() {
    let store = InMemoryEventStore::new();
    let mut positions = store.subscribe().await.unwrap();

    let pushed = store.push(fixtures::add_org("inst-1", "org-1", "Acme").unwrap()).await.unwrap();
    let notified = tokio::time::timeout(std::time::Duration::from_secs(1), positions.next())
        .await
        .expect("notification in time");

    assert_eq!(notified, pushed.last().map(|e| e.position));
}
