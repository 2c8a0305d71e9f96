//! Ergonomic testing utilities for handler tables
//!
//! This module provides a fluent API for testing projections with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ProjectionTest is the natural name

use crate::mocks::test_clock;
use eventstore_core::aggregate::Aggregate;
use eventstore_core::environment::Clock;
use eventstore_core::event::{EventPayload, Payload, StorageEvent};
use eventstore_core::position::GlobalPosition;
use eventstore_projections::error::ProjectionError;
use eventstore_projections::{HandlerTable, Projection};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&Projection<S>)>;

/// Type alias for error assertion functions
type ErrorAssertion = Box<dyn FnOnce(&ProjectionError)>;

/// Fluent API for testing handler tables with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use eventstore_testing::ProjectionTest;
///
/// ProjectionTest::new(org_handlers())
///     .given_state(OrgView::default())
///     .given_events(vec![added])
///     .when_event(changed)
///     .then_applied(1)
///     .then_state(|org| {
///         assert_eq!(org.name, "Acme Corp");
///     })
///     .run();
/// ```
pub struct ProjectionTest<S> {
    table: HandlerTable<S>,
    initial: Option<Projection<S>>,
    history: Vec<StorageEvent>,
    events: Vec<StorageEvent>,
    expected_applied: Option<usize>,
    state_assertions: Vec<StateAssertion<S>>,
    error_assertion: Option<ErrorAssertion>,
}

impl<S: Clone + 'static> ProjectionTest<S> {
    /// Create a new projection test over the given handlers
    #[must_use]
    pub const fn new(table: HandlerTable<S>) -> Self {
        Self {
            table,
            initial: None,
            history: Vec::new(),
            events: Vec::new(),
            expected_applied: None,
            state_assertions: Vec::new(),
            error_assertion: None,
        }
    }

    /// Start from a fresh projection of `state` (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial = Some(Projection::new(state));
        self
    }

    /// Start from an existing projection, watermark included (Given)
    #[must_use]
    pub fn given_projection(mut self, projection: Projection<S>) -> Self {
        self.initial = Some(projection);
        self
    }

    /// Events reduced before the events under test (Given)
    #[must_use]
    pub fn given_events(mut self, events: Vec<StorageEvent>) -> Self {
        self.history.extend(events);
        self
    }

    /// Add an event under test (When)
    #[must_use]
    pub fn when_event(mut self, event: StorageEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Add events under test (When)
    #[must_use]
    pub fn when_events(mut self, events: Vec<StorageEvent>) -> Self {
        self.events.extend(events);
        self
    }

    /// Expect this many events under test to be applied (Then)
    #[must_use]
    pub const fn then_applied(mut self, applied: usize) -> Self {
        self.expected_applied = Some(applied);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions
            .push(Box::new(move |projection: &Projection<S>| assertion(projection.state())));
        self
    }

    /// Add an assertion about the resulting projection (Then)
    #[must_use]
    pub fn then_projection<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&Projection<S>) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Expect the events under test to fail (Then)
    #[must_use]
    pub fn then_error<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&ProjectionError) + 'static,
    {
        self.error_assertion = Some(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if no initial state is set, if the history fails to reduce,
    /// or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut projection = self
            .initial
            .expect("Initial state must be set with given_state() or given_projection()");

        projection
            .reduce(&self.table, &self.history)
            .expect("given events must reduce");

        let result = projection.reduce(&self.table, &self.events);

        match (result, self.error_assertion) {
            (Err(error), Some(assertion)) => assertion(&error),
            (Err(error), None) => panic!("Expected events to reduce, but got: {error}"),
            (Ok(applied), Some(_)) => panic!("Expected an error, but {applied} events were applied"),
            (Ok(applied), None) => {
                if let Some(expected) = self.expected_applied {
                    assert_eq!(applied, expected, "Expected {expected} applied events, but found {applied}");
                }
            }
        }

        for assertion in self.state_assertions {
            assertion(&projection);
        }
    }
}

/// Build a stored event with a typed payload, stamped by [`test_clock`].
///
/// # Panics
///
/// Panics if the payload cannot be encoded.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_event<P: EventPayload>(
    aggregate: &Aggregate,
    sequence: u32,
    position: GlobalPosition,
    payload: &P,
) -> StorageEvent {
    StorageEvent {
        creator: "test-user".to_string(),
        event_type: P::EVENT_TYPE.to_string(),
        revision: P::REVISION,
        payload: Payload::encode(payload).expect("test payload must encode"),
        aggregate: aggregate.clone(),
        created_at: test_clock().now(),
        position,
        sequence,
    }
}

/// Build a stored event without payload.
#[must_use]
pub fn test_raw_event(
    aggregate: &Aggregate,
    event_type: &str,
    sequence: u32,
    position: GlobalPosition,
) -> StorageEvent {
    StorageEvent {
        creator: "test-user".to_string(),
        event_type: event_type.to_string(),
        revision: 1,
        payload: Payload::empty(),
        aggregate: aggregate.clone(),
        created_at: test_clock().now(),
        position,
        sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::error::EventStoreError;

    fn counter() -> HandlerTable<i32> {
        HandlerTable::new()
            .on_raw("counter", "counter.incremented", |count: &mut i32, _: &StorageEvent| {
                *count += 1;
                Ok(())
            })
            .on_raw("counter", "counter.failed", |_: &mut i32, _: &StorageEvent| {
                Err(EventStoreError::DatabaseError("boom".to_string()).into())
            })
    }

    fn incremented(sequence: u32, position: f64) -> StorageEvent {
        test_raw_event(
            &Aggregate::new("inst-1", "counter", "c-1"),
            "counter.incremented",
            sequence,
            GlobalPosition::new(position, 0),
        )
    }

    #[test]
    fn applies_events_after_history() {
        ProjectionTest::new(counter())
            .given_state(0)
            .given_events(vec![incremented(1, 1.0)])
            .when_event(incremented(2, 2.0))
            .then_applied(1)
            .then_state(|count| assert_eq!(*count, 2))
            .then_projection(|p| assert_eq!(p.position(), GlobalPosition::new(2.0, 0)))
            .run();
    }

    #[test]
    fn replayed_events_are_skipped() {
        ProjectionTest::new(counter())
            .given_state(0)
            .given_events(vec![incremented(1, 1.0), incremented(2, 2.0)])
            .when_events(vec![incremented(1, 1.0), incremented(2, 2.0)])
            .then_applied(0)
            .then_state(|count| assert_eq!(*count, 2))
            .run();
    }

    #[test]
    fn handler_errors_surface() {
        ProjectionTest::new(counter())
            .given_state(0)
            .when_event(test_raw_event(
                &Aggregate::new("inst-1", "counter", "c-1"),
                "counter.failed",
                1,
                GlobalPosition::new(1.0, 0),
            ))
            .then_error(|e| assert!(e.to_string().contains("boom")))
            .then_projection(|p| assert!(p.position().is_zero()))
            .run();
    }
}
