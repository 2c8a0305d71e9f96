//! Watermark-gated reduction.
//!
//! A [`Projection`] pairs domain state with a [`Watermark`], the position of
//! the last event it applied. Reduction skips every event at or below the
//! watermark, which makes replaying a batch a no-op:
//!
//! ```text
//! for event in batch (ascending position):
//!     if !should_reduce(event)        -> skip (stale or out of scope)
//!     if no handler for event         -> skip, watermark unchanged
//!     apply handler chain to a copy   -> error aborts the batch, state untouched
//!     commit copy, watermark = event.position
//! ```

use crate::error::Result;
use crate::handler::HandlerTable;
use eventstore_core::event::StorageEvent;
use eventstore_core::position::GlobalPosition;
use serde::{Deserialize, Serialize};

/// Last applied position, optionally bound to one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Position of the last applied event.
    pub position: GlobalPosition,
    /// Instance the projection is scoped to; empty for all instances.
    pub instance: String,
}

impl Watermark {
    /// A zero watermark scoped to `instance`.
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            position: GlobalPosition::ZERO,
            instance: instance.into(),
        }
    }

    /// Returns `true` if `event` is in scope and newer than the watermark.
    #[must_use]
    pub fn should_reduce(&self, event: &StorageEvent) -> bool {
        (self.instance.is_empty() || self.instance == event.aggregate.instance)
            && self.position.is_less(&event.position)
    }
}

/// Domain state plus the watermark guarding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection<S> {
    watermark: Watermark,
    state: S,
}

impl<S> Projection<S> {
    /// A projection over every instance.
    pub fn new(state: S) -> Self {
        Self {
            watermark: Watermark::default(),
            state,
        }
    }

    /// A projection that ignores events of other instances.
    pub fn scoped(instance: impl Into<String>, state: S) -> Self {
        Self {
            watermark: Watermark::new(instance),
            state,
        }
    }

    /// The current watermark.
    pub const fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// Position of the last applied event.
    pub const fn position(&self) -> GlobalPosition {
        self.watermark.position
    }

    /// The reduced state.
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Consume the projection, keeping the state.
    pub fn into_state(self) -> S {
        self.state
    }

    /// Returns `true` if the event would be considered by [`reduce`](Self::reduce).
    pub fn should_reduce(&self, event: &StorageEvent) -> bool {
        self.watermark.should_reduce(event)
    }
}

impl<S: Clone + 'static> Projection<S> {
    /// Apply a batch in ascending position order.
    ///
    /// Returns the number of applied events.
    ///
    /// # Errors
    ///
    /// The first handler error. Events before the failing one stay applied
    /// and the watermark stays at the last of them.
    pub fn reduce<'a, I>(&mut self, table: &HandlerTable<S>, events: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a StorageEvent>,
    {
        let mut batch: Vec<&StorageEvent> = events.into_iter().collect();
        batch.sort_by(|a, b| a.position.cmp(&b.position));

        let mut applied = 0;
        for event in batch {
            if self.reduce_one(table, event)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply one event; `Ok(false)` if it was skipped.
    ///
    /// # Errors
    ///
    /// The handler error; neither state nor watermark change, even if earlier
    /// handlers of a merged chain succeeded.
    pub fn reduce_one(&mut self, table: &HandlerTable<S>, event: &StorageEvent) -> Result<bool> {
        if !self.should_reduce(event) {
            tracing::trace!(
                event_type = %event.event_type,
                position = %event.position,
                watermark = %self.watermark.position,
                "Skipping event at or below watermark"
            );
            return Ok(false);
        }
        if !table.handles_event(event) {
            return Ok(false);
        }
        let mut staged = self.state.clone();
        table.apply(&mut staged, event)?;
        self.state = staged;
        self.watermark.position = event.position;
        Ok(true)
    }
}

impl<S: Default> Default for Projection<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProjectionError;
    use eventstore_core::Utc;
    use eventstore_core::aggregate::Aggregate;
    use eventstore_core::event::Payload;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn event(instance: &str, event_type: &str, position: GlobalPosition) -> StorageEvent {
        StorageEvent {
            creator: "user-1".into(),
            event_type: event_type.into(),
            revision: 1,
            payload: Payload::empty(),
            aggregate: Aggregate::new(instance, "org", "org-1"),
            created_at: Utc::now(),
            position,
            sequence: 1,
        }
    }

    fn counter() -> HandlerTable<Vec<GlobalPosition>> {
        HandlerTable::new()
            .on_raw("org", "org.added", |seen: &mut Vec<GlobalPosition>, e: &StorageEvent| {
                seen.push(e.position);
                Ok(())
            })
            .on_raw("org", "org.changed", |seen: &mut Vec<GlobalPosition>, e: &StorageEvent| {
                seen.push(e.position);
                Ok(())
            })
            .on_raw("org", "org.broken", |_: &mut Vec<GlobalPosition>, e: &StorageEvent| {
                Err(ProjectionError::Decode {
                    event_type: e.event_type.clone(),
                    position: e.position,
                    reason: "corrupt".into(),
                })
            })
    }

    #[test]
    fn reduces_in_position_order() {
        let table = counter();
        let mut projection = Projection::new(Vec::new());
        let events = vec![
            event("i", "org.changed", GlobalPosition::new(2.0, 0)),
            event("i", "org.added", GlobalPosition::new(1.0, 1)),
            event("i", "org.added", GlobalPosition::new(1.0, 0)),
        ];

        assert_eq!(projection.reduce(&table, &events).unwrap(), 3);
        assert_eq!(
            projection.state(),
            &vec![
                GlobalPosition::new(1.0, 0),
                GlobalPosition::new(1.0, 1),
                GlobalPosition::new(2.0, 0)
            ]
        );
        assert_eq!(projection.position(), GlobalPosition::new(2.0, 0));
    }

    #[test]
    fn unhandled_events_do_not_move_watermark() {
        let table = counter();
        let mut projection = Projection::new(Vec::new());
        let events = vec![
            event("i", "org.added", GlobalPosition::new(1.0, 0)),
            event("i", "org.unknown", GlobalPosition::new(5.0, 0)),
        ];
        assert_eq!(projection.reduce(&table, &events).unwrap(), 1);
        assert_eq!(projection.position(), GlobalPosition::new(1.0, 0));
    }

    #[test]
    fn failing_handler_keeps_watermark_at_last_applied() {
        let table = counter();
        let mut projection = Projection::new(Vec::new());
        let events = vec![
            event("i", "org.added", GlobalPosition::new(1.0, 0)),
            event("i", "org.broken", GlobalPosition::new(2.0, 0)),
            event("i", "org.changed", GlobalPosition::new(3.0, 0)),
        ];

        assert!(projection.reduce(&table, &events).is_err());
        assert_eq!(projection.position(), GlobalPosition::new(1.0, 0));
        assert_eq!(projection.state().len(), 1);
    }

    #[test]
    fn failing_chain_leaves_state_untouched() {
        let failed = Arc::new(AtomicBool::new(false));
        let failed_once = Arc::clone(&failed);
        let table = HandlerTable::new()
            .on_raw("org", "org.added", |count: &mut u32, _: &StorageEvent| {
                *count += 1;
                Ok(())
            })
            .merge(HandlerTable::new().on_raw("org", "org.added", move |_: &mut u32, e: &StorageEvent| {
                if !failed_once.swap(true, Ordering::SeqCst) {
                    return Err(ProjectionError::Decode {
                        event_type: e.event_type.clone(),
                        position: e.position,
                        reason: "transient".into(),
                    });
                }
                Ok(())
            }));
        let added = event("i", "org.added", GlobalPosition::new(1.0, 0));
        let mut projection = Projection::new(0u32);

        assert!(projection.reduce_one(&table, &added).is_err());
        assert_eq!(*projection.state(), 0);
        assert!(projection.position().is_zero());

        assert!(projection.reduce_one(&table, &added).unwrap());
        assert_eq!(*projection.state(), 1);
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn scoped_projection_ignores_other_instances() {
        let table = counter();
        let mut projection = Projection::scoped("inst-1", Vec::new());
        let events = vec![
            event("inst-2", "org.added", GlobalPosition::new(1.0, 0)),
            event("inst-1", "org.added", GlobalPosition::new(2.0, 0)),
        ];
        assert_eq!(projection.reduce(&table, &events).unwrap(), 1);
        assert_eq!(projection.watermark().instance, "inst-1");
    }

    proptest! {
        #[test]
        fn replaying_a_batch_is_a_no_op(
            raw in prop::collection::vec((0u32..50, 0u32..4, prop::bool::ANY), 0..40)
        ) {
            let events: Vec<StorageEvent> = raw
                .iter()
                .map(|(p, o, added)| {
                    let event_type = if *added { "org.added" } else { "org.changed" };
                    event("i", event_type, GlobalPosition::new(f64::from(*p) + 1.0, *o))
                })
                .collect();
            let table = counter();

            let mut once = Projection::new(Vec::new());
            once.reduce(&table, &events).unwrap();
            let before = once.position();

            let mut twice = once.clone();
            prop_assert_eq!(twice.reduce(&table, &events).unwrap(), 0);
            prop_assert_eq!(&twice, &once);
            prop_assert!(before <= twice.position());
        }
    }
}
