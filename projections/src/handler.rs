//! Reducer dispatch tables.
//!
//! A [`HandlerTable`] maps `(aggregate type, event type)` to an ordered chain
//! of handlers. Tables compose: [`merge`](HandlerTable::merge) folds chains
//! together so both effects survive, [`merge_overriding`](HandlerTable::merge_overriding)
//! and [`override_with`](HandlerTable::override_with) replace them when that is
//! the intent.

use crate::error::{ProjectionError, Result};
use crate::projection::Projection;
use eventstore_core::event::{Event, EventPayload, StorageEvent, aggregate_type_of};
use eventstore_core::query::{AggregateFilter, EventFilter};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A state mutation for one event.
pub type Handler<S> = Arc<dyn Fn(&mut S, &StorageEvent) -> Result<()> + Send + Sync>;

/// Dispatch key of a handler chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    /// Aggregate type of the event.
    pub aggregate_type: String,
    /// Event type.
    pub event_type: String,
}

impl HandlerKey {
    /// Build a key.
    #[must_use]
    pub fn new(aggregate_type: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
        }
    }

    fn of(event: &StorageEvent) -> Self {
        Self::new(event.aggregate.aggregate_type.clone(), event.event_type.clone())
    }
}

/// `(aggregate type, event type) -> [handler]` dispatch table.
///
/// # Example
///
/// ```
/// use eventstore_core::event::EventPayload;
/// use eventstore_projections::handler::HandlerTable;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrgAdded {
///     name: String,
/// }
///
/// impl EventPayload for OrgAdded {
///     const EVENT_TYPE: &'static str = "org.added";
/// }
///
/// #[derive(Default)]
/// struct OrgName(String);
///
/// let table = HandlerTable::<OrgName>::new().on::<OrgAdded, _>(|state, event| {
///     state.0.clone_from(&event.payload.name);
///     Ok(())
/// });
/// assert!(table.handles("org", "org.added"));
/// ```
pub struct HandlerTable<S> {
    handlers: HashMap<HandlerKey, SmallVec<[Handler<S>; 1]>>,
}

impl<S: 'static> HandlerTable<S> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler on raw events, chained after existing ones.
    #[must_use]
    pub fn on_raw<F>(
        mut self,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut S, &StorageEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .entry(HandlerKey::new(aggregate_type, event_type))
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Register a handler on a typed payload, chained after existing ones.
    ///
    /// The aggregate type is the first segment of `P::EVENT_TYPE`. A payload
    /// that does not decode fails the batch with [`ProjectionError::Decode`].
    #[must_use]
    pub fn on<P, F>(self, handler: F) -> Self
    where
        P: EventPayload,
        F: Fn(&mut S, &Event<P>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_raw(
            aggregate_type_of(P::EVENT_TYPE),
            P::EVENT_TYPE,
            move |state: &mut S, event: &StorageEvent| {
                let decoded = event.decode::<P>().map_err(|e| ProjectionError::Decode {
                    event_type: event.event_type.clone(),
                    position: event.position,
                    reason: e.to_string(),
                })?;
                handler(state, &decoded)
            },
        )
    }

    /// Replace the chain of one key with a single handler.
    #[must_use]
    pub fn override_with<F>(
        mut self,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut S, &StorageEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut chain: SmallVec<[Handler<S>; 1]> = SmallVec::new();
        chain.push(Arc::new(handler));
        self.handlers
            .insert(HandlerKey::new(aggregate_type, event_type), chain);
        self
    }

    /// Union of two tables; chains of shared keys run `self`'s handlers first.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        for (key, chain) in other.handlers {
            self.handlers.entry(key).or_default().extend(chain);
        }
        self
    }

    /// Union of two tables; `other` replaces the chains of shared keys.
    #[must_use]
    pub fn merge_overriding(mut self, other: Self) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    /// Compose a sub-projection into this table.
    ///
    /// Every key of `sub` is chained to a handler that reduces the event into
    /// the [`Projection`] reached through `lens`, so the sub-projection keeps
    /// its own watermark.
    #[must_use]
    pub fn embed<T: Clone + 'static>(self, sub: HandlerTable<T>, lens: fn(&mut S) -> &mut Projection<T>) -> Self {
        let sub = Arc::new(sub);
        let keys: Vec<HandlerKey> = sub.handlers.keys().cloned().collect();
        keys.into_iter().fold(self, |table, key| {
            let sub = Arc::clone(&sub);
            table.on_raw(key.aggregate_type, key.event_type, move |state: &mut S, event: &StorageEvent| {
                lens(state).reduce_one(&sub, event).map(|_| ())
            })
        })
    }

    /// Returns `true` if a handler is registered for the key.
    #[must_use]
    pub fn handles(&self, aggregate_type: &str, event_type: &str) -> bool {
        self.handlers
            .contains_key(&HandlerKey::new(aggregate_type, event_type))
    }

    /// Returns `true` if a handler is registered for the event.
    #[must_use]
    pub fn handles_event(&self, event: &StorageEvent) -> bool {
        self.handlers.contains_key(&HandlerKey::of(event))
    }

    /// Run the event's handler chain; `Ok(false)` if nothing is registered.
    ///
    /// # Errors
    ///
    /// The first handler error; later handlers of the chain do not run and
    /// earlier ones keep their changes. [`Projection::reduce_one`] stages the
    /// chain on a copy.
    pub fn apply(&self, state: &mut S, event: &StorageEvent) -> Result<bool> {
        let Some(chain) = self.handlers.get(&HandlerKey::of(event)) else {
            return Ok(false);
        };
        for handler in chain {
            handler(state, event)?;
        }
        Ok(true)
    }

    /// Number of handlers registered for a key.
    #[must_use]
    pub fn chain_len(&self, aggregate_type: &str, event_type: &str) -> usize {
        self.handlers
            .get(&HandlerKey::new(aggregate_type, event_type))
            .map_or(0, SmallVec::len)
    }

    /// Registered keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// One aggregate filter per aggregate type, selecting the handled event types.
    #[must_use]
    pub fn aggregate_filters(&self) -> Vec<AggregateFilter> {
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.keys() {
            by_type.entry(key.aggregate_type).or_default().push(key.event_type);
        }
        by_type
            .into_iter()
            .map(|(aggregate_type, event_types)| {
                AggregateFilter::new(aggregate_type).event(EventFilter::new().event_types(event_types))
            })
            .collect()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S: 'static> Default for HandlerTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for HandlerTable<S> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<S> fmt::Debug for HandlerTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("keys", &self.handlers.len())
            .finish()
    }
}
