//! Read-model definitions.
//!
//! A [`ReadModel`] describes how to derive one kind of object from the log:
//! its handler table, its initial state and which events belong to which
//! object. The managers in [`object`](crate::object) and [`list`](crate::list)
//! own the runtime side (hydration, caching and catch-up).

use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::handler::HandlerTable;
use eventstore_core::aggregate::Aggregate;
use eventstore_core::event::StorageEvent;
use eventstore_core::query::{Filter, Query};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Identity of one read-model object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadModelKey {
    /// Tenant of the object.
    pub instance: String,
    /// Natural id, usually the aggregate id.
    pub id: String,
}

impl ReadModelKey {
    /// Build a key.
    #[must_use]
    pub fn new(instance: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            id: id.into(),
        }
    }

    /// The key of an aggregate.
    #[must_use]
    pub fn of(aggregate: &Aggregate) -> Self {
        Self::new(aggregate.instance.clone(), aggregate.id.clone())
    }
}

impl fmt::Display for ReadModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.id)
    }
}

/// Definition of a derived object type.
///
/// Only [`name`](Self::name), [`handlers`](Self::handlers) and
/// [`init`](Self::init) are required; the defaults key objects by aggregate id.
pub trait ReadModel: Send + Sync + 'static {
    /// Reduced state of one object.
    type State: Clone + Send + Sync + 'static;

    /// Name used in logs, metrics and cache partitions.
    fn name(&self) -> &'static str;

    /// Handlers applied to every relevant event.
    fn handlers(&self) -> &HandlerTable<Self::State>;

    /// State of an object before its first event.
    fn init(&self, key: &ReadModelKey) -> Self::State;

    /// Query replaying the history of one object.
    fn query(&self, key: &ReadModelKey) -> Query {
        let filter = self
            .handlers()
            .aggregate_filters()
            .into_iter()
            .fold(Filter::new(), |filter, aggregate| filter.aggregate(aggregate.id(key.id.clone())));
        Query::new(key.instance.clone()).filter(filter)
    }

    /// The object an event belongs to.
    fn key_of(&self, event: &StorageEvent) -> ReadModelKey {
        ReadModelKey::of(&event.aggregate)
    }

    /// Returns `true` if the event creates an object that is not loaded yet.
    fn creates(&self, _event: &StorageEvent) -> bool {
        false
    }

    /// Returns `true` if the event removes its object from the list.
    fn removes(&self, _event: &StorageEvent) -> bool {
        false
    }
}

/// A read model driven by a subscription loop.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the loop can drive an
/// `Arc<dyn CatchUp>`.
pub trait CatchUp: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Apply every event after the model's cursor, in bounded batches.
    ///
    /// Returns the number of applied events.
    ///
    /// # Errors
    ///
    /// Store, cache and handler errors. Events applied before the error stay
    /// applied; the cursor stays at the last of them.
    fn catch_up<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;
}

/// Shape a catch-up query from a base query.
pub(crate) fn catch_up_query(
    base: Query,
    after: eventstore_core::position::GlobalPosition,
    config: &SubscriptionConfig,
) -> Query {
    let query = base.after(after).limit(config.batch_size.max(1));
    if config.await_open_transactions {
        query.awaiting_open_transactions()
    } else {
        query
    }
}

/// Shape the query replaying one object's full history.
pub(crate) fn replay_query<M: ReadModel + ?Sized>(model: &M, key: &ReadModelKey, config: &SubscriptionConfig) -> Query {
    let query = model.query(key);
    if config.await_open_transactions {
        query.awaiting_open_transactions()
    } else {
        query
    }
}
