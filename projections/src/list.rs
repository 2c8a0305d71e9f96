//! List read models.
//!
//! A [`ListReadModel`] manages an unbounded set of objects of one
//! [`ReadModel`], each cached as a `Projection` under its [`ReadModelKey`].
//!
//! ```text
//!  reader ──get(key)──► cache ──miss──► replay key's history ──► cache.set
//!
//!  subscription ──catch_up──► events after cursor
//!                               │ key_of(event)
//!                               ├─ cached          → reduce into entry
//!                               ├─ creates(event)  → new entry
//!                               ├─ removes(event)  → cache.remove
//!                               └─ otherwise       → dropped (not loaded)
//! ```
//!
//! Both paths go through the cache's `get/set/remove`; loads and catch-up
//! batches are additionally serialized by a write gate so a slower writer
//! never overwrites a newer entry.

use crate::cache::Cache;
use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::projection::Projection;
use crate::read_model::{CatchUp, ReadModel, ReadModelKey, catch_up_query, replay_query};
use eventstore_core::error::{EventStoreError, codes};
use eventstore_core::position::GlobalPosition;
use eventstore_core::query::{Filter, Query};
use eventstore_core::store::EventStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cached collection of objects kept current by one shared subscription.
pub struct ListReadModel<M: ReadModel, C> {
    model: Arc<M>,
    store: Arc<dyn EventStore>,
    cache: C,
    instance: Option<String>,
    config: SubscriptionConfig,
    cursor: Mutex<GlobalPosition>,
}

impl<M, C> ListReadModel<M, C>
where
    M: ReadModel,
    C: Cache<Projection<M::State>>,
{
    /// Create a list over every instance, following the log from the start.
    pub fn new(model: M, store: Arc<dyn EventStore>, cache: C) -> Self {
        Self {
            model: Arc::new(model),
            store,
            cache,
            instance: None,
            config: SubscriptionConfig::default(),
            cursor: Mutex::new(GlobalPosition::ZERO),
        }
    }

    /// Restrict the subscription to one instance.
    #[must_use]
    pub fn scoped(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the configuration used when replaying entries on a cache miss.
    #[must_use]
    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the subscription after `position` instead of the beginning.
    ///
    /// Objects created before `position` are then only available through
    /// on-demand loads.
    #[must_use]
    pub fn starting_after(self, position: GlobalPosition) -> Self {
        Self {
            cursor: Mutex::new(position),
            ..self
        }
    }

    /// The model definition.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The backing cache.
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    /// Position the subscription has processed up to.
    pub async fn cursor(&self) -> GlobalPosition {
        *self.cursor.lock().await
    }

    /// State of one object.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the object has no events or was removed
    /// - store, cache and handler errors
    pub async fn get(&self, key: &ReadModelKey) -> Result<M::State> {
        Ok(self.projection(key).await?.into_state())
    }

    /// State and watermark of one object, replaying its history on a cache miss.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the object has no events or was removed
    /// - store, cache and handler errors
    pub async fn projection(&self, key: &ReadModelKey) -> Result<Projection<M::State>> {
        let cache_key = key.to_string();
        if let Some(cached) = self.cache.get(&cache_key).await? {
            return Ok(cached);
        }

        let _gate = self.cursor.lock().await;
        if let Some(cached) = self.cache.get(&cache_key).await? {
            return Ok(cached);
        }

        let events = self.store.filter(replay_query(self.model.as_ref(), key, &self.config)).await?;
        let removed = events
            .iter()
            .filter(|e| self.model.handlers().handles_event(e) || self.model.removes(e))
            .max_by(|a, b| a.position.cmp(&b.position))
            .is_some_and(|latest| self.model.removes(latest));
        if events.is_empty() || removed {
            return Err(EventStoreError::not_found(
                codes::EVENTS_NOT_FOUND,
                format!("{} {key} not found", self.model.name()),
            )
            .into());
        }

        let mut projection = Projection::scoped(key.instance.clone(), self.model.init(key));
        projection.reduce(self.model.handlers(), &events)?;
        self.cache.set(&cache_key, projection.clone()).await?;

        tracing::debug!(
            read_model = self.model.name(),
            key = %key,
            events = events.len(),
            watermark = %projection.position(),
            "Loaded list entry from log"
        );
        Ok(projection)
    }

    /// Drop a cached object; the next access replays it.
    ///
    /// # Errors
    ///
    /// Cache errors.
    pub async fn evict(&self, key: &ReadModelKey) -> Result<()> {
        let _gate = self.cursor.lock().await;
        self.cache.remove(&key.to_string()).await
    }

    fn base_query(&self) -> Query {
        let filter = self
            .model
            .handlers()
            .aggregate_filters()
            .into_iter()
            .fold(Filter::new(), Filter::aggregate);
        let query = self
            .instance
            .as_ref()
            .map_or_else(Query::all_instances, |instance| Query::new(instance.clone()));
        query.filter(filter)
    }

    async fn follow(&self, config: &SubscriptionConfig) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let mut applied = 0;
        loop {
            let query = catch_up_query(self.base_query(), *cursor, config);
            let events = self.store.filter(query).await?;

            for event in &events {
                let key = self.model.key_of(event);
                let cache_key = key.to_string();

                if self.model.removes(event) {
                    self.cache.remove(&cache_key).await?;
                    applied += 1;
                } else if let Some(mut entry) = self.cache.get(&cache_key).await? {
                    if entry.reduce_one(self.model.handlers(), event)? {
                        self.cache.set(&cache_key, entry).await?;
                        applied += 1;
                    }
                } else if self.model.creates(event) {
                    let mut entry = Projection::scoped(key.instance.clone(), self.model.init(&key));
                    entry.reduce_one(self.model.handlers(), event)?;
                    self.cache.set(&cache_key, entry).await?;
                    applied += 1;
                } else {
                    tracing::trace!(
                        read_model = self.model.name(),
                        key = %key,
                        event_type = %event.event_type,
                        "Dropping event of unloaded entry"
                    );
                }
                *cursor = event.position;
            }

            if events.len() < config.batch_size.max(1) as usize {
                break;
            }
        }
        Ok(applied)
    }
}

impl<M, C> CatchUp for ListReadModel<M, C>
where
    M: ReadModel,
    C: Cache<Projection<M::State>>,
{
    fn name(&self) -> &str {
        self.model.name()
    }

    fn catch_up<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(self.follow(config))
    }
}
