//! Single-object read models.
//!
//! An [`ObjectReadModel`] holds one object (one org, one instance), hydrates it
//! by a full replay on first access and then follows the log through its
//! subscription.

use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::projection::Projection;
use crate::read_model::{CatchUp, ReadModel, ReadModelKey, catch_up_query};
use eventstore_core::position::GlobalPosition;
use eventstore_core::store::EventStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One lazily hydrated object.
///
/// # Example
///
/// ```ignore
/// let org = Arc::new(ObjectReadModel::new(OrgDetails::new(), store.clone(), ReadModelKey::new("inst-1", "org-1")));
/// let handle = Subscription::spawn(org.clone(), store, SubscriptionConfig::default());
///
/// let details = org.get().await?;
/// ```
pub struct ObjectReadModel<M: ReadModel> {
    model: Arc<M>,
    store: Arc<dyn EventStore>,
    key: ReadModelKey,
    config: SubscriptionConfig,
    projection: Mutex<Option<Projection<M::State>>>,
}

impl<M: ReadModel> ObjectReadModel<M> {
    /// Create an object read model; nothing is read until first access.
    pub fn new(model: M, store: Arc<dyn EventStore>, key: ReadModelKey) -> Self {
        Self {
            model: Arc::new(model),
            store,
            key,
            config: SubscriptionConfig::default(),
            projection: Mutex::new(None),
        }
    }

    /// Set the configuration used for hydration.
    #[must_use]
    pub const fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// The object's key.
    pub const fn key(&self) -> &ReadModelKey {
        &self.key
    }

    /// Current state, hydrating on first access.
    ///
    /// An object without events has its initial state; that is not an error.
    ///
    /// # Errors
    ///
    /// Store and handler errors from hydration.
    pub async fn get(&self) -> Result<M::State> {
        Ok(self.projection().await?.into_state())
    }

    /// Current state and watermark, hydrating on first access.
    ///
    /// # Errors
    ///
    /// Store and handler errors from hydration.
    pub async fn projection(&self) -> Result<Projection<M::State>> {
        let mut slot = self.projection.lock().await;
        if let Some(projection) = slot.as_ref() {
            return Ok(projection.clone());
        }

        let mut projection = Projection::scoped(self.key.instance.clone(), self.model.init(&self.key));
        // a failed hydration leaves the slot empty; the next access replays again
        let applied = self.follow(&mut projection, &self.config).await?;
        *slot = Some(projection.clone());

        tracing::debug!(
            read_model = self.model.name(),
            key = %self.key,
            applied,
            watermark = %projection.position(),
            "Hydrated object read model"
        );
        Ok(projection)
    }

    /// Returns `true` once the object has been hydrated.
    pub async fn is_loaded(&self) -> bool {
        self.projection.lock().await.is_some()
    }

    async fn follow(&self, projection: &mut Projection<M::State>, config: &SubscriptionConfig) -> Result<usize> {
        let mut cursor = projection.position();
        let mut applied = 0;
        loop {
            let query = catch_up_query(self.model.query(&self.key), cursor, config);
            let events = self.store.filter(query).await?;
            applied += projection.reduce(self.model.handlers(), &events)?;

            match events.last() {
                Some(last) => cursor = cursor.max(last.position),
                None => break,
            }
            if events.len() < config.batch_size.max(1) as usize {
                break;
            }
        }
        Ok(applied)
    }

    async fn catch_up_loaded(&self, config: &SubscriptionConfig) -> Result<usize> {
        let mut slot = self.projection.lock().await;
        let Some(projection) = slot.as_mut() else {
            // not hydrated yet; first access replays everything
            return Ok(0);
        };
        self.follow(projection, config).await
    }

    /// Position of the last applied event, [`GlobalPosition::ZERO`] if not hydrated.
    pub async fn position(&self) -> GlobalPosition {
        self.projection
            .lock()
            .await
            .as_ref()
            .map_or(GlobalPosition::ZERO, Projection::position)
    }
}

impl<M: ReadModel> CatchUp for ObjectReadModel<M> {
    fn name(&self) -> &str {
        self.model.name()
    }

    fn catch_up<'a>(
        &'a self,
        config: &'a SubscriptionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(self.catch_up_loaded(config))
    }
}
