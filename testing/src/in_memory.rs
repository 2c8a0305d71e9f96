//! In-memory event store.
//!
//! Runs the same push pipeline as the `PostgreSQL` backend (preconditions,
//! unique constraints, sequence checks, position assignment) under one lock,
//! so every push is atomic and pushes are totally ordered. Positions are a
//! counter starting at `1.0`; `created_at` comes from the injected clock.

use crate::mocks::test_clock;
use eventstore_core::environment::Clock;
use eventstore_core::error::{EventStoreError, Result};
use eventstore_core::event::StorageEvent;
use eventstore_core::position::GlobalPosition;
use eventstore_core::push::{PushIntent, StreamKey, materialize};
use eventstore_core::query::Query;
use eventstore_core::store::{EventStore, PositionStream, StoreFuture};
use eventstore_core::unique::UNIQUE_AGGREGATE_TYPE;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Default)]
struct Log {
    events: Vec<StorageEvent>,
    last_position: f64,
}

/// `Vec`-backed [`EventStore`] for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use eventstore_testing::InMemoryEventStore;
/// use eventstore_core::store::EventStore;
/// use eventstore_core::query::Query;
///
/// # async fn example() -> Result<(), eventstore_core::error::EventStoreError> {
/// let store = InMemoryEventStore::new();
/// assert!(store.filter(Query::new("inst-1")).await?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
    clock: Arc<dyn Clock>,
    notifications: broadcast::Sender<GlobalPosition>,
    failing_reads: Arc<AtomicBool>,
    filter_calls: Arc<AtomicUsize>,
}

impl InMemoryEventStore {
    /// Create an empty store using [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty store stamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            clock,
            notifications,
            failing_reads: Arc::new(AtomicBool::new(false)),
            filter_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Snapshot of every stored event in position order.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the lock is poisoned.
    pub fn events(&self) -> Result<Vec<StorageEvent>> {
        Ok(self.lock()?.events.clone())
    }

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.events.len())
    }

    /// Returns `true` if nothing has been pushed.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.events.is_empty())
    }

    /// Make every following `filter` call fail with a database error until
    /// reset, simulating an unavailable backend.
    pub fn fail_reads(&self, failing: bool) {
        self.failing_reads.store(failing, Ordering::SeqCst);
    }

    /// Number of `filter` calls so far, failed ones included.
    #[must_use]
    pub fn filter_calls(&self) -> usize {
        self.filter_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Log>> {
        self.log
            .lock()
            .map_err(|_| EventStoreError::DatabaseError("event log lock poisoned".to_string()))
    }

    fn push_locked(&self, log: &mut Log, intent: &PushIntent) -> Result<Vec<StorageEvent>> {
        intent.validate()?;

        for precondition in &intent.preconditions {
            let events = select(&log.events, &precondition.query)?;
            precondition.check(&events)?;
        }

        let planned = if intent.has_unique_constraints() {
            let wanted: HashSet<StreamKey> = intent.reservation_aggregates().iter().map(StreamKey::from).collect();
            let mut latest = HashMap::new();
            for event in &log.events {
                let key = StreamKey::from(&event.aggregate);
                if wanted.contains(&key) {
                    latest.insert(key, (event.event_type.clone(), event.sequence));
                }
            }

            let removed = intent.removed_instances();
            let released: Vec<StorageEvent> = log
                .events
                .iter()
                .filter(|e| {
                    e.aggregate.aggregate_type == UNIQUE_AGGREGATE_TYPE && removed.contains(&e.aggregate.instance)
                })
                .cloned()
                .collect();

            intent.unique_pushes(&latest, &released)?
        } else {
            Vec::new()
        };

        let mut targets = intent.aggregates.clone();
        targets.extend(planned);

        let keys: HashSet<StreamKey> = targets.iter().map(|t| StreamKey::from(&t.aggregate)).collect();
        let mut sequences: HashMap<StreamKey, u32> = HashMap::new();
        for event in &log.events {
            let key = StreamKey::from(&event.aggregate);
            if keys.contains(&key) {
                sequences.insert(key, event.sequence);
            }
        }

        let position = log.last_position + 1.0;
        let events = materialize(&targets, &sequences, position, self.clock.now())?;
        log.last_position = position;
        log.events.extend(events.iter().cloned());
        Ok(events)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

fn select(events: &[StorageEvent], query: &Query) -> Result<Vec<StorageEvent>> {
    query.validate()?;
    let results = query
        .effective_filters()
        .iter()
        .map(|filter| filter.apply(events.iter().filter(|e| query.in_scope(e))))
        .collect();
    Ok(query.combine(results))
}

impl EventStore for InMemoryEventStore {
    fn push(&self, intent: PushIntent) -> StoreFuture<'_, Vec<StorageEvent>> {
        Box::pin(async move {
            let events = {
                let mut log = self.lock()?;
                self.push_locked(&mut log, &intent)?
            };
            if let Some(last) = events.last() {
                // no receivers is fine
                let _ = self.notifications.send(last.position);
            }
            Ok(events)
        })
    }

    fn filter(&self, query: Query) -> StoreFuture<'_, Vec<StorageEvent>> {
        Box::pin(async move {
            self.filter_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_reads.load(Ordering::SeqCst) {
                return Err(EventStoreError::DatabaseError("store unavailable".to_string()));
            }
            select(&self.lock()?.events, &query)
        })
    }

    fn latest_position(&self, instance: Option<String>) -> StoreFuture<'_, GlobalPosition> {
        Box::pin(async move {
            let log = self.lock()?;
            Ok(log
                .events
                .iter()
                .filter(|e| instance.as_ref().is_none_or(|i| &e.aggregate.instance == i))
                .map(|e| e.position)
                .max()
                .unwrap_or(GlobalPosition::ZERO))
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, PositionStream> {
        Box::pin(async move {
            let mut receiver = self.notifications.subscribe();
            let stream: PositionStream = Box::pin(async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(position) => yield position,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Position subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(stream)
        })
    }
}
