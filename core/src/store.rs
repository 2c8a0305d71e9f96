//! The storage backend abstraction.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventstore-postgres`): production backend
//! - `InMemoryEventStore` (in `eventstore-testing`): deterministic tests
//!
//! # Example
//!
//! ```no_run
//! use eventstore_core::aggregate::Aggregate;
//! use eventstore_core::error::EventStoreError;
//! use eventstore_core::event::{Command, Payload};
//! use eventstore_core::push::{PushAggregate, PushIntent};
//! use eventstore_core::query::{AggregateFilter, Filter, Query};
//! use eventstore_core::sequence::CurrentSequence;
//! use eventstore_core::store::EventStore;
//!
//! async fn example<S: EventStore>(store: &S) -> Result<(), EventStoreError> {
//!     let org = Aggregate::new("inst-1", "org", "org-1").with_owner("org-1");
//!     store
//!         .push(PushIntent::new().aggregate(
//!             PushAggregate::new(org)
//!                 .current_sequence(CurrentSequence::Matches(0))
//!                 .command(Command::raw("user-1", "org.added", 1, Payload::empty())),
//!         ))
//!         .await?;
//!
//!     let history = store
//!         .filter(Query::new("inst-1").filter(
//!             Filter::new().aggregate(AggregateFilter::new("org").id("org-1")),
//!         ))
//!         .await?;
//!     assert_eq!(history.len(), 1);
//!     Ok(())
//! }
//! ```

use crate::error::{EventStoreError, Result, codes};
use crate::event::StorageEvent;
use crate::position::GlobalPosition;
use crate::push::PushIntent;
use crate::query::Query;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`EventStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of committed positions, one item per successful push.
///
/// Items are hints: a consumer that misses one still catches up by querying
/// from its own watermark.
pub type PositionStream = Pin<Box<dyn Stream<Item = GlobalPosition> + Send>>;

/// Append-only, globally ordered event log.
///
/// # Design
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so read models can hold an `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Atomically append every aggregate's commands of `intent`.
    ///
    /// In one transaction the backend
    ///
    /// 1. runs each precondition query and its validation function,
    /// 2. applies unique constraint changes as appends on reservation aggregates,
    /// 3. checks each aggregate's [`CurrentSequence`](crate::sequence::CurrentSequence),
    /// 4. appends, giving every event its sequence and [`GlobalPosition`],
    /// 5. notifies subscribers of the new position.
    ///
    /// Returns the appended events, reservation events included, in
    /// position order.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: malformed intent
    /// - `ConcurrencyConflict`: a sequence check failed
    /// - `UniqueConstraint`: a key is already reserved, or not reserved on removal
    /// - any error returned by a precondition validator
    /// - `DatabaseError`: backend failure
    ///
    /// No event of the intent is visible after an error.
    fn push(&self, intent: PushIntent) -> StoreFuture<'_, Vec<StorageEvent>>;

    /// Read the events selected by `query`, ordered by position.
    ///
    /// An empty result is not an error.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: malformed query
    /// - `DatabaseError`: backend failure
    fn filter(&self, query: Query) -> StoreFuture<'_, Vec<StorageEvent>>;

    /// Position of the newest event, optionally restricted to one instance.
    ///
    /// Returns [`GlobalPosition::ZERO`] for an empty log.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: backend failure
    fn latest_position(&self, instance: Option<String>) -> StoreFuture<'_, GlobalPosition>;

    /// Subscribe to position notifications of future pushes.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: the notification channel could not be opened
    fn subscribe(&self) -> StoreFuture<'_, PositionStream>;

    /// Like [`filter`](Self::filter), but an empty result is [`EventStoreError::NotFound`].
    ///
    /// # Errors
    ///
    /// - `NotFound`: no event matched
    /// - anything [`filter`](Self::filter) returns
    fn filter_existing(&self, query: Query) -> StoreFuture<'_, Vec<StorageEvent>> {
        Box::pin(async move {
            let events = self.filter(query).await?;
            if events.is_empty() {
                return Err(EventStoreError::not_found(
                    codes::EVENTS_NOT_FOUND,
                    "no events matched the query",
                ));
            }
            Ok(events)
        })
    }
}
