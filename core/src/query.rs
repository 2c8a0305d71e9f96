//! Filter/query algebra over the global event log.
//!
//! A [`Query`] describes which slice of the log to read without touching
//! storage. The tree has four levels:
//!
//! ```text
//! Query { instance, filters }                 filters are OR'd, one storage call each
//!   Filter { aggregates, pagination }         aggregate filters are OR'd
//!     AggregateFilter { type, ids, events }   event filters are OR'd
//!       EventFilter { types, revision, created_at, sequence, creator }
//! ```
//!
//! Every other field inside one level is AND'd.
//!
//! # Pagination
//!
//! Two mechanisms compose: `limit`/`offset` paging and a position cursor. The
//! cursor `(position, in_position_order)` means "everything after where I left
//! off" and expands to
//!
//! ```text
//! (position = cursor.position AND in_position_order > cursor.in_position_order)
//!     OR position > cursor.position
//! ```
//!
//! because several events share one position when they were pushed together.
//!
//! # Building
//!
//! Construction is append-only: builder methods add conditions, they never
//! combine two finished trees. [`merge_filters`] exists only to reject such
//! merges explicitly.
//!
//! ```
//! use eventstore_core::query::{AggregateFilter, EventFilter, Filter, Query};
//! use eventstore_core::position::GlobalPosition;
//!
//! let query = Query::new("inst-1").filter(
//!     Filter::new()
//!         .aggregate(
//!             AggregateFilter::new("user")
//!                 .event(EventFilter::new().event_type("user.token.added")),
//!         )
//!         .position_after(GlobalPosition::new(12.0, 4)),
//! );
//! assert!(query.validate().is_ok());
//! ```

use crate::error::{EventStoreError, Result, codes};
use crate::event::StorageEvent;
use crate::position::GlobalPosition;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Comparison applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition<T> {
    /// Field equals the value.
    Equals(T),
    /// Field equals one of the values.
    In(Vec<T>),
    /// Field is greater than or equal to the value.
    AtLeast(T),
    /// Field is strictly greater than the value.
    Greater(T),
    /// Field is less than or equal to the value.
    AtMost(T),
    /// Field is strictly less than the value.
    Less(T),
    /// Field lies in the inclusive range.
    Between(T, T),
}

impl<T: PartialOrd> Condition<T> {
    /// Evaluate the condition against a value.
    #[must_use]
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Self::Equals(expected) => value == expected,
            Self::In(values) => values.iter().any(|v| v == value),
            Self::AtLeast(min) => value >= min,
            Self::Greater(min) => value > min,
            Self::AtMost(max) => value <= max,
            Self::Less(max) => value < max,
            Self::Between(min, max) => value >= min && value <= max,
        }
    }

    /// Convert the compared values, keeping the comparison.
    #[must_use]
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Condition<U> {
        match self {
            Self::Equals(v) => Condition::Equals(f(v)),
            Self::In(values) => Condition::In(values.iter().map(f).collect()),
            Self::AtLeast(v) => Condition::AtLeast(f(v)),
            Self::Greater(v) => Condition::Greater(f(v)),
            Self::AtMost(v) => Condition::AtMost(f(v)),
            Self::Less(v) => Condition::Less(f(v)),
            Self::Between(min, max) => Condition::Between(f(min), f(max)),
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        match self {
            Self::In(values) if values.is_empty() => Err(EventStoreError::invalid_argument(
                codes::FILTER_INVALID,
                format!("{field}: IN condition without values"),
            )),
            Self::Between(min, max) if min > max => Err(EventStoreError::invalid_argument(
                codes::FILTER_INVALID,
                format!("{field}: empty BETWEEN range"),
            )),
            _ => Ok(()),
        }
    }
}

fn optional<T: PartialOrd>(condition: Option<&Condition<T>>, value: &T) -> bool {
    condition.is_none_or(|c| c.matches(value))
}

/// Conditions on individual events of an aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Event type condition.
    pub types: Option<Condition<String>>,
    /// Payload revision condition.
    pub revision: Option<Condition<u16>>,
    /// Commit time condition.
    pub created_at: Option<Condition<DateTime<Utc>>>,
    /// Aggregate sequence condition.
    pub sequence: Option<Condition<u32>>,
    /// Creator condition.
    pub creator: Option<Condition<String>>,
}

impl EventFilter {
    /// An event filter matching every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match exactly one event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.types = Some(Condition::Equals(event_type.into()));
        self
    }

    /// Match any of the given event types.
    #[must_use]
    pub fn event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(Condition::In(event_types.into_iter().map(Into::into).collect()));
        self
    }

    /// Condition on the payload revision.
    #[must_use]
    pub fn revision(mut self, condition: Condition<u16>) -> Self {
        self.revision = Some(condition);
        self
    }

    /// Condition on the commit time.
    #[must_use]
    pub fn created_at(mut self, condition: Condition<DateTime<Utc>>) -> Self {
        self.created_at = Some(condition);
        self
    }

    /// Condition on the aggregate sequence.
    #[must_use]
    pub fn sequence(mut self, condition: Condition<u32>) -> Self {
        self.sequence = Some(condition);
        self
    }

    /// Only events after the given aggregate sequence.
    #[must_use]
    pub fn sequence_greater(self, sequence: u32) -> Self {
        self.sequence(Condition::Greater(sequence))
    }

    /// Match events created by one identity.
    #[must_use]
    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(Condition::Equals(creator.into()));
        self
    }

    /// Evaluate against a stored event.
    #[must_use]
    pub fn matches(&self, event: &StorageEvent) -> bool {
        optional(self.types.as_ref(), &event.event_type)
            && optional(self.revision.as_ref(), &event.revision)
            && optional(self.created_at.as_ref(), &event.created_at)
            && optional(self.sequence.as_ref(), &event.sequence)
            && optional(self.creator.as_ref(), &event.creator)
    }

    fn validate(&self) -> Result<()> {
        if let Some(c) = &self.types {
            c.validate("event type")?;
        }
        if let Some(c) = &self.revision {
            c.validate("revision")?;
        }
        if let Some(c) = &self.created_at {
            c.validate("created_at")?;
        }
        if let Some(c) = &self.sequence {
            c.validate("sequence")?;
        }
        if let Some(c) = &self.creator {
            c.validate("creator")?;
        }
        Ok(())
    }
}

/// Conditions on the aggregates an event belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFilter {
    /// Required aggregate type.
    pub aggregate_type: String,
    /// Aggregate id condition.
    pub ids: Option<Condition<String>>,
    /// Resource owner condition.
    pub owner: Option<Condition<String>>,
    /// Event filters, OR'd. Empty matches every event.
    pub events: Vec<EventFilter>,
}

impl AggregateFilter {
    /// Filter events of one aggregate type.
    #[must_use]
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            ids: None,
            owner: None,
            events: Vec::new(),
        }
    }

    /// Restrict to one aggregate id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids = Some(Condition::Equals(id.into()));
        self
    }

    /// Restrict to a set of aggregate ids.
    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(Condition::In(ids.into_iter().map(Into::into).collect()));
        self
    }

    /// Restrict to one resource owner.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(Condition::Equals(owner.into()));
        self
    }

    /// Add an event filter.
    #[must_use]
    pub fn event(mut self, filter: EventFilter) -> Self {
        self.events.push(filter);
        self
    }

    /// Evaluate against a stored event.
    #[must_use]
    pub fn matches(&self, event: &StorageEvent) -> bool {
        event.aggregate.aggregate_type == self.aggregate_type
            && optional(self.ids.as_ref(), &event.aggregate.id)
            && optional(self.owner.as_ref(), &event.aggregate.owner)
            && (self.events.is_empty() || self.events.iter().any(|f| f.matches(event)))
    }

    fn validate(&self) -> Result<()> {
        if self.aggregate_type.is_empty() {
            return Err(EventStoreError::invalid_argument(
                codes::AGGREGATE_TYPE_MISSING,
                "aggregate filter without aggregate type",
            ));
        }
        if let Some(ids) = &self.ids {
            ids.validate("aggregate id")?;
        }
        if let Some(owner) = &self.owner {
            owner.validate("owner")?;
        }
        self.events.iter().try_for_each(EventFilter::validate)
    }
}

/// Paging and ordering of one filter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pagination {
    /// Maximum number of events.
    pub limit: Option<u32>,
    /// Number of events to skip.
    pub offset: Option<u32>,
    /// Only events strictly after this position.
    pub after: Option<GlobalPosition>,
    /// Newest first instead of the default oldest first.
    pub descending: bool,
}

impl Pagination {
    /// Returns `true` if `position` lies after the cursor.
    #[must_use]
    pub fn admits(&self, position: &GlobalPosition) -> bool {
        self.after.is_none_or(|cursor| {
            (position.position == cursor.position
                && position.in_position_order > cursor.in_position_order)
                || position.position > cursor.position
        })
    }
}

/// One storage call: OR of aggregate filters plus pagination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Aggregate filters, OR'd. Empty matches every aggregate.
    pub aggregates: Vec<AggregateFilter>,
    /// Paging and ordering.
    pub pagination: Pagination,
    /// Exclude positions that still-open writing transactions could precede.
    pub await_open_transactions: bool,
}

impl Filter {
    /// A filter matching every event of the query's instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an aggregate filter.
    #[must_use]
    pub fn aggregate(mut self, filter: AggregateFilter) -> Self {
        self.aggregates.push(filter);
        self
    }

    /// Limit the number of events.
    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.pagination.limit = Some(limit);
        self
    }

    /// Skip events.
    #[must_use]
    pub const fn offset(mut self, offset: u32) -> Self {
        self.pagination.offset = Some(offset);
        self
    }

    /// Only events after the cursor.
    #[must_use]
    pub const fn position_after(mut self, cursor: GlobalPosition) -> Self {
        self.pagination.after = Some(cursor);
        self
    }

    /// Newest first. Inside a [`Query`] the query's order applies instead.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.pagination.descending = true;
        self
    }

    /// Wait for still-open writing transactions instead of reading past them.
    #[must_use]
    pub const fn await_open_transactions(mut self) -> Self {
        self.await_open_transactions = true;
        self
    }

    /// Evaluate against a stored event, ignoring limit and offset.
    #[must_use]
    pub fn matches(&self, event: &StorageEvent) -> bool {
        self.pagination.admits(&event.position)
            && (self.aggregates.is_empty() || self.aggregates.iter().any(|f| f.matches(event)))
    }

    /// Select, order and page `events` the way a backend would.
    #[must_use]
    pub fn apply<'a, I>(&self, events: I) -> Vec<StorageEvent>
    where
        I: IntoIterator<Item = &'a StorageEvent>,
    {
        let mut selected: Vec<StorageEvent> =
            events.into_iter().filter(|e| self.matches(e)).cloned().collect();
        sort_events(&mut selected, self.pagination.descending);

        let offset = self.pagination.offset.map_or(0, |o| o as usize);
        let limit = self.pagination.limit.map_or(usize::MAX, |l| l as usize);
        selected.into_iter().skip(offset).take(limit).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.pagination.limit == Some(0) {
            return Err(EventStoreError::invalid_argument(
                codes::FILTER_INVALID,
                "limit must be greater than zero",
            ));
        }
        self.aggregates.iter().try_for_each(AggregateFilter::validate)
    }
}

/// The full read request: instance scope plus OR'd filters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Instance condition; `None` reads all instances.
    pub instance: Option<Condition<String>>,
    /// Filters, OR'd. Empty reads everything in scope.
    pub filters: Vec<Filter>,
    /// Limit applied after combining the filters' results.
    pub limit: Option<u32>,
    /// Order of the combined result.
    pub descending: bool,
}

impl Query {
    /// Read events of one instance.
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: Some(Condition::Equals(instance.into())),
            filters: Vec::new(),
            limit: None,
            descending: false,
        }
    }

    /// Read events of several instances.
    #[must_use]
    pub fn instances<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instance: Some(Condition::In(instances.into_iter().map(Into::into).collect())),
            ..Self::all_instances()
        }
    }

    /// Read events of every instance.
    #[must_use]
    pub const fn all_instances() -> Self {
        Self {
            instance: None,
            filters: Vec::new(),
            limit: None,
            descending: false,
        }
    }

    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Limit the combined result.
    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Newest first for the combined result.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Resume every filter after `cursor`.
    #[must_use]
    pub fn after(mut self, cursor: GlobalPosition) -> Self {
        if self.filters.is_empty() {
            self.filters.push(Filter::new());
        }
        for filter in &mut self.filters {
            filter.pagination.after = Some(cursor);
        }
        self
    }

    /// Make every filter wait for still-open writing transactions.
    #[must_use]
    pub fn awaiting_open_transactions(mut self) -> Self {
        if self.filters.is_empty() {
            self.filters.push(Filter::new());
        }
        for filter in &mut self.filters {
            filter.await_open_transactions = true;
        }
        self
    }

    /// The filters a backend executes.
    ///
    /// A query without filters reads everything in scope. The query limit caps
    /// every filter's limit and the query order overrides the filters' order:
    /// the first `n` events of the union are always among the first `n` events
    /// of some filter, so [`combine`](Self::combine) stays exact.
    #[must_use]
    pub fn effective_filters(&self) -> Vec<Filter> {
        let mut filters = if self.filters.is_empty() {
            vec![Filter::new()]
        } else {
            self.filters.clone()
        };
        for filter in &mut filters {
            filter.pagination.descending = self.descending;
            if let Some(limit) = self.limit {
                let capped = filter.pagination.limit.map_or(limit, |l| l.min(limit));
                filter.pagination.limit = Some(capped);
            }
        }
        filters
    }

    /// Returns `true` if the event is inside the query's instance scope.
    #[must_use]
    pub fn in_scope(&self, event: &StorageEvent) -> bool {
        optional(self.instance.as_ref(), &event.aggregate.instance)
    }

    /// Evaluate against a stored event, ignoring limits and offsets.
    #[must_use]
    pub fn matches(&self, event: &StorageEvent) -> bool {
        self.in_scope(event)
            && (self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event)))
    }

    /// Check the whole tree for malformed conditions.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::InvalidArgument`] for empty aggregate types,
    /// empty `IN` lists, inverted ranges or a zero limit.
    pub fn validate(&self) -> Result<()> {
        if let Some(instance) = &self.instance {
            instance.validate("instance")?;
        }
        if self.limit == Some(0) {
            return Err(EventStoreError::invalid_argument(
                codes::FILTER_INVALID,
                "limit must be greater than zero",
            ));
        }
        self.filters.iter().try_for_each(Filter::validate)
    }

    /// Combine the per-filter results of one query into the final result.
    ///
    /// Events returned by several filters appear once; the result is ordered by
    /// position and cut to the query limit.
    #[must_use]
    pub fn combine(&self, results: Vec<Vec<StorageEvent>>) -> Vec<StorageEvent> {
        let mut seen = HashSet::new();
        let mut combined: Vec<StorageEvent> = results
            .into_iter()
            .flatten()
            .filter(|e| {
                seen.insert((
                    e.aggregate.instance.clone(),
                    e.aggregate.aggregate_type.clone(),
                    e.aggregate.id.clone(),
                    e.sequence,
                ))
            })
            .collect();
        sort_events(&mut combined, self.descending);
        if let Some(limit) = self.limit {
            combined.truncate(limit as usize);
        }
        combined
    }
}

/// Sort events by global position.
pub fn sort_events(events: &mut [StorageEvent], descending: bool) {
    events.sort_by(|a, b| {
        let order = a.position.cmp(&b.position);
        if descending { order.reverse() } else { order }
    });
}

/// Structural merging of finished filters is not supported.
///
/// A merge cannot decide how to combine differing pagination or instance
/// scoping, so callers build one filter tree directly. A single filter is
/// returned unchanged.
///
/// # Errors
///
/// Returns [`EventStoreError::InvalidArgument`] with
/// [`codes::FILTER_MERGE_UNSUPPORTED`] unless exactly one filter is given.
pub fn merge_filters(filters: Vec<Filter>) -> Result<Filter> {
    let mut filters = filters.into_iter();
    match (filters.next(), filters.next()) {
        (Some(filter), None) => Ok(filter),
        _ => Err(EventStoreError::invalid_argument(
            codes::FILTER_MERGE_UNSUPPORTED,
            "merging built filters is not supported; build a single filter instead",
        )),
    }
}
