//! Translation of queries into SQL and of rows back into events.
//!
//! Every value reaches the database as a bind parameter; only column names
//! and operators are pushed as text.

use chrono::{DateTime, Utc};
use eventstore_core::aggregate::Aggregate;
use eventstore_core::error::{EventStoreError, Result};
use eventstore_core::event::{Payload, StorageEvent};
use eventstore_core::position::GlobalPosition;
use eventstore_core::query::{AggregateFilter, Condition, EventFilter, Filter, Query};
use sqlx::postgres::PgRow;
use sqlx::{Encode, PgConnection, Postgres, QueryBuilder, Row, Type};

/// Columns of the `events` table, in decode order.
pub(crate) const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, owner, sequence, event_type, \
     revision, creator, payload, position, in_position_order, created_at";

/// Map a driver error to the storage error kind.
pub(crate) fn db_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(e.to_string())
}

fn push_condition<T>(builder: &mut QueryBuilder<'static, Postgres>, column: &str, condition: Condition<T>)
where
    T: Encode<'static, Postgres> + Type<Postgres> + Send + 'static,
    Vec<T>: Encode<'static, Postgres> + Type<Postgres>,
{
    builder.push(" AND ").push(column);
    match condition {
        Condition::Equals(value) => {
            builder.push(" = ").push_bind(value);
        }
        Condition::In(values) => {
            builder.push(" = ANY(").push_bind(values).push(")");
        }
        Condition::AtLeast(value) => {
            builder.push(" >= ").push_bind(value);
        }
        Condition::Greater(value) => {
            builder.push(" > ").push_bind(value);
        }
        Condition::AtMost(value) => {
            builder.push(" <= ").push_bind(value);
        }
        Condition::Less(value) => {
            builder.push(" < ").push_bind(value);
        }
        Condition::Between(min, max) => {
            builder.push(" BETWEEN ").push_bind(min).push(" AND ").push_bind(max);
        }
    }
}

fn push_event_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &EventFilter) {
    builder.push("(TRUE");
    if let Some(types) = &filter.types {
        push_condition(builder, "event_type", types.clone());
    }
    if let Some(revision) = &filter.revision {
        push_condition(builder, "revision", revision.map(|r| i32::from(*r)));
    }
    if let Some(created_at) = &filter.created_at {
        push_condition::<DateTime<Utc>>(builder, "created_at", created_at.clone());
    }
    if let Some(sequence) = &filter.sequence {
        push_condition(builder, "sequence", sequence.map(|s| i64::from(*s)));
    }
    if let Some(creator) = &filter.creator {
        push_condition(builder, "creator", creator.clone());
    }
    builder.push(")");
}

fn push_aggregate_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &AggregateFilter) {
    builder
        .push("(aggregate_type = ")
        .push_bind(filter.aggregate_type.clone());
    if let Some(ids) = &filter.ids {
        push_condition(builder, "aggregate_id", ids.clone());
    }
    if let Some(owner) = &filter.owner {
        push_condition(builder, "owner", owner.clone());
    }
    if !filter.events.is_empty() {
        builder.push(" AND (");
        for (i, event) in filter.events.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            push_event_filter(builder, event);
        }
        builder.push(")");
    }
    builder.push(")");
}

/// Build the `SELECT` of one filter.
///
/// `push_application` is the application name of push transactions, used by
/// filters that wait for open transactions.
pub(crate) fn select_events(
    instance: Option<&Condition<String>>,
    filter: &Filter,
    push_application: &str,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE TRUE"));

    if let Some(instance) = instance {
        push_condition(&mut builder, "instance_id", instance.clone());
    }

    if !filter.aggregates.is_empty() {
        builder.push(" AND (");
        for (i, aggregate) in filter.aggregates.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            push_aggregate_filter(&mut builder, aggregate);
        }
        builder.push(")");
    }

    let pagination = &filter.pagination;
    if let Some(cursor) = pagination.after {
        builder
            .push(" AND ((position = ")
            .push_bind(cursor.position)
            .push(" AND in_position_order > ")
            .push_bind(i64::from(cursor.in_position_order))
            .push(") OR position > ")
            .push_bind(cursor.position)
            .push(")");
    }

    if filter.await_open_transactions {
        builder
            .push(
                " AND position < (SELECT COALESCE(EXTRACT(EPOCH FROM min(xact_start))::DOUBLE PRECISION, \
                 'Infinity'::DOUBLE PRECISION) FROM pg_stat_activity WHERE application_name = ",
            )
            .push_bind(push_application.to_string())
            .push(" AND pid <> pg_backend_pid())");
    }

    if pagination.descending {
        builder.push(" ORDER BY position DESC, in_position_order DESC");
    } else {
        builder.push(" ORDER BY position, in_position_order");
    }
    if let Some(limit) = pagination.limit {
        builder.push(" LIMIT ").push_bind(i64::from(limit));
    }
    if let Some(offset) = pagination.offset {
        builder.push(" OFFSET ").push_bind(i64::from(offset));
    }
    builder
}

/// Decode one row selected with [`EVENT_COLUMNS`].
pub(crate) fn decode_event(row: &PgRow) -> Result<StorageEvent> {
    let sequence: i64 = row.try_get("sequence").map_err(db_error)?;
    let revision: i32 = row.try_get("revision").map_err(db_error)?;
    let in_position_order: i32 = row.try_get("in_position_order").map_err(db_error)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(db_error)?;

    Ok(StorageEvent {
        creator: row.try_get("creator").map_err(db_error)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        revision: u16::try_from(revision)
            .map_err(|_| EventStoreError::DatabaseError(format!("revision out of range: {revision}")))?,
        payload: Payload::from_bytes(payload),
        aggregate: Aggregate {
            id: row.try_get("aggregate_id").map_err(db_error)?,
            aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
            instance: row.try_get("instance_id").map_err(db_error)?,
            owner: row.try_get("owner").map_err(db_error)?,
        },
        created_at: row.try_get("created_at").map_err(db_error)?,
        position: GlobalPosition::new(
            row.try_get("position").map_err(db_error)?,
            u32::try_from(in_position_order).map_err(|_| {
                EventStoreError::DatabaseError(format!("in_position_order out of range: {in_position_order}"))
            })?,
        ),
        sequence: u32::try_from(sequence)
            .map_err(|_| EventStoreError::DatabaseError(format!("sequence out of range: {sequence}")))?,
    })
}

/// Run every filter of `query` on `conn` and combine the results.
///
/// # Errors
///
/// Returns `InvalidArgument` for a malformed query and `DatabaseError` if a
/// statement or a row decode fails.
pub(crate) async fn fetch_events(
    conn: &mut PgConnection,
    query: &Query,
    push_application: &str,
) -> Result<Vec<StorageEvent>> {
    query.validate()?;

    let mut results = Vec::new();
    for filter in query.effective_filters() {
        let mut builder = select_events(query.instance.as_ref(), &filter, push_application);
        let rows = builder.build().fetch_all(&mut *conn).await.map_err(db_error)?;
        results.push(rows.iter().map(decode_event).collect::<Result<Vec<_>>>()?);
    }
    Ok(query.combine(results))
}

/// Position of the newest event, optionally inside one instance.
pub(crate) async fn latest_position(conn: &mut PgConnection, instance: Option<&str>) -> Result<GlobalPosition> {
    let mut builder: QueryBuilder<'static, Postgres> =
        QueryBuilder::new("SELECT position, in_position_order FROM events");
    if let Some(instance) = instance {
        builder.push(" WHERE instance_id = ").push_bind(instance.to_string());
    }
    builder.push(" ORDER BY position DESC, in_position_order DESC LIMIT 1");

    let row: Option<(f64, i32)> = builder
        .build_query_as()
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;

    match row {
        Some((position, order)) => Ok(GlobalPosition::new(
            position,
            u32::try_from(order)
                .map_err(|_| EventStoreError::DatabaseError(format!("in_position_order out of range: {order}")))?,
        )),
        None => Ok(GlobalPosition::ZERO),
    }
}
