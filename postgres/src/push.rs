//! The push transaction.
//!
//! ```text
//! BEGIN
//!   application_name := <app>_push          visible to awaiting readers
//!   advisory locks on every target stream   sorted, so pushes cannot deadlock
//!   preconditions                           on the transaction's connection
//!   reservation state                       latest unique_constraint events
//!   current sequences                       MAX(sequence) per target stream
//!   position := clock_timestamp()
//!   INSERT events
//!   pg_notify(channel, position)
//! COMMIT
//! ```
//!
//! Any error drops the transaction, which rolls it back.

use crate::config::PostgresConfig;
use crate::sql::{EVENT_COLUMNS, db_error, fetch_events};
use chrono::{DateTime, Utc};
use eventstore_core::aggregate::Aggregate;
use eventstore_core::error::{EventStoreError, Result, codes};
use eventstore_core::event::StorageEvent;
use eventstore_core::push::{PushAggregate, PushIntent, StreamKey, materialize};
use eventstore_core::query::{AggregateFilter, Filter, Query};
use eventstore_core::unique::UNIQUE_AGGREGATE_TYPE;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Rows per `INSERT`, keeping the statement under the bind parameter limit.
const INSERT_CHUNK: usize = 1000;

const UNIQUE_VIOLATION: &str = "23505";

pub(crate) async fn push(pool: &PgPool, config: &PostgresConfig, intent: PushIntent) -> Result<Vec<StorageEvent>> {
    intent.validate()?;

    match run(pool, config, intent).await {
        Ok(events) => {
            metrics::counter!("eventstore_push_total", "outcome" => "committed").increment(1);
            metrics::counter!("eventstore_pushed_events_total").increment(events.len() as u64);
            Ok(events)
        }
        Err(e) => {
            if e.code() == codes::CONCURRENCY_CONFLICT {
                metrics::counter!("eventstore_push_conflicts_total").increment(1);
            }
            metrics::counter!("eventstore_push_total", "outcome" => "rejected").increment(1);
            Err(e)
        }
    }
}

async fn run(pool: &PgPool, config: &PostgresConfig, intent: PushIntent) -> Result<Vec<StorageEvent>> {
    let push_application = config.push_application_name();
    let mut tx = pool.begin().await.map_err(db_error)?;

    sqlx::query("SELECT set_config('application_name', $1, true)")
        .bind(&push_application)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

    let reservations = intent.reservation_aggregates();
    lock_streams(
        &mut tx,
        intent.aggregates.iter().map(|a| &a.aggregate).chain(reservations.iter()),
    )
    .await?;

    for precondition in &intent.preconditions {
        let events = fetch_events(&mut tx, &precondition.query, &push_application).await?;
        precondition.check(&events)?;
    }

    let planned = if intent.has_unique_constraints() {
        let latest = latest_reservations(&mut tx, &reservations, &push_application).await?;
        let released = instance_reservations(&mut tx, &intent.removed_instances(), &push_application).await?;
        intent.unique_pushes(&latest, &released)?
    } else {
        Vec::new()
    };

    let mut targets = intent.aggregates;
    targets.extend(planned);

    let sequences = current_sequences(&mut tx, &targets).await?;
    let (position, created_at): (f64, DateTime<Utc>) = sqlx::query_as(
        "SELECT EXTRACT(EPOCH FROM ts)::DOUBLE PRECISION, ts FROM (SELECT clock_timestamp() AS ts) t",
    )
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    let events = materialize(&targets, &sequences, position, created_at)?;
    insert(&mut tx, &events).await?;

    if let Some(last) = events.last() {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&config.notification_channel)
            .bind(last.position.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
    }

    tx.commit().await.map_err(db_error)?;

    tracing::debug!(
        events = events.len(),
        aggregates = targets.len(),
        position,
        "Pushed events"
    );
    Ok(events)
}

async fn lock_streams<'a>(conn: &mut PgConnection, aggregates: impl Iterator<Item = &'a Aggregate>) -> Result<()> {
    let keys: BTreeSet<String> = aggregates.map(ToString::to_string).collect();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}

/// Latest event type and sequence of every reservation stream with events.
async fn latest_reservations(
    conn: &mut PgConnection,
    reservations: &[Aggregate],
    push_application: &str,
) -> Result<HashMap<StreamKey, (String, u32)>> {
    if reservations.is_empty() {
        return Ok(HashMap::new());
    }

    let wanted: HashSet<StreamKey> = reservations.iter().map(StreamKey::from).collect();
    let instances: BTreeSet<&str> = reservations.iter().map(|a| a.instance.as_str()).collect();
    let ids: BTreeSet<&str> = reservations.iter().map(|a| a.id.as_str()).collect();

    let query = Query::instances(instances)
        .filter(Filter::new().aggregate(AggregateFilter::new(UNIQUE_AGGREGATE_TYPE).ids(ids)));

    let mut latest = HashMap::new();
    for event in fetch_events(conn, &query, push_application).await? {
        let key = StreamKey::from(&event.aggregate);
        if wanted.contains(&key) {
            latest.insert(key, (event.event_type, event.sequence));
        }
    }
    Ok(latest)
}

/// Every reservation event of the given instances, oldest first.
async fn instance_reservations(
    conn: &mut PgConnection,
    instances: &[String],
    push_application: &str,
) -> Result<Vec<StorageEvent>> {
    if instances.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::instances(instances.iter().cloned())
        .filter(Filter::new().aggregate(AggregateFilter::new(UNIQUE_AGGREGATE_TYPE)));
    fetch_events(conn, &query, push_application).await
}

async fn current_sequences(conn: &mut PgConnection, targets: &[PushAggregate]) -> Result<HashMap<StreamKey, u32>> {
    let keys: HashSet<StreamKey> = targets.iter().map(|t| StreamKey::from(&t.aggregate)).collect();
    let (mut instances, mut types, mut ids) = (Vec::new(), Vec::new(), Vec::new());
    for key in keys {
        instances.push(key.instance);
        types.push(key.aggregate_type);
        ids.push(key.id);
    }

    let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
        r"
        SELECT instance_id, aggregate_type, aggregate_id, MAX(sequence)
        FROM events
        WHERE (instance_id, aggregate_type, aggregate_id) IN (
            SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[])
        )
        GROUP BY instance_id, aggregate_type, aggregate_id
        ",
    )
    .bind(instances)
    .bind(types)
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    rows.into_iter()
        .map(|(instance, aggregate_type, id, sequence)| {
            let sequence = u32::try_from(sequence)
                .map_err(|_| EventStoreError::DatabaseError(format!("sequence out of range: {sequence}")))?;
            Ok((
                StreamKey {
                    instance,
                    aggregate_type,
                    id,
                },
                sequence,
            ))
        })
        .collect()
}

async fn insert(conn: &mut PgConnection, events: &[StorageEvent]) -> Result<()> {
    for chunk in events.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<'static, Postgres> =
            QueryBuilder::new(format!("INSERT INTO events ({EVENT_COLUMNS}) "));
        builder.push_values(chunk, |mut row, event| {
            row.push_bind(event.aggregate.instance.clone())
                .push_bind(event.aggregate.aggregate_type.clone())
                .push_bind(event.aggregate.id.clone())
                .push_bind(event.aggregate.owner.clone())
                .push_bind(i64::from(event.sequence))
                .push_bind(event.event_type.clone())
                .push_bind(i32::from(event.revision))
                .push_bind(event.creator.clone())
                .push_bind(event.payload.as_bytes().to_vec())
                .push_bind(event.position.position)
                .push_bind(i64::from(event.position.in_position_order))
                .push_bind(event.created_at);
        });

        builder.build().execute(&mut *conn).await.map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                EventStoreError::precondition_failed(
                    codes::CONCURRENCY_CONFLICT,
                    "a concurrent push appended to the same aggregate",
                )
            }
            _ => db_error(e),
        })?;
    }
    Ok(())
}
