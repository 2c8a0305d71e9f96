//! `PostgreSQL` event store for the identity platform.
//!
//! This crate implements [`EventStore`] from `eventstore-core` on top of sqlx:
//!
//! - Atomic pushes with per-aggregate sequence checks and unique constraints
//! - Query translation with cursor paging
//! - Awaiting still-open push transactions on the read side
//! - Position notifications via `LISTEN/NOTIFY`
//! - A [`PostgresCache`] for read models
//!
//! # Example
//!
//! ```ignore
//! use eventstore_postgres::{PostgresConfig, PostgresEventStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresEventStore::connect(PostgresConfig::from_env()?).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod notify;
mod push;
mod sql;

pub use cache::PostgresCache;
pub use config::PostgresConfig;

use eventstore_core::error::{EventStoreError, Result};
use eventstore_core::event::StorageEvent;
use eventstore_core::position::GlobalPosition;
use eventstore_core::push::PushIntent;
use eventstore_core::query::Query;
use eventstore_core::store::{EventStore, PositionStream, StoreFuture};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;

/// [`EventStore`] backed by a `PostgreSQL` `events` table.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresEventStore {
    /// Connect a pool as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the URL is invalid or the
    /// connection fails.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.database_url)
            .map_err(sql::db_error)?
            .application_name(&config.application_name);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Connected event store");
        Ok(Self { pool, config })
    }

    /// Use an existing pool with the default configuration.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self::from_pool_with_config(pool, PostgresConfig::default())
    }

    /// Use an existing pool; `config.database_url` and
    /// `config.max_connections` are ignored.
    #[must_use]
    pub const fn from_pool_with_config(pool: PgPool, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    /// Create or upgrade the `events` and `projection_cache` tables.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &PostgresConfig {
        &self.config
    }
}

impl EventStore for PostgresEventStore {
    fn push(&self, intent: PushIntent) -> StoreFuture<'_, Vec<StorageEvent>> {
        Box::pin(push::push(&self.pool, &self.config, intent))
    }

    fn filter(&self, query: Query) -> StoreFuture<'_, Vec<StorageEvent>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(sql::db_error)?;
            let events = sql::fetch_events(&mut conn, &query, &self.config.push_application_name()).await?;
            tracing::trace!(events = events.len(), "Filtered events");
            Ok(events)
        })
    }

    fn latest_position(&self, instance: Option<String>) -> StoreFuture<'_, GlobalPosition> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(sql::db_error)?;
            sql::latest_position(&mut conn, instance.as_deref()).await
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, PositionStream> {
        Box::pin(notify::listen(&self.pool, &self.config.notification_channel))
    }
}
