//! `PostgreSQL`-backed read-model cache.
//!
//! Entries live in the `projection_cache` table, keyed by read model name and
//! entry key, serialized with bincode:
//!
//! ```sql
//! CREATE TABLE projection_cache (
//!     read_model TEXT NOT NULL,
//!     key TEXT NOT NULL,
//!     data BYTEA NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (read_model, key)
//! );
//! ```
//!
//! The cache stays a cache: dropping the table content only costs replays.

use eventstore_projections::cache::Cache;
use eventstore_projections::error::{ProjectionError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::marker::PhantomData;

/// Cache persisting entries of one read model.
///
/// # Example
///
/// ```ignore
/// let cache = PostgresCache::new(store.pool().clone(), "org_list");
/// let orgs = ListReadModel::new(OrgList::new(), store.clone(), cache);
/// ```
pub struct PostgresCache<V> {
    pool: PgPool,
    read_model: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> PostgresCache<V> {
    /// Create a cache for the entries of `read_model`.
    #[must_use]
    pub fn new(pool: PgPool, read_model: impl Into<String>) -> Self {
        Self {
            pool,
            read_model: read_model.into(),
            _value: PhantomData,
        }
    }

    /// Name of the read model whose entries this cache holds.
    #[must_use]
    pub fn read_model(&self) -> &str {
        &self.read_model
    }

    /// Delete every entry of the read model.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the delete fails.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM projection_cache WHERE read_model = $1")
            .bind(&self.read_model)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Cache(format!("Failed to clear {}: {e}", self.read_model)))?;
        Ok(result.rows_affected())
    }
}

impl<V> Clone for PostgresCache<V> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone(), self.read_model.clone())
    }
}

impl<V> Cache<V> for PostgresCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM projection_cache WHERE read_model = $1 AND key = $2")
                .bind(&self.read_model)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ProjectionError::Cache(format!("Failed to get {key}: {e}")))?;

        row.map(|(data,)| {
            bincode::deserialize(&data)
                .map_err(|e| ProjectionError::Cache(format!("Failed to decode {key}: {e}")))
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: V) -> Result<()> {
        let data = bincode::serialize(&value)
            .map_err(|e| ProjectionError::Cache(format!("Failed to encode {key}: {e}")))?;

        sqlx::query(
            "INSERT INTO projection_cache (read_model, key, data, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (read_model, key) DO UPDATE
             SET data = EXCLUDED.data, updated_at = now()",
        )
        .bind(&self.read_model)
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| ProjectionError::Cache(format!("Failed to set {key}: {e}")))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM projection_cache WHERE read_model = $1 AND key = $2")
            .bind(&self.read_model)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Cache(format!("Failed to remove {key}: {e}")))?;

        Ok(())
    }
}
