//! Read-model cache abstraction.
//!
//! The cache is never authoritative. A miss makes the read model replay the
//! log; it never invents default state. Implementations own their locking, so
//! the subscription task and on-demand loads can share one cache.

use crate::error::{ProjectionError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Keyed storage for reduced read models.
///
/// # Implementations
///
/// - [`InMemoryCache`]: process-local map
/// - `PostgresCache` (in `eventstore-postgres`): survives restarts
pub trait Cache<V>: Send + Sync {
    /// Get a cached value.
    ///
    /// # Returns
    ///
    /// - `Some(value)` if found
    /// - `None` if not found
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the backend fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<V>>> + Send;

    /// Insert or replace a value.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the backend fails.
    fn set(&self, key: &str, value: V) -> impl Future<Output = Result<()>> + Send;

    /// Remove a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the backend fails.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// `HashMap`-backed cache.
///
/// ```
/// use eventstore_projections::cache::{Cache, InMemoryCache};
///
/// # async fn example() -> Result<(), eventstore_projections::error::ProjectionError> {
/// let cache = InMemoryCache::new();
/// cache.set("inst-1:org-1", "Acme".to_string()).await?;
/// assert_eq!(cache.get("inst-1:org-1").await?, Some("Acme".to_string()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryCache<V> {
    entries: Arc<RwLock<HashMap<String, V>>>,
}

impl<V> InMemoryCache<V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of cached entries.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Returns `true` if nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Cached keys in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cache`] if the lock is poisoned.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.read()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, V>>> {
        self.entries
            .read()
            .map_err(|e| ProjectionError::Cache(format!("cache lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, V>>> {
        self.entries
            .write()
            .map_err(|e| ProjectionError::Cache(format!("cache lock poisoned: {e}")))
    }
}

impl<V> Default for InMemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for InMemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V: Clone + Send + Sync> Cache<V> for InMemoryCache<V> {
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> Result<()> {
        self.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_remove() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("a").await.unwrap(), None::<u32>);

        cache.set("a", 1).await.unwrap();
        cache.set("b", 2).await.unwrap();
        cache.set("a", 3).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(3));
        assert_eq!(cache.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        cache.remove("a").await.unwrap();
        cache.remove("missing").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = InMemoryCache::new();
        let other = cache.clone();
        cache.set("a", "x".to_string()).await.unwrap();
        assert_eq!(other.get("a").await.unwrap().as_deref(), Some("x"));
    }
}
