//! # Eventstore Testing
//!
//! Testing utilities for the identity event store.
//!
//! This crate provides:
//! - [`InMemoryEventStore`]: the push pipeline without a database
//! - Mock implementations of environment traits
//! - [`ProjectionTest`]: Given/When/Then testing of handler tables
//! - [`fixtures`]: a small org domain with list and object read models
//!
//! ## Example
//!
//! ```ignore
//! use eventstore_testing::{InMemoryEventStore, fixtures};
//!
//! #[tokio::test]
//! async fn test_org_list() {
//!     let store = Arc::new(InMemoryEventStore::new());
//!     store.push(fixtures::add_org("inst-1", "org-1", "Acme")?).await?;
//!
//!     let orgs = ListReadModel::new(fixtures::OrgList::new(), store.clone(), InMemoryCache::new());
//!     assert_eq!(orgs.get(&ReadModelKey::new("inst-1", "org-1")).await?.name, "Acme");
//! }
//! ```

pub mod fixtures;
pub mod in_memory;
pub mod projection_test;

use chrono::{DateTime, Utc};
use eventstore_core::environment::{Clock, IdGenerator};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventstore_testing::mocks::FixedClock;
    /// use eventstore_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Ids `<prefix>-1`, `<prefix>-2`, ...
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Start counting at 1.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> String {
            format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
        }
    }
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Honors `RUST_LOG`; calling it from several tests is fine.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use in_memory::InMemoryEventStore;
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};
pub use projection_test::ProjectionTest;
