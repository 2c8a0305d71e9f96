//! # Eventstore Core
//!
//! Model, algebra and storage abstraction of an identity platform's event log.
//!
//! ## Core Concepts
//!
//! - **Aggregate**: one stream of events (an org, a user, an instance)
//! - **Command**: the intent to append one event
//! - **StorageEvent**: an immutable, durable event with its sequence and global position
//! - **Query**: declarative description of a slice of the log
//! - **PushIntent**: an atomic, multi-aggregate append with concurrency checks,
//!   unique constraints and preconditions
//!
//! Reduction of events into read models lives in `eventstore-projections`;
//! storage backends live in `eventstore-postgres` and `eventstore-testing`.
//!
//! ## Example
//!
//! ```
//! use eventstore_core::aggregate::Aggregate;
//! use eventstore_core::event::{Command, EventPayload};
//! use eventstore_core::push::{PushAggregate, PushIntent};
//! use eventstore_core::sequence::CurrentSequence;
//! use eventstore_core::unique::UniqueConstraint;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrgAdded {
//!     name: String,
//! }
//!
//! impl EventPayload for OrgAdded {
//!     const EVENT_TYPE: &'static str = "org.added";
//! }
//!
//! # fn main() -> Result<(), eventstore_core::error::EventStoreError> {
//! let intent = PushIntent::new().aggregate(
//!     PushAggregate::new(Aggregate::new("inst-1", "org", "org-1").with_owner("org-1"))
//!         .current_sequence(CurrentSequence::Matches(0))
//!         .command(Command::new("user-1", &OrgAdded { name: "Acme".to_string() })?)
//!         .unique(UniqueConstraint::add("org_name", "Acme", "Errors.Org.AlreadyExists")),
//! );
//! intent.validate()?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod aggregate;
pub mod environment;
pub mod error;
pub mod event;
pub mod position;
pub mod push;
pub mod query;
pub mod sequence;
pub mod store;
pub mod unique;
