//! # Eventstore Projections
//!
//! Reducers, projections and read-model managers over the event log.
//!
//! ## Overview
//!
//! - [`handler`]: `(aggregate type, event type) -> [handler]` dispatch tables
//! - [`projection`]: watermark-gated, idempotent reduction
//! - [`state`]: active/inactive/removed lifecycle tracking
//! - [`read_model`]: read-model definitions
//! - [`object`]: single-object read models, hydrated on first access
//! - [`list`]: cached collections of objects
//! - [`cache`]: the cache contract and an in-memory cache
//! - [`subscription`]: the catch-up loop driving a read model
//!
//! ## Example
//!
//! ```ignore
//! use eventstore_projections::*;
//!
//! let orgs = Arc::new(ListReadModel::new(OrgList::new(), store.clone(), InMemoryCache::new()));
//! let handle = subscription::spawn(orgs.clone(), store, SubscriptionConfig::default());
//!
//! let acme = orgs.get(&ReadModelKey::new("inst-1", "org-1")).await?;
//!
//! handle.shutdown().await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod list;
pub mod object;
pub mod projection;
pub mod read_model;
pub mod state;
pub mod subscription;

pub use cache::{Cache, InMemoryCache};
pub use config::SubscriptionConfig;
pub use error::{ProjectionError, Result};
pub use handler::HandlerTable;
pub use list::ListReadModel;
pub use object::ObjectReadModel;
pub use projection::{Projection, Watermark};
pub use read_model::{CatchUp, ReadModel, ReadModelKey};
pub use state::{ObjectState, StateEvents, state_handlers};
pub use subscription::SubscriptionHandle;
