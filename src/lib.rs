//! # Unit of Work
//!
//! Change tracking over an object graph, backed by an identity-cached,
//! reference-resolving record store.
//!
//! ## Core Concepts
//!
//! - **Entities**: Domain types with a stable id and a table of tracked
//!   properties (plain values, references, associations)
//! - **Store**: One record file per instance; loading a record resolves its
//!   references through an identity cache, so cycles load once
//! - **Sessions**: Attach a root and everything it reaches, record every
//!   mutation, then commit exactly what changed or roll it back
//! - **Registry**: Closed table of type tags used in the key space and in
//!   broadcast frames
//!
//! ## Example
//!
//! ```ignore
//! use unitwork::{ObjectStore, StoreConfig, TypeRegistry, Value};
//!
//! let registry = TypeRegistry::builder()
//!     .register::<City>(1)
//!     .register::<Weather>(2)
//!     .build()?;
//! let store = Arc::new(ObjectStore::open_or_create(
//!     StoreConfig {
//!         path: "./my-store".into(),
//!         ..Default::default()
//!     },
//!     registry,
//! )?);
//!
//! let oslo = store.insert(City::new("Oslo"))?;
//! let session = store.session();
//! session.start(oslo)?;
//!
//! store.set(oslo, "population", Value::Int(709_000))?;
//! session.commit()?;
//! ```

pub mod cache;
pub mod catalog;
pub mod changes;
pub mod error;
pub mod journal;
pub mod notify;
pub mod records;
pub mod registry;
pub mod session;
pub mod store;
pub mod tracked;
pub mod types;
pub mod wire;

#[cfg(test)]
mod fixtures;

// Re-exports
pub use catalog::{Catalog, Property, PropertyDescriptor, TypeDescriptor};
pub use changes::{Change, ChangeLog, ChangeState, CollectionEdit, EditOp};
pub use error::{Result, StoreError};
pub use journal::{CommitJournal, JournalEntry, JournalOp, JournalStatus};
pub use notify::{
    DropReason, Notification, NotificationFilter, NotificationHub, Subscription,
    SubscriptionConfig, SubscriptionId,
};
pub use records::{Edge, RecordFiles, StoredRecord};
pub use registry::{TypeEntry, TypeRegistry, TypeRegistryBuilder};
pub use session::{CommitReport, Session};
pub use store::{CommitMode, ObjectStore, StoreConfig};
pub use tracked::{Entity, ListEdit, Mutation, MutationKind, Trackable};
pub use types::*;
