//! # Weft Engine
//!
//! A replicated triple store for local-first applications.
//!
//! Documents are stored as timestamped facts: one fact per leaf attribute,
//! plus markers for objects and collection membership. Replicas exchange
//! facts and merge them by last writer wins per attribute, so any two
//! replicas holding the same facts materialize the same documents.
//!
//! ## Core Concepts
//!
//! ### Facts
//!
//! A [`TripleRow`] is `(entity, attribute, value, timestamp, expired)`. The
//! [`TripleStore`] keeps three indexes over them (entity/attribute/time,
//! attribute/value/entity, and per-replica timestamps) on an ordered
//! [`TupleStorage`]. Keys are encoded with the order-preserving [`codec`].
//!
//! ### Timestamps
//!
//! A [`Timestamp`] is a replica-scoped sequence number. The [`Clock`] issues
//! them and moves past timestamps observed from other replicas.
//!
//! ### Entities
//!
//! An [`Entity`] folds facts into the newest fact per attribute and
//! materializes a document from them. Assigning an object hides any older
//! facts beneath it.
//!
//! ### Queries and subscriptions
//!
//! The [`Database`] facade inserts, updates and deletes documents, evaluates
//! [`CollectionQuery`] trees and keeps live subscriptions up to date with
//! [`DBChanges`] deltas.
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_engine::{CollectionQuery, Database, MemoryClock, MemoryStorage, Value};
//! use serde_json::json;
//!
//! let mut db = Database::new(MemoryStorage::new(), MemoryClock::new("device_1"));
//!
//! let (id, _) = db
//!     .insert("users", Value::from(json!({"id": "u1", "name": "Alice"})))
//!     .unwrap();
//! assert_eq!(id, "u1");
//!
//! let users = db.fetch(&CollectionQuery::new("users")).unwrap();
//! assert_eq!(users.len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Storage backends implement [`TupleStorage`]. Use
//! [`Database::export_snapshot`] and [`Database::import_snapshot`] with
//! [`StoreSnapshot`] for whole-store persistence.

pub mod change_tracker;
pub mod clock;
pub mod codec;
pub mod database;
pub mod diff;
pub mod entity;
pub mod error;
pub mod ivm;
pub mod path;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod triple;
pub mod triple_store;
pub mod value;

// Re-export main types at crate root
pub use change_tracker::{Change, ChangeTracker};
pub use clock::{
    Clock, DurableClock, InMemorySequence, MemoryClock, SequencePersistence, Timestamp,
};
pub use codec::Codec;
pub use database::{Database, SubscriptionId, SubscriptionListener, SubscriptionUpdate};
pub use diff::{CollectionChanges, CollectionView, DBChanges, DatabaseView};
pub use entity::Entity;
pub use error::{Error, Result};
pub use path::{AttributePath, PathSegment};
pub use query::{
    Cardinality, CollectionQuery, FilterOp, FilterStatement, FilterValue, QueryHash, QueryWhere,
};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema, SchemaEdit};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{Direction, MemoryStorage, ScanArgs, TupleStorage, WriteBatch};
pub use triple::TripleRow;
pub use triple_store::{CommitSummary, TripleReader, TripleStore, TripleStoreTransaction};
pub use value::{Object, Value};

/// Type aliases for clarity
pub type EntityId = String;
pub type CollectionName = String;
pub type ReplicaId = String;
pub type SchemaVersion = u32;

/// A decoded storage key.
pub type Tuple = Vec<Value>;
