//! # Tandem Engine
//!
//! A two-way sync reconciliation engine.
//!
//! The engine keeps a local datastore and a remote peer in step. It remembers
//! what both sides looked like after the last successful sync in a change
//! log, derives the operations needed to bring both sides back together, and
//! hands them to a [`Backend`] that owns the actual data.
//!
//! ## Core Concepts
//!
//! ### Items
//!
//! An [`Item`] is a record of one [`ContentType`] (contact, event, task or
//! memo) with a local ID, a remote ID once the peer knows it, and a map of
//! named fields.
//!
//! ### Field Classes
//!
//! Every field has an [`EquivalenceClass`]. Revision stamps are `Never`
//! compared; identifying fields are `SlowSync`; ordinary content is
//! `Conflict`. Comparing at a level looks at every field of that class or
//! above.
//!
//! ### Change Log
//!
//! The [`ChangeLog`] maps local IDs to remote IDs and stores a
//! [`Fingerprint`] of each item as last synced. It is persisted as a sealed
//! JSON snapshot through a [`StoreProvider`].
//!
//! ### Sessions
//!
//! A [`Session`] runs `reconcile -> apply -> commit`. Incremental sessions
//! trust the change log; slow sessions rebuild it by matching items on
//! content. An untrustworthy change log (corrupt, outdated, or left behind
//! by an interrupted session) always leads to a slow sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_engine::{
//!     CapacityConfig, ContentType, Engine, EngineConfig, Item, MemoryBackend,
//!     MemoryStoreProvider, SessionStatus,
//! };
//! use serde_json::json;
//!
//! let engine = Engine::new(EngineConfig::default(), Arc::new(MemoryStoreProvider::new()));
//!
//! let mut backend = MemoryBackend::new();
//! backend.insert_local(Item::from_json(ContentType::Contact, json!({"FN": "Alice"})));
//! backend.insert_remote(Item::from_json(ContentType::Contact, json!({"FN": "Bob"})));
//!
//! let mut session = engine.begin_session("contacts", CapacityConfig::default()).unwrap();
//! let report = session.run(&mut backend).unwrap();
//!
//! assert_eq!(report.status, SessionStatus::Success);
//! assert_eq!(backend.local_len(), 2);
//! assert_eq!(backend.remote_len(), 2);
//! ```

pub mod backend;
pub mod changelog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod item;
pub mod plan;
pub mod reconcile;
pub mod session;
pub mod snapshot;
pub mod storage;

// Re-export main types at crate root
pub use backend::{Ack, Backend, BackendError, ChangeScope, MemoryBackend, RemoteChange, Side};
pub use changelog::{ChangeBatch, ChangeFlags, ChangeLog, ChangeRecord};
pub use classifier::{
    ClassifierRegistry, Comparison, ContentType, EquivalenceClass, FieldMismatch, ItemClassifier,
};
pub use config::{CapacityConfig, ConfigError, EngineConfig};
pub use error::Error;
pub use fingerprint::Fingerprint;
pub use item::{Item, SyncOp};
pub use plan::{
    AppliedResult, ConflictReport, ItemOutcome, ItemReport, OperationPlan, SessionReport,
    SessionStatus, SyncMode,
};
pub use reconcile::{ConflictCase, ConflictResolver, ConflictStrategy, Reconciler, Resolution};
pub use session::{Engine, Session, SessionState};
pub use snapshot::{ChangeLogSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use storage::{ChangeLogStorage, FileStoreProvider, MemoryStoreProvider, StoreProvider};

/// Type aliases for clarity
pub type LocalId = String;
pub type RemoteId = String;
pub type DatastoreId = String;
pub type Timestamp = u64;
pub type Generation = u64;
