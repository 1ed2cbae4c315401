//! Error types for the Tandem engine.

use crate::{DatastoreId, LocalId};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Store errors
    #[error("capacity exceeded for datastore '{datastore}': limit {limit}, requested {requested}")]
    CapacityExceeded {
        datastore: DatastoreId,
        limit: i64,
        requested: i64,
    },

    #[error("change log store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("change log store is invalid: {0}")]
    StoreInvalid(String),

    #[error("change log store for datastore '{0}' is held by another session")]
    StoreLocked(DatastoreId),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("I/O failure: {0}")]
    Io(String),

    // Item errors
    #[error("backend rejected item {item}: [{code}] {message}")]
    BackendItem {
        item: String,
        code: u16,
        message: String,
    },

    #[error("unresolved conflict for item {0}")]
    ConflictUnresolved(LocalId),

    #[error("backend failure: [{code}] {message}")]
    Backend { code: u16, message: String },

    // Session errors
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("no classifier registered for content type '{0}'")]
    UnknownContentType(String),

    #[error("slow sync comparison limit of {0} exceeded")]
    SlowSyncLimit(u64),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error aborts the whole session.
    ///
    /// Store-level, capacity and I/O errors are fatal. Per-item errors and
    /// conflicts are collected into the session report instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::BackendItem { .. }
                | Error::ConflictUnresolved(_)
                | Error::StoreCorrupt(_)
                | Error::StoreInvalid(_)
        )
    }

    /// Whether the error should be answered with a slow sync rather than
    /// surfaced to the caller.
    pub fn forces_slow_sync(&self) -> bool {
        matches!(
            self,
            Error::StoreCorrupt(_) | Error::StoreInvalid(_) | Error::InvalidSnapshot(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidSnapshot(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
