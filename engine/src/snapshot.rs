//! Snapshot types for persisting and restoring the change log.
//!
//! A snapshot is the exact byte layout handed to [`ChangeLogStorage`]. It is
//! serialized deterministically (records in a `BTreeMap`) and sealed with a
//! SHA-256 checksum so truncated or tampered files are recognised on load.
//!
//! [`ChangeLogStorage`]: crate::storage::ChangeLogStorage

use crate::{
    changelog::{ChangeFlags, ChangeRecord},
    error::Result,
    DatastoreId, Error, Fingerprint, Generation, LocalId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format. Snapshots of any other version are not
/// trusted.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of a datastore's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Datastore the records belong to
    pub datastore_id: DatastoreId,
    /// Commit counter at snapshot time
    pub generation: Generation,
    /// Set while a session is applying operations; a snapshot loaded with
    /// this flag was left behind by an interrupted session
    #[serde(default)]
    pub in_flight: bool,
    /// Whether other readers may inspect the store during a session
    #[serde(default)]
    pub shared_memory: bool,
    /// All change records by local ID
    pub records: BTreeMap<LocalId, ChangeRecord>,
    /// Digest over the rest of the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Fingerprint>,
}

impl ChangeLogSnapshot {
    /// Create an empty snapshot.
    pub fn new(datastore_id: impl Into<DatastoreId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            datastore_id: datastore_id.into(),
            generation: 0,
            in_flight: false,
            shared_memory: false,
            records: BTreeMap::new(),
            checksum: None,
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: ChangeRecord) {
        self.records.insert(record.local_id.clone(), record);
    }

    pub fn get_record(&self, local_id: &str) -> Option<&ChangeRecord> {
        self.records.get(local_id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Count records carrying the given flag.
    pub fn flagged_count(&self, flag: ChangeFlags) -> usize {
        self.records
            .values()
            .filter(|r| r.flags.contains(flag))
            .count()
    }

    /// Check the snapshot belongs to `datastore_id` and is internally
    /// consistent.
    pub fn validate(&self, datastore_id: &str) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::StoreInvalid(format!(
                "unsupported snapshot format version: {} (expected {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.datastore_id != datastore_id {
            return Err(Error::StoreInvalid(format!(
                "datastore mismatch: expected '{}', got '{}'",
                datastore_id, self.datastore_id
            )));
        }

        let mut remote_ids = std::collections::HashSet::new();
        for (key, record) in &self.records {
            if key != &record.local_id {
                return Err(Error::StoreCorrupt(format!(
                    "record stored under '{}' has local ID '{}'",
                    key, record.local_id
                )));
            }
            if let Some(remote_id) = &record.remote_id {
                if !remote_ids.insert(remote_id) {
                    return Err(Error::StoreCorrupt(format!(
                        "remote ID '{}' mapped twice",
                        remote_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn compute_checksum(&self) -> Result<Fingerprint> {
        let mut body = self.clone();
        body.checksum = None;
        let bytes = serde_json::to_vec(&body)?;
        Ok(Fingerprint::digest(&bytes))
    }

    /// Serialize to sealed JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut sealed = self.clone();
        sealed.checksum = Some(self.compute_checksum()?);
        Ok(serde_json::to_vec(&sealed)?)
    }

    /// Serialize to sealed JSON text.
    pub fn to_json(&self) -> Result<String> {
        String::from_utf8(self.to_bytes()?).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize and verify sealed bytes.
    ///
    /// Unparseable input and checksum mismatches yield `StoreCorrupt`; a
    /// format version other than the current one yields `StoreInvalid`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::StoreCorrupt(format!("unreadable snapshot: {}", e)))?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::StoreInvalid(format!(
                "unsupported snapshot format version: {} (expected {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let expected = snapshot.compute_checksum()?;
        match snapshot.checksum {
            Some(checksum) if checksum == expected => Ok(snapshot),
            Some(checksum) => Err(Error::StoreCorrupt(format!(
                "checksum mismatch: stored {}, computed {}",
                checksum, expected
            ))),
            None => Err(Error::StoreCorrupt("snapshot has no checksum".into())),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_bytes(json.as_bytes())
    }
}

/// Summary of a snapshot, available to readers without a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub datastore_id: DatastoreId,
    pub generation: Generation,
    pub in_flight: bool,
    pub record_count: usize,
    /// Records waiting for a remote add or update
    pub pending_count: usize,
    /// Records whose remote deletion is not acknowledged
    pub pending_delete_count: usize,
    pub conflict_count: usize,
}

impl From<&ChangeLogSnapshot> for SnapshotMetadata {
    fn from(snapshot: &ChangeLogSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            datastore_id: snapshot.datastore_id.clone(),
            generation: snapshot.generation,
            in_flight: snapshot.in_flight,
            record_count: snapshot.record_count(),
            pending_count: snapshot
                .records
                .values()
                .filter(|r| {
                    r.flags.contains(ChangeFlags::PENDING_ADD)
                        || r.flags.contains(ChangeFlags::PENDING_UPDATE)
                })
                .count(),
            pending_delete_count: snapshot.flagged_count(ChangeFlags::PENDING_DELETE),
            conflict_count: snapshot.flagged_count(ChangeFlags::CONFLICT),
        }
    }
}
