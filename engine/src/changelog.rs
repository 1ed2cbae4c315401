//! Change log - persistent per-item sync state.
//!
//! The change log maps local identity to remote identity and remembers the
//! fingerprint each item had when it was last synchronized. It is the only
//! owner of [`ChangeRecord`]s; sessions look records up by local or remote
//! ID and hand back a [`ChangeBatch`] on commit.

use crate::{
    classifier::ClassifierRegistry, config::CapacityConfig, error::Result,
    snapshot::ChangeLogSnapshot, DatastoreId, Error, Fingerprint, Generation, Item, LocalId,
    RemoteId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Span;

/// Per-record flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeFlags(u8);

impl ChangeFlags {
    pub const NONE: ChangeFlags = ChangeFlags(0);
    /// Add to the remote has not been acknowledged yet
    pub const PENDING_ADD: ChangeFlags = ChangeFlags(0b0001);
    /// Local content must be sent again
    pub const PENDING_UPDATE: ChangeFlags = ChangeFlags(0b0010);
    /// Remote deletion has not been acknowledged yet
    pub const PENDING_DELETE: ChangeFlags = ChangeFlags(0b0100);
    /// Unresolved conflict, re-checked against the remote next session
    pub const CONFLICT: ChangeFlags = ChangeFlags(0b1000);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: ChangeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ChangeFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ChangeFlags {
    type Output = ChangeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ChangeFlags(self.0 | rhs.0)
    }
}

/// Persistent sync state of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    /// Fingerprint of the content as of the last successful sync
    pub fingerprint: Fingerprint,
    pub flags: ChangeFlags,
    /// Generation in which this record last changed
    #[serde(default)]
    pub modcount: Generation,
}

impl ChangeRecord {
    /// Create a record with no remote identity and no flags.
    pub fn new(local_id: impl Into<LocalId>, fingerprint: Fingerprint) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: None,
            fingerprint,
            flags: ChangeFlags::NONE,
            modcount: 0,
        }
    }

    /// Builder-style method to set the remote ID.
    pub fn with_remote_id(mut self, remote_id: impl Into<RemoteId>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    /// Builder-style method to set flags.
    pub fn with_flags(mut self, flags: ChangeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Rough in-memory size, used for the `max_memory` budget.
    pub fn footprint(&self) -> usize {
        const OVERHEAD: usize = 64;
        self.local_id.len()
            + self.remote_id.as_ref().map_or(0, String::len)
            + Fingerprint::LEN
            + OVERHEAD
    }
}

/// One step of a [`ChangeBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Upsert(ChangeRecord),
    Remove(LocalId),
}

/// Record changes of one session, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    ops: Vec<BatchOp>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: ChangeRecord) -> &mut Self {
        self.ops.push(BatchOp::Upsert(record));
        self
    }

    pub fn remove(&mut self, local_id: impl Into<LocalId>) -> &mut Self {
        self.ops.push(BatchOp::Remove(local_id.into()));
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// In-memory change log of one datastore.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    datastore_id: DatastoreId,
    capacity: CapacityConfig,
    records: HashMap<LocalId, ChangeRecord>,
    by_remote: HashMap<RemoteId, LocalId>,
    memory: usize,
    generation: Generation,
    invalid_reason: Option<String>,
    span: Span,
}

impl ChangeLog {
    /// Create an empty, valid change log.
    pub fn new(datastore_id: impl Into<DatastoreId>, capacity: CapacityConfig, span: Span) -> Self {
        Self {
            datastore_id: datastore_id.into(),
            capacity,
            records: HashMap::new(),
            by_remote: HashMap::new(),
            memory: 0,
            generation: 0,
            invalid_reason: None,
            span,
        }
    }

    pub fn datastore_id(&self) -> &DatastoreId {
        &self.datastore_id
    }

    pub fn capacity(&self) -> &CapacityConfig {
        &self.capacity
    }

    /// Monotonic commit counter.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: Generation) {
        self.generation = generation;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated memory held by the records.
    pub fn memory_usage(&self) -> usize {
        self.memory
    }

    /// Iterate all records (unordered).
    pub fn records(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.values()
    }

    pub fn lookup_by_local_id(&self, local_id: &str) -> Option<&ChangeRecord> {
        self.records.get(local_id)
    }

    pub fn lookup_by_remote_id(&self, remote_id: &str) -> Option<&ChangeRecord> {
        self.by_remote
            .get(remote_id)
            .and_then(|local_id| self.records.get(local_id))
    }

    /// Fingerprint of an item under its content type's classifier.
    pub fn fingerprint_of(&self, item: &Item, registry: &ClassifierRegistry) -> Result<Fingerprint> {
        Ok(Fingerprint::of(item, registry.get(item.content_type)?))
    }

    /// Whether the mapping can be trusted for incremental sync.
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid_reason.as_deref()
    }

    /// Mark the log untrustworthy, forcing the next comparison into slow sync.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(parent: &self.span, %reason, "change log invalidated");
        self.invalid_reason = Some(reason);
    }

    /// Drop every record and start over as a valid, empty log.
    ///
    /// The generation keeps counting so older snapshots stay detectable.
    pub fn reset(&mut self) {
        self.records.clear();
        self.by_remote.clear();
        self.memory = 0;
        self.invalid_reason = None;
    }

    /// Fail with `CapacityExceeded` if the given totals break the limits.
    pub fn check_capacity(&self, items: usize, memory: usize) -> Result<()> {
        if let Some(max_items) = self.capacity.item_limit() {
            if items > max_items {
                return Err(self.capacity_error(max_items, items));
            }
        }
        if let Some(max_memory) = self.capacity.memory_limit() {
            if memory > max_memory {
                return Err(self.capacity_error(max_memory, memory));
            }
        }
        Ok(())
    }

    /// Fail if the current content already exceeds the limits.
    pub fn enforce_capacity(&self) -> Result<()> {
        self.check_capacity(self.records.len(), self.memory)
    }

    fn capacity_error(&self, limit: usize, requested: usize) -> Error {
        tracing::warn!(
            parent: &self.span,
            limit,
            requested,
            "change log capacity exceeded"
        );
        Error::CapacityExceeded {
            datastore: self.datastore_id.clone(),
            limit: limit as i64,
            requested: requested as i64,
        }
    }

    /// Insert or replace a record.
    ///
    /// A new record that would exceed the capacity limits is rejected and
    /// the log is left unchanged.
    pub fn upsert(&mut self, mut record: ChangeRecord) -> Result<()> {
        record.modcount = self.generation;
        let previous = self.records.get(&record.local_id).map(ChangeRecord::footprint);
        let items = self.records.len() + usize::from(previous.is_none());
        let memory = self.memory - previous.unwrap_or(0) + record.footprint();
        if previous.is_none() || memory > self.memory {
            self.check_capacity(items, memory)?;
        }
        self.insert_unchecked(record);
        Ok(())
    }

    fn insert_unchecked(&mut self, record: ChangeRecord) {
        if let Some(old) = self.remove_unchecked(&record.local_id) {
            if old.remote_id != record.remote_id {
                tracing::debug!(
                    parent: &self.span,
                    local_id = %record.local_id,
                    old = ?old.remote_id,
                    new = ?record.remote_id,
                    "remote identity changed"
                );
            }
        }
        if let Some(remote_id) = &record.remote_id {
            if let Some(other) = self.by_remote.get(remote_id).cloned() {
                tracing::warn!(
                    parent: &self.span,
                    %remote_id,
                    from = %other,
                    to = %record.local_id,
                    "remote ID moved between records"
                );
                if let Some(stale) = self.records.get_mut(&other) {
                    self.memory -= stale.footprint();
                    stale.remote_id = None;
                    self.memory += stale.footprint();
                }
            }
            self.by_remote
                .insert(remote_id.clone(), record.local_id.clone());
        }
        self.memory += record.footprint();
        self.records.insert(record.local_id.clone(), record);
    }

    /// Remove a record, returning it.
    pub fn remove(&mut self, local_id: &str) -> Option<ChangeRecord> {
        self.remove_unchecked(local_id)
    }

    fn remove_unchecked(&mut self, local_id: &str) -> Option<ChangeRecord> {
        let record = self.records.remove(local_id)?;
        if let Some(remote_id) = &record.remote_id {
            if self.by_remote.get(remote_id).map(String::as_str) == Some(local_id) {
                self.by_remote.remove(remote_id);
            }
        }
        self.memory -= record.footprint();
        Some(record)
    }

    /// Apply a session's record changes atomically.
    ///
    /// Capacity is checked against the final state before anything is
    /// touched. On success the generation is bumped once and every touched
    /// record carries the new generation as its modcount.
    pub fn apply_batch(&mut self, batch: ChangeBatch) -> Result<Generation> {
        let mut staged = self.clone();
        let generation = self.generation + 1;
        staged.generation = generation;

        for op in batch.ops {
            match op {
                BatchOp::Upsert(mut record) => {
                    record.modcount = generation;
                    staged.insert_unchecked(record);
                }
                BatchOp::Remove(local_id) => {
                    staged.remove_unchecked(&local_id);
                }
            }
        }

        // Shrinking batches may always commit, even over the limits.
        if staged.records.len() > self.records.len() || staged.memory > self.memory {
            staged.check_capacity(staged.records.len(), staged.memory)?;
        }

        tracing::debug!(
            parent: &self.span,
            generation,
            records = staged.records.len(),
            "change batch applied"
        );
        *self = staged;
        Ok(generation)
    }

    /// Export the log for persistence.
    pub fn export_state(&self) -> ChangeLogSnapshot {
        let mut snapshot = ChangeLogSnapshot::new(self.datastore_id.clone());
        snapshot.generation = self.generation;
        snapshot.shared_memory = self.capacity.shared_memory;
        for record in self.records.values() {
            snapshot.add_record(record.clone());
        }
        snapshot
    }

    /// Replace the current state with a snapshot's state.
    ///
    /// A snapshot left behind by an interrupted session is imported but
    /// marks the log invalid.
    pub fn import_state(&mut self, snapshot: ChangeLogSnapshot) -> Result<()> {
        snapshot.validate(&self.datastore_id)?;

        self.records.clear();
        self.by_remote.clear();
        self.memory = 0;
        self.generation = snapshot.generation;
        self.invalid_reason = None;
        for record in snapshot.records.into_values() {
            self.insert_unchecked(record);
        }

        if snapshot.in_flight {
            self.invalidate("previous session was interrupted while applying");
        }
        tracing::debug!(
            parent: &self.span,
            generation = self.generation,
            records = self.records.len(),
            "change log imported"
        );
        Ok(())
    }

    /// Remove records whose remote deletion has been pending since at most
    /// `oldest` and will no longer be retried. Returns how many were purged.
    pub fn purge_deleted(&mut self, oldest: Generation) -> usize {
        let stale: Vec<LocalId> = self
            .records
            .values()
            .filter(|r| r.flags.contains(ChangeFlags::PENDING_DELETE) && r.modcount <= oldest)
            .map(|r| r.local_id.clone())
            .collect();
        for local_id in &stale {
            self.remove_unchecked(local_id);
        }
        if !stale.is_empty() {
            tracing::info!(parent: &self.span, purged = stale.len(), "purged stale deletions");
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::digest(tag.as_bytes())
    }

    fn log(max_items: i64) -> ChangeLog {
        ChangeLog::new(
            "contacts",
            CapacityConfig::new(-1, max_items, false),
            Span::none(),
        )
    }

    #[test]
    fn upsert_and_lookup_by_either_key() {
        let mut log = log(-1);
        let record = ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1");
        log.upsert(record.clone()).unwrap();

        assert_eq!(log.lookup_by_local_id("l-1"), Some(&record));
        assert_eq!(log.lookup_by_remote_id("r-1"), Some(&record));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn upsert_replaces_remote_index() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1"))
            .unwrap();
        log.upsert(ChangeRecord::new("l-1", fp("b")).with_remote_id("r-2"))
            .unwrap();

        assert!(log.lookup_by_remote_id("r-1").is_none());
        assert_eq!(log.lookup_by_remote_id("r-2").unwrap().fingerprint, fp("b"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn remote_id_moves_between_records() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1"))
            .unwrap();
        log.upsert(ChangeRecord::new("l-2", fp("b")).with_remote_id("r-1"))
            .unwrap();

        assert_eq!(log.lookup_by_remote_id("r-1").unwrap().local_id, "l-2");
        assert_eq!(log.lookup_by_local_id("l-1").unwrap().remote_id, None);

        log.remove("l-1");
        log.remove("l-2");
        assert!(log.is_empty());
        assert_eq!(log.memory_usage(), 0);
    }

    #[test]
    fn remove_clears_both_indices() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1"))
            .unwrap();
        let removed = log.remove("l-1").unwrap();

        assert_eq!(removed.local_id, "l-1");
        assert!(log.lookup_by_local_id("l-1").is_none());
        assert!(log.lookup_by_remote_id("r-1").is_none());
        assert_eq!(log.memory_usage(), 0);
        assert!(log.remove("l-1").is_none());
    }

    #[test]
    fn capacity_rejects_new_record() {
        let mut log = log(2);
        log.upsert(ChangeRecord::new("l-1", fp("a"))).unwrap();
        log.upsert(ChangeRecord::new("l-2", fp("b"))).unwrap();

        let result = log.upsert(ChangeRecord::new("l-3", fp("c")));
        assert!(matches!(
            result,
            Err(Error::CapacityExceeded { limit: 2, requested: 3, .. })
        ));
        assert_eq!(log.len(), 2);
        assert!(log.lookup_by_local_id("l-3").is_none());

        // Updating an existing record is still allowed
        log.upsert(ChangeRecord::new("l-1", fp("z"))).unwrap();
        assert_eq!(log.lookup_by_local_id("l-1").unwrap().fingerprint, fp("z"));
    }

    #[test]
    fn memory_budget() {
        let record = ChangeRecord::new("l-1", fp("a"));
        let budget = record.footprint() as i64;
        let mut log = ChangeLog::new(
            "contacts",
            CapacityConfig::new(budget, -1, false),
            Span::none(),
        );
        log.upsert(record).unwrap();
        assert!(log.upsert(ChangeRecord::new("l-2", fp("b"))).is_err());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut log = log(2);
        log.upsert(ChangeRecord::new("l-1", fp("a"))).unwrap();

        let mut batch = ChangeBatch::new();
        batch
            .upsert(ChangeRecord::new("l-1", fp("changed")))
            .upsert(ChangeRecord::new("l-2", fp("b")))
            .upsert(ChangeRecord::new("l-3", fp("c")));

        assert!(log.apply_batch(batch).is_err());
        assert_eq!(log.len(), 1);
        assert_eq!(log.lookup_by_local_id("l-1").unwrap().fingerprint, fp("a"));
        assert_eq!(log.generation(), 0);
    }

    #[test]
    fn batch_bumps_generation_once() {
        let mut log = log(2);
        log.upsert(ChangeRecord::new("l-1", fp("a"))).unwrap();

        let mut batch = ChangeBatch::new();
        batch
            .remove("l-1")
            .upsert(ChangeRecord::new("l-2", fp("b")))
            .upsert(ChangeRecord::new("l-3", fp("c")));

        assert_eq!(log.apply_batch(batch).unwrap(), 1);
        assert_eq!(log.generation(), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.lookup_by_local_id("l-2").unwrap().modcount, 1);
    }

    #[test]
    fn batch_moving_an_item_to_a_new_local_id_fits_a_full_log() {
        let mut log = log(1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1"))
            .unwrap();

        let mut batch = ChangeBatch::new();
        batch
            .upsert(ChangeRecord::new("l-2", fp("b")).with_remote_id("r-1"))
            .remove("l-1");

        assert_eq!(log.apply_batch(batch).unwrap(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.lookup_by_remote_id("r-1").unwrap().local_id, "l-2");
        assert_eq!(
            log.memory_usage(),
            log.lookup_by_local_id("l-2").unwrap().footprint()
        );
    }

    #[test]
    fn purge_stale_deletions() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_flags(ChangeFlags::PENDING_DELETE))
            .unwrap();
        log.upsert(ChangeRecord::new("l-2", fp("b"))).unwrap();
        log.set_generation(5);
        log.upsert(ChangeRecord::new("l-3", fp("c")).with_flags(ChangeFlags::PENDING_DELETE))
            .unwrap();

        assert_eq!(log.purge_deleted(3), 1);
        assert!(log.lookup_by_local_id("l-1").is_none());
        assert!(log.lookup_by_local_id("l-2").is_some());
        assert!(log.lookup_by_local_id("l-3").is_some());
    }

    #[test]
    fn invalidate_and_reset() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a"))).unwrap();
        log.invalidate("explicit reset");

        assert!(!log.is_valid());
        assert_eq!(log.invalid_reason(), Some("explicit reset"));

        log.reset();
        assert!(log.is_valid());
        assert!(log.is_empty());
    }

    #[test]
    fn export_import_roundtrip() {
        let mut log = log(-1);
        log.upsert(ChangeRecord::new("l-1", fp("a")).with_remote_id("r-1"))
            .unwrap();
        log.upsert(ChangeRecord::new("l-2", fp("b")).with_flags(ChangeFlags::PENDING_ADD))
            .unwrap();
        log.set_generation(4);

        let snapshot = log.export_state();
        assert_eq!(snapshot.generation, 4);
        assert_eq!(snapshot.record_count(), 2);

        let mut restored = ChangeLog::new("contacts", CapacityConfig::default(), Span::none());
        restored.import_state(snapshot).unwrap();
        assert!(restored.is_valid());
        assert_eq!(restored.generation(), 4);
        assert_eq!(restored.lookup_by_remote_id("r-1").unwrap().local_id, "l-1");
        assert_eq!(restored.memory_usage(), log.memory_usage());
    }

    #[test]
    fn import_in_flight_snapshot_invalidates() {
        let mut snapshot = ChangeLogSnapshot::new("contacts");
        snapshot.in_flight = true;
        snapshot.add_record(ChangeRecord::new("l-1", fp("a")));

        let mut log = log(-1);
        log.import_state(snapshot).unwrap();
        assert!(!log.is_valid());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn import_rejects_other_datastore() {
        let mut log = log(-1);
        let result = log.import_state(ChangeLogSnapshot::new("calendar"));
        assert!(matches!(result, Err(Error::StoreInvalid(_))));
    }

    #[test]
    fn flags_bitset() {
        let mut flags = ChangeFlags::PENDING_ADD | ChangeFlags::CONFLICT;
        assert!(flags.contains(ChangeFlags::PENDING_ADD));
        assert!(!flags.contains(ChangeFlags::PENDING_DELETE));
        assert!(!flags.contains(ChangeFlags::NONE));

        flags.remove(ChangeFlags::PENDING_ADD);
        assert_eq!(flags, ChangeFlags::CONFLICT);
        flags.insert(ChangeFlags::PENDING_UPDATE);
        assert_eq!(flags.bits(), 0b1010);
        assert!(!flags.is_empty());
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn prop_lookup_by_either_key(ids in prop::collection::btree_set("[a-z0-9]{1,12}", 1..40)) {
                let mut log = log(-1);
                for id in &ids {
                    log.upsert(ChangeRecord::new(id.clone(), fp(id)).with_remote_id(format!("r-{}", id))).unwrap();
                }

                prop_assert_eq!(log.len(), ids.len());
                for id in &ids {
                    let by_local = log.lookup_by_local_id(id).cloned();
                    let by_remote = log.lookup_by_remote_id(&format!("r-{}", id)).cloned();
                    prop_assert!(by_local.is_some());
                    prop_assert_eq!(by_local, by_remote);
                }
            }

            #[test]
            fn prop_item_limit_is_exact(limit in 0usize..20) {
                let mut log = log(limit as i64);
                for i in 0..limit {
                    log.upsert(ChangeRecord::new(format!("l-{}", i), fp("x"))).unwrap();
                }
                let before: BTreeSet<String> = log.records().map(|r| r.local_id.clone()).collect();

                let result = log.upsert(ChangeRecord::new("one-too-many", fp("x")));
                let is_capacity_error = matches!(result, Err(Error::CapacityExceeded { .. }));
                prop_assert!(is_capacity_error);
                let after: BTreeSet<String> = log.records().map(|r| r.local_id.clone()).collect();
                prop_assert_eq!(before, after);
            }

            #[test]
            fn prop_snapshot_restores_log(ids in prop::collection::btree_set("[a-z]{1,8}", 0..30)) {
                let mut log = log(-1);
                let mut batch = ChangeBatch::new();
                for id in &ids {
                    batch.upsert(ChangeRecord::new(id.clone(), fp(id)).with_remote_id(id.to_uppercase()));
                }
                log.apply_batch(batch).unwrap();

                let bytes = log.export_state().to_bytes().unwrap();
                let mut restored = super::log(-1);
                restored.import_state(ChangeLogSnapshot::from_bytes(&bytes).unwrap()).unwrap();

                prop_assert_eq!(restored.generation(), 1);
                prop_assert_eq!(restored.len(), ids.len());
                prop_assert_eq!(restored.memory_usage(), log.memory_usage());
                for id in &ids {
                    prop_assert_eq!(restored.lookup_by_remote_id(&id.to_uppercase()), log.lookup_by_local_id(id));
                }
            }
        }
    }
}
