//! Backend contract and an in-memory reference backend.
//!
//! The engine never touches data itself. A [`Backend`] enumerates the local
//! datastore, reports what changed on the remote peer, and carries out the
//! operations the engine planned on either side.

use crate::{Item, LocalId, RemoteId, SyncOp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which side of the sync an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// Which remote changes to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeScope {
    /// Changes since the last successful sync
    Incremental,
    /// Every remote item, reported as changed
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteChangeKind {
    Changed,
    Deleted,
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub remote_id: RemoteId,
    pub kind: RemoteChangeKind,
}

impl RemoteChange {
    pub fn changed(remote_id: impl Into<RemoteId>) -> Self {
        Self {
            remote_id: remote_id.into(),
            kind: RemoteChangeKind::Changed,
        }
    }

    pub fn deleted(remote_id: impl Into<RemoteId>) -> Self {
        Self {
            remote_id: remote_id.into(),
            kind: RemoteChangeKind::Deleted,
        }
    }
}

/// Identity reported back after an operation succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<RemoteId>,
}

impl Ack {
    pub fn new(local_id: Option<LocalId>, remote_id: Option<RemoteId>) -> Self {
        Self {
            local_id,
            remote_id,
        }
    }
}

/// Failure reported by a backend.
///
/// `fatal` errors abort the session; all others only fail the item.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct BackendError {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

impl BackendError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
        }
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(404, format!("item '{}' not found", id))
    }
}

/// Stream of local items. An `Err` ends the enumeration.
pub type LocalItems<'a> = Box<dyn Iterator<Item = Result<Item, BackendError>> + 'a>;

/// Data access used by a sync session.
pub trait Backend {
    /// Every item of the local datastore, in a stable order.
    fn enumerate_local_items(&mut self) -> LocalItems<'_>;

    /// The remote change feed for the requested scope.
    fn remote_changes(&mut self, scope: ChangeScope) -> Result<Vec<RemoteChange>, BackendError>;

    /// Current remote copy of an item; `None` if it no longer exists.
    fn fetch_remote_item(&mut self, remote_id: &str) -> Result<Option<Item>, BackendError>;

    /// Carry out one planned operation on one side.
    fn apply_operation(&mut self, side: Side, item: &Item, op: SyncOp) -> Result<Ack, BackendError>;

    /// Called once after commit (or failure) so the backend can advance or
    /// keep its change feed.
    fn end_sync(&mut self, _success: bool) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Insertion ordered item table.
#[derive(Debug, Clone, Default)]
struct ItemTable {
    items: HashMap<String, Item>,
    order: Vec<String>,
}

impl ItemTable {
    fn insert(&mut self, id: String, item: Item) {
        if self.items.insert(id.clone(), item).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Item> {
        let item = self.items.remove(id)?;
        self.order.retain(|k| k != id);
        Some(item)
    }

    fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Item> {
        self.items.get_mut(id)
    }

    fn iter(&self) -> impl Iterator<Item = &Item> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    side: Side,
    op: SyncOp,
    error: BackendError,
}

/// Backend simulating both the local datastore and the remote peer in
/// memory.
///
/// Items are enumerated in insertion order. Edits made through the
/// `*_remote` methods feed the remote change feed; operations the engine
/// applies to the remote side do not.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    local: ItemTable,
    remote: ItemTable,
    remote_feed: Vec<RemoteChange>,
    next_local: u64,
    next_remote: u64,
    enumeration_fails_after: Option<usize>,
    failures: Vec<InjectedFailure>,
    applied: Vec<(Side, SyncOp, String)>,
    last_end_sync: Option<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_local_id(&mut self) -> LocalId {
        self.next_local += 1;
        format!("L{}", self.next_local)
    }

    fn assign_remote_id(&mut self) -> RemoteId {
        self.next_remote += 1;
        format!("R{}", self.next_remote)
    }

    fn record_remote_change(&mut self, change: RemoteChange) {
        self.remote_feed.retain(|c| c.remote_id != change.remote_id);
        self.remote_feed.push(change);
    }

    /// Add an item to the local datastore, assigning a local ID if it has
    /// none.
    pub fn insert_local(&mut self, mut item: Item) -> LocalId {
        let id = match item.local_id.clone() {
            Some(id) => id,
            None => self.assign_local_id(),
        };
        item.local_id = Some(id.clone());
        item.set_operation(SyncOp::None);
        self.local.insert(id.clone(), item);
        id
    }

    /// Edit a local item in place. Returns false if it does not exist.
    pub fn edit_local(&mut self, local_id: &str, edit: impl FnOnce(&mut Item)) -> bool {
        match self.local.get_mut(local_id) {
            Some(item) => {
                edit(item);
                true
            }
            None => false,
        }
    }

    pub fn delete_local(&mut self, local_id: &str) -> Option<Item> {
        self.local.remove(local_id)
    }

    /// Add an item on the remote peer and report it in the change feed.
    pub fn insert_remote(&mut self, mut item: Item) -> RemoteId {
        let id = match item.remote_id.clone() {
            Some(id) => id,
            None => self.assign_remote_id(),
        };
        item.remote_id = Some(id.clone());
        item.local_id = None;
        item.set_operation(SyncOp::None);
        self.remote.insert(id.clone(), item);
        self.record_remote_change(RemoteChange::changed(id.clone()));
        id
    }

    /// Edit a remote item in place and report it in the change feed.
    pub fn edit_remote(&mut self, remote_id: &str, edit: impl FnOnce(&mut Item)) -> bool {
        match self.remote.get_mut(remote_id) {
            Some(item) => {
                edit(item);
                self.record_remote_change(RemoteChange::changed(remote_id));
                true
            }
            None => false,
        }
    }

    /// Delete a remote item and report it in the change feed.
    pub fn delete_remote(&mut self, remote_id: &str) -> Option<Item> {
        let item = self.remote.remove(remote_id)?;
        self.record_remote_change(RemoteChange::deleted(remote_id));
        Some(item)
    }

    pub fn local_item(&self, local_id: &str) -> Option<&Item> {
        self.local.get(local_id)
    }

    pub fn remote_item(&self, remote_id: &str) -> Option<&Item> {
        self.remote.get(remote_id)
    }

    pub fn local_items(&self) -> impl Iterator<Item = &Item> {
        self.local.iter()
    }

    pub fn remote_items(&self) -> impl Iterator<Item = &Item> {
        self.remote.iter()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Pending entries of the remote change feed.
    pub fn pending_remote_changes(&self) -> &[RemoteChange] {
        &self.remote_feed
    }

    /// Operations applied so far as `(side, op, id)`.
    pub fn applied_operations(&self) -> &[(Side, SyncOp, String)] {
        &self.applied
    }

    pub fn clear_applied(&mut self) {
        self.applied.clear();
    }

    /// `success` flag of the last `end_sync` call.
    pub fn last_end_sync(&self) -> Option<bool> {
        self.last_end_sync
    }

    /// Make local enumeration fail after yielding `count` items.
    pub fn fail_enumeration_after(&mut self, count: Option<usize>) {
        self.enumeration_fails_after = count;
    }

    /// Fail the next operation matching `side` and `op` with `error`.
    pub fn inject_failure(&mut self, side: Side, op: SyncOp, error: BackendError) {
        self.failures.push(InjectedFailure { side, op, error });
    }

    fn take_failure(&mut self, side: Side, op: SyncOp) -> Option<BackendError> {
        let index = self
            .failures
            .iter()
            .position(|f| f.side == side && f.op == op)?;
        Some(self.failures.remove(index).error)
    }

    fn apply_remote(&mut self, item: &Item, op: SyncOp) -> Result<Ack, BackendError> {
        match op {
            SyncOp::Add => {
                let remote_id = self.assign_remote_id();
                let mut stored = item.clone();
                stored.local_id = None;
                stored.remote_id = Some(remote_id.clone());
                stored.set_operation(SyncOp::None);
                self.remote.insert(remote_id.clone(), stored);
                Ok(Ack::new(item.local_id.clone(), Some(remote_id)))
            }
            SyncOp::Replace => {
                let remote_id = item
                    .remote_id
                    .clone()
                    .ok_or_else(|| BackendError::new(400, "replace without remote ID"))?;
                let stored = self
                    .remote
                    .get_mut(&remote_id)
                    .ok_or_else(|| BackendError::not_found(&remote_id))?;
                stored.replace_data_from(item);
                Ok(Ack::new(item.local_id.clone(), Some(remote_id)))
            }
            SyncOp::Delete => {
                let remote_id = item
                    .remote_id
                    .clone()
                    .ok_or_else(|| BackendError::new(400, "delete without remote ID"))?;
                // Already gone counts as deleted
                self.remote.remove(&remote_id);
                Ok(Ack::new(item.local_id.clone(), Some(remote_id)))
            }
            other => Err(BackendError::new(
                400,
                format!("unsupported operation '{}'", other),
            )),
        }
    }

    fn apply_local(&mut self, item: &Item, op: SyncOp) -> Result<Ack, BackendError> {
        match op {
            SyncOp::Add => {
                let local_id = self.assign_local_id();
                let mut stored = item.clone();
                stored.local_id = Some(local_id.clone());
                stored.set_operation(SyncOp::None);
                self.local.insert(local_id.clone(), stored);
                Ok(Ack::new(Some(local_id), item.remote_id.clone()))
            }
            SyncOp::Replace => {
                let local_id = item
                    .local_id
                    .clone()
                    .ok_or_else(|| BackendError::new(400, "replace without local ID"))?;
                let stored = self
                    .local
                    .get_mut(&local_id)
                    .ok_or_else(|| BackendError::not_found(&local_id))?;
                stored.replace_data_from(item);
                if item.remote_id.is_some() {
                    stored.remote_id = item.remote_id.clone();
                }
                Ok(Ack::new(Some(local_id), item.remote_id.clone()))
            }
            SyncOp::Delete => {
                let local_id = item
                    .local_id
                    .clone()
                    .ok_or_else(|| BackendError::new(400, "delete without local ID"))?;
                self.local.remove(&local_id);
                Ok(Ack::new(Some(local_id), item.remote_id.clone()))
            }
            other => Err(BackendError::new(
                400,
                format!("unsupported operation '{}'", other),
            )),
        }
    }
}

impl Backend for MemoryBackend {
    fn enumerate_local_items(&mut self) -> LocalItems<'_> {
        let limit = self.enumeration_fails_after;
        let items = self.local.iter().cloned().enumerate().map(move |(i, item)| {
            match limit {
                Some(limit) if i >= limit => {
                    Err(BackendError::new(503, "local enumeration interrupted"))
                }
                _ => Ok(item),
            }
        });
        match limit {
            // Stop right after the failure, like a broken cursor
            Some(limit) => Box::new(items.take(limit + 1)),
            None => Box::new(items),
        }
    }

    fn remote_changes(&mut self, scope: ChangeScope) -> Result<Vec<RemoteChange>, BackendError> {
        Ok(match scope {
            ChangeScope::Incremental => self.remote_feed.clone(),
            ChangeScope::All => self
                .remote
                .order
                .iter()
                .map(|id| RemoteChange::changed(id.clone()))
                .collect(),
        })
    }

    fn fetch_remote_item(&mut self, remote_id: &str) -> Result<Option<Item>, BackendError> {
        Ok(self.remote.get(remote_id).cloned())
    }

    fn apply_operation(&mut self, side: Side, item: &Item, op: SyncOp) -> Result<Ack, BackendError> {
        if let Some(error) = self.take_failure(side, op) {
            return Err(error);
        }
        let ack = match side {
            Side::Remote => self.apply_remote(item, op)?,
            Side::Local => self.apply_local(item, op)?,
        };
        let id = match side {
            Side::Local => ack.local_id.clone(),
            Side::Remote => ack.remote_id.clone(),
        };
        self.applied.push((side, op, id.unwrap_or_default()));
        Ok(ack)
    }

    fn end_sync(&mut self, success: bool) -> Result<(), BackendError> {
        if success {
            self.remote_feed.clear();
        }
        self.last_end_sync = Some(success);
        Ok(())
    }
}
