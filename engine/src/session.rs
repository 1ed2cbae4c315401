//! Sync sessions.
//!
//! An [`Engine`] owns the configuration shared by all sessions and hands out
//! one [`Session`] per datastore sync. A session walks a fixed state machine:
//!
//! ```text
//! Idle -> Comparing -> Planning -> Applying -> Committing -> Done
//!   \________\___________\___________\____________\-------> Error
//! ```
//!
//! The session holds the store lease from `begin_session` until it is
//! dropped. Nothing reaches the store before `apply`, which first persists
//! the old records with the in-flight marker set; `commit` then replaces
//! them atomically. A session dropped in between leaves the marker behind
//! and the next session falls back to slow sync.

use crate::{
    backend::{Backend, Side},
    changelog::{ChangeBatch, ChangeFlags, ChangeLog, ChangeRecord},
    classifier::{ClassifierRegistry, ScriptedCompare, ScriptedHook},
    config::{CapacityConfig, EngineConfig},
    error::Result,
    plan::{
        AppliedResult, EntryAction, ItemOutcome, ItemReport, OperationPlan, PlanEntry,
        SessionReport, SessionStatus, SyncMode,
    },
    reconcile::{ConflictResolver, Reconciler},
    snapshot::{ChangeLogSnapshot, SnapshotMetadata},
    storage::{ChangeLogStorage, FileStoreProvider, MemoryStoreProvider, StoreProvider},
    DatastoreId, EquivalenceClass, Error, Fingerprint, SyncOp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Comparing,
    Planning,
    Applying,
    Committing,
    Done,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Comparing)
            | (Comparing, Planning)
            | (Planning, Applying)
            | (Applying, Committing)
            | (Committing, Done) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Comparing => "comparing",
            SessionState::Planning => "planning",
            SessionState::Applying => "applying",
            SessionState::Committing => "committing",
            SessionState::Done => "done",
            SessionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Entry point shared by all sessions.
pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn StoreProvider>,
    registry: ClassifierRegistry,
    resolver: Arc<dyn ConflictResolver>,
    hook: Option<ScriptedHook>,
}

impl Engine {
    /// Create an engine over the given store provider, resolving conflicts
    /// with the configured strategy.
    pub fn new(config: EngineConfig, provider: Arc<dyn StoreProvider>) -> Self {
        let resolver: Arc<dyn ConflictResolver> = Arc::new(config.conflict_strategy);
        Self {
            config,
            provider,
            registry: ClassifierRegistry::with_defaults(),
            resolver,
            hook: None,
        }
    }

    /// Create an engine whose change logs live in `store_dir`, or in memory
    /// when no directory is configured.
    pub fn from_config(config: EngineConfig) -> Self {
        let provider: Arc<dyn StoreProvider> = match &config.store_dir {
            Some(dir) => Arc::new(FileStoreProvider::new(dir.clone())),
            None => Arc::new(MemoryStoreProvider::new()),
        };
        Self::new(config, provider)
    }

    /// Replace the classifier registry.
    pub fn with_registry(mut self, registry: ClassifierRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the configured strategy with a custom resolver.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Compare `Scripted` fields with this hook.
    pub fn with_scripted_compare<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, Option<&Value>, Option<&Value>, EquivalenceClass) -> bool
            + Send
            + Sync
            + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClassifierRegistry {
        &self.registry
    }

    /// Read-only summary of a datastore's saved change log.
    pub fn inspect(&self, datastore_id: &str) -> Result<Option<SnapshotMetadata>> {
        self.provider.inspect(datastore_id)
    }

    /// Begin a session with the configured default capacity.
    pub fn begin_default_session(&self, datastore_id: impl Into<DatastoreId>) -> Result<Session> {
        self.begin_session(datastore_id, self.config.capacity)
    }

    /// Take the store lease for a datastore and load its change log.
    ///
    /// A corrupt, outdated or interrupted change log does not fail the call;
    /// the session runs as a slow sync instead. Fails with `StoreLocked`
    /// while another session holds the datastore and with
    /// `CapacityExceeded` when the saved log is over the given limits.
    pub fn begin_session(
        &self,
        datastore_id: impl Into<DatastoreId>,
        capacity: CapacityConfig,
    ) -> Result<Session> {
        let datastore_id = datastore_id.into();
        capacity.validate()?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "sync_session",
            datastore = %datastore_id,
            session = %session_id
        );

        let mut storage = self.provider.open(&datastore_id, &capacity)?;
        let mut changelog = ChangeLog::new(datastore_id.clone(), capacity, span.clone());

        let first_time = match storage.load()? {
            None => true,
            Some(bytes) => {
                let loaded = ChangeLogSnapshot::from_bytes(&bytes)
                    .and_then(|snapshot| changelog.import_state(snapshot));
                match loaded {
                    Ok(()) => {}
                    Err(err) if err.forces_slow_sync() => {
                        tracing::warn!(parent: &span, error = %err, "change log not usable");
                        changelog.reset();
                        changelog.invalidate(err.to_string());
                    }
                    Err(err) => return Err(err),
                }
                false
            }
        };
        changelog.enforce_capacity()?;

        let mode = if first_time || !changelog.is_valid() {
            SyncMode::Slow
        } else {
            SyncMode::Incremental
        };
        tracing::info!(
            parent: &span,
            %mode,
            first_time,
            records = changelog.len(),
            generation = changelog.generation(),
            "session started"
        );

        Ok(Session {
            id: session_id,
            datastore_id,
            state: SessionState::Idle,
            mode,
            first_time,
            changelog,
            storage,
            registry: self.registry.clone(),
            resolver: Arc::clone(&self.resolver),
            hook: self.hook.clone(),
            compare_limit: self.config.slow_sync_compare_limit,
            delete_retention: self.config.delete_retention,
            plan: None,
            span,
        })
    }
}

/// One sync of one datastore.
pub struct Session {
    id: String,
    datastore_id: DatastoreId,
    state: SessionState,
    mode: SyncMode,
    first_time: bool,
    changelog: ChangeLog,
    storage: Box<dyn ChangeLogStorage>,
    registry: ClassifierRegistry,
    resolver: Arc<dyn ConflictResolver>,
    hook: Option<ScriptedHook>,
    compare_limit: Option<u64>,
    delete_retention: Option<u64>,
    plan: Option<OperationPlan>,
    span: Span,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn datastore_id(&self) -> &DatastoreId {
        &self.datastore_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// No change log existed for the datastore.
    pub fn is_first_time(&self) -> bool {
        self.first_time
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.changelog
    }

    /// The plan computed by [`reconcile`](Self::reconcile).
    pub fn plan(&self) -> Option<&OperationPlan> {
        self.plan.as_ref()
    }

    /// Ignore the change log and compare both sides in full.
    ///
    /// Only possible before reconciliation starts.
    pub fn force_slow_sync(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: "slow sync".into(),
            });
        }
        tracing::info!(parent: &self.span, "slow sync forced");
        self.changelog.invalidate("slow sync requested");
        self.mode = SyncMode::Slow;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(parent: &self.span, from = %self.state, to = %next, "state change");
        self.state = next;
        Ok(())
    }

    /// Move to `Error` and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        tracing::error!(parent: &self.span, state = %self.state, error = %err, "session failed");
        if !self.state.is_terminal() {
            self.state = SessionState::Error;
        }
        err
    }

    /// Compare both sides and plan the operations.
    pub fn reconcile(&mut self, backend: &mut dyn Backend) -> Result<&OperationPlan> {
        self.transition(SessionState::Comparing)?;

        let result = {
            let hook: Option<ScriptedCompare<'_>> =
                self.hook.as_deref().map(|hook| hook as ScriptedCompare<'_>);
            let mut reconciler = Reconciler::new(
                &self.changelog,
                &self.registry,
                self.resolver.as_ref(),
                &self.span,
            )
            .with_compare_limit(self.compare_limit);
            if let Some(hook) = hook {
                reconciler = reconciler.with_scripted_compare(hook);
            }
            reconciler.reconcile(backend, self.mode)
        };
        let plan = match result {
            Ok(plan) => plan,
            Err(err) => return Err(self.fail(err)),
        };

        self.transition(SessionState::Planning)?;
        if let Err(err) = self.check_plan_capacity(&plan) {
            return Err(self.fail(err));
        }
        tracing::info!(
            parent: &self.span,
            entries = plan.entries.len(),
            ops = plan.ops.len(),
            conflicts = plan.conflicts().count(),
            "plan ready"
        );
        Ok(&*self.plan.insert(plan))
    }

    /// Refuse plans whose new records would not fit the change log.
    fn check_plan_capacity(&self, plan: &OperationPlan) -> Result<()> {
        let (items, memory) = match self.mode {
            SyncMode::Slow => (0, 0),
            SyncMode::Incremental => (self.changelog.len(), self.changelog.memory_usage()),
        };
        let admitted: Vec<&PlanEntry> = plan.entries.iter().filter(|e| e.admits_record()).collect();
        let added_memory: usize = admitted
            .iter()
            .map(|entry| record_for(entry, Fingerprint::default()).footprint())
            .sum();
        self.changelog
            .check_capacity(items + admitted.len(), memory + added_memory)
    }

    /// Carry out the planned operations.
    ///
    /// Per-item failures are collected in the results; a fatal backend error
    /// stops the session.
    pub fn apply(&mut self, backend: &mut dyn Backend) -> Result<Vec<AppliedResult>> {
        self.transition(SessionState::Applying)?;
        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => return Err(self.fail(Error::InvalidStateTransition {
                from: SessionState::Idle.to_string(),
                to: SessionState::Applying.to_string(),
            })),
        };

        if !plan.ops.is_empty() {
            let mut marker = self.changelog.export_state();
            marker.in_flight = true;
            if let Err(err) = marker.to_bytes().and_then(|bytes| self.storage.save(&bytes)) {
                return Err(self.fail(err));
            }
        }

        let mut results = Vec::with_capacity(plan.ops.len());
        let mut fatal = None;
        for planned in &plan.ops {
            let result = backend.apply_operation(planned.side, &planned.item, planned.op);
            match &result {
                Ok(ack) => tracing::debug!(
                    parent: &self.span,
                    side = %planned.side,
                    op = %planned.op,
                    local_id = ?ack.local_id,
                    remote_id = ?ack.remote_id,
                    "operation applied"
                ),
                Err(err) => tracing::warn!(
                    parent: &self.span,
                    side = %planned.side,
                    op = %planned.op,
                    item = %planned.item.display_id(),
                    code = err.code,
                    error = %err.message,
                    fatal = err.fatal,
                    "operation failed"
                ),
            }
            if let Err(err) = &result {
                if err.fatal {
                    fatal = Some(Error::Backend {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
            }
            results.push(AppliedResult {
                entry: planned.entry,
                side: planned.side,
                op: planned.op,
                result,
            });
            if fatal.is_some() {
                break;
            }
        }

        self.plan = Some(plan);
        match fatal {
            Some(err) => Err(self.fail(err)),
            None => Ok(results),
        }
    }

    /// Record the outcome of `applied` in the change log, persist it, and
    /// tell the backend how the sync ended.
    ///
    /// If the snapshot cannot be written, the change log stays as it was
    /// before the session and the in-flight marker remains.
    pub fn commit(
        &mut self,
        backend: &mut dyn Backend,
        applied: Vec<AppliedResult>,
    ) -> Result<SessionReport> {
        self.transition(SessionState::Committing)?;
        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => return Err(self.fail(Error::InvalidStateTransition {
                from: SessionState::Idle.to_string(),
                to: SessionState::Committing.to_string(),
            })),
        };

        let mut by_entry: HashMap<usize, Vec<AppliedResult>> = HashMap::new();
        for result in applied {
            by_entry.entry(result.entry).or_default().push(result);
        }

        let mut batch = ChangeBatch::new();
        let mut outcomes = Vec::with_capacity(plan.entries.len());
        for (index, entry) in plan.entries.iter().enumerate() {
            let results = by_entry.remove(&index).unwrap_or_default();
            outcomes.push(self.settle_entry(&plan, index, entry, &results, &mut batch));
        }

        let status = if outcomes.iter().all(|o| {
            matches!(o.outcome, ItemOutcome::Applied { .. } | ItemOutcome::Unchanged)
        }) {
            SessionStatus::Success
        } else {
            SessionStatus::PartialSuccess
        };

        let mut staged = self.changelog.clone();
        if self.mode == SyncMode::Slow {
            staged.reset();
        }
        let generation = match staged.apply_batch(batch) {
            Ok(generation) => generation,
            Err(err) => return Err(self.fail(err)),
        };
        let purged = match self.delete_retention {
            Some(retention) => staged.purge_deleted(generation.saturating_sub(retention)),
            None => 0,
        };

        let snapshot = staged.export_state();
        if let Err(err) = snapshot.to_bytes().and_then(|bytes| self.storage.save(&bytes)) {
            return Err(self.fail(err));
        }
        self.changelog = staged;
        self.transition(SessionState::Done)?;

        if let Err(err) = backend.end_sync(status == SessionStatus::Success) {
            // The commit is durable; an unacknowledged feed is reported again
            tracing::warn!(parent: &self.span, code = err.code, error = %err.message, "end of sync not acknowledged");
        }

        let report = SessionReport {
            datastore_id: self.datastore_id.clone(),
            session_id: self.id.clone(),
            status,
            mode: self.mode,
            first_time: self.first_time,
            generation,
            outcomes,
            purged,
        };
        tracing::info!(
            parent: &self.span,
            ?status,
            generation,
            applied = report.applied_count(),
            unchanged = report.unchanged_count(),
            conflicts = report.conflict_count(),
            errors = report.error_count(),
            purged,
            "session committed"
        );
        Ok(report)
    }

    /// Work out the record change and report of one plan entry.
    fn settle_entry(
        &self,
        plan: &OperationPlan,
        index: usize,
        entry: &PlanEntry,
        results: &[AppliedResult],
        batch: &mut ChangeBatch,
    ) -> ItemReport {
        let planned: Vec<(Side, SyncOp)> = plan.ops_for(index).map(|op| (op.side, op.op)).collect();
        let succeeded = |side: Side, op: SyncOp| {
            results
                .iter()
                .find(|r| r.side == side && r.op == op)
                .and_then(|r| r.result.as_ref().ok())
        };
        let failed: Vec<(Side, SyncOp)> = planned
            .iter()
            .copied()
            .filter(|&(side, op)| succeeded(side, op).is_none())
            .collect();

        let mut local_id = entry.local_id.clone();
        let mut remote_id = entry.remote_id.clone();
        if let Some(ack) = succeeded(Side::Local, SyncOp::Add) {
            local_id = ack.local_id.clone().or(local_id);
        }
        if let Some(ack) = succeeded(Side::Remote, SyncOp::Add) {
            remote_id = ack.remote_id.clone().or(remote_id);
        }
        let report = |outcome: ItemOutcome| ItemReport {
            local_id: local_id.clone(),
            remote_id: remote_id.clone(),
            outcome,
        };

        match entry.action {
            EntryAction::Unchanged => return report(ItemOutcome::Unchanged),
            EntryAction::Forget => {
                if let Some(previous) = &entry.previous {
                    batch.remove(previous.local_id.clone());
                }
                return report(ItemOutcome::Applied { ops: Vec::new() });
            }
            EntryAction::Conflict => {
                let err = Error::ConflictUnresolved(entry.display_id());
                tracing::warn!(parent: &self.span, error = %err, "left for the next session");
                let flagged = match &entry.previous {
                    Some(previous) => Some(previous.clone()),
                    None => local_id.as_ref().map(|_| record_for(entry, Fingerprint::default())),
                };
                if let Some(mut record) = flagged {
                    record.flags.insert(ChangeFlags::CONFLICT);
                    batch.upsert(record);
                }
                return match &entry.conflict {
                    Some(conflict) => report(ItemOutcome::Conflict {
                        report: conflict.clone(),
                    }),
                    None => report(ItemOutcome::Unchanged),
                };
            }
            EntryAction::Sync => {}
        }

        if failed.is_empty() {
            if entry.deletes {
                let doomed = entry
                    .previous
                    .as_ref()
                    .map(|p| p.local_id.clone())
                    .or_else(|| local_id.clone());
                if let Some(doomed) = doomed {
                    batch.remove(doomed);
                }
            } else if let Some(local_id) = &local_id {
                let fingerprint = entry
                    .fingerprint
                    .or_else(|| entry.previous.as_ref().map(|p| p.fingerprint))
                    .unwrap_or_default();
                let mut record = ChangeRecord::new(local_id.clone(), fingerprint);
                record.remote_id = remote_id.clone();
                batch.upsert(record);
                retire_previous(entry, local_id, batch);
            }
            return if planned.is_empty() {
                report(ItemOutcome::Unchanged)
            } else {
                report(ItemOutcome::Applied { ops: planned })
            };
        }

        if let Some(record) = self.failed_record(entry, &planned, &failed, local_id.clone()) {
            let kept = record.local_id.clone();
            batch.upsert(record);
            retire_previous(entry, &kept, batch);
        }

        let (code, message) = results
            .iter()
            .find_map(|r| r.result.as_ref().err())
            .map(|err| (err.code, err.message.clone()))
            .unwrap_or((0, "operation was not applied".to_string()));
        let err = Error::BackendItem {
            item: entry.display_id(),
            code,
            message,
        };
        tracing::warn!(parent: &self.span, error = %err, "item not synced");
        report(ItemOutcome::Error {
            code,
            message: err.to_string(),
        })
    }

    /// Record left behind when some operations of an entry failed, so the
    /// next session retries them.
    fn failed_record(
        &self,
        entry: &PlanEntry,
        planned: &[(Side, SyncOp)],
        failed: &[(Side, SyncOp)],
        local_id: Option<String>,
    ) -> Option<ChangeRecord> {
        let remote_failure = failed.iter().find(|(side, _)| *side == Side::Remote);
        let local_done = planned
            .iter()
            .any(|p| p.0 == Side::Local && !failed.contains(p));
        let remote_done = planned
            .iter()
            .any(|p| p.0 == Side::Remote && !failed.contains(p));
        let fingerprint = entry
            .fingerprint
            .or_else(|| entry.previous.as_ref().map(|p| p.fingerprint))
            .unwrap_or_default();

        match remote_failure {
            Some((_, SyncOp::Delete)) => {
                let previous = entry.previous.clone()?;
                if previous.flags.contains(ChangeFlags::PENDING_DELETE) {
                    // Keep the original modcount so retention still applies
                    return None;
                }
                Some(previous.with_flags(ChangeFlags::PENDING_DELETE))
            }
            Some((_, SyncOp::Add)) => {
                let mut record = ChangeRecord::new(local_id?, fingerprint);
                record.flags = ChangeFlags::PENDING_ADD;
                Some(record)
            }
            Some(_) => {
                let mut record = match &entry.previous {
                    Some(previous) => previous.clone(),
                    None => record_for(entry, fingerprint),
                };
                if local_done {
                    record.fingerprint = fingerprint;
                }
                record.flags.insert(ChangeFlags::PENDING_UPDATE);
                Some(record)
            }
            None => {
                // Only local operations failed: have the next session re-check the pair
                let mut record = match (&entry.previous, &local_id) {
                    (Some(previous), _) => previous.clone(),
                    (None, Some(_)) if remote_done => record_for(entry, fingerprint),
                    _ => return None,
                };
                if remote_done && local_id.is_some() {
                    record.fingerprint = fingerprint;
                }
                record.flags.insert(ChangeFlags::CONFLICT);
                Some(record)
            }
        }
    }

    /// Reconcile, apply and commit in one go.
    ///
    /// On failure the backend is told the sync did not succeed.
    pub fn run(&mut self, backend: &mut dyn Backend) -> Result<SessionReport> {
        let result = self.run_steps(backend);
        if result.is_err() {
            if let Err(err) = backend.end_sync(false) {
                tracing::warn!(parent: &self.span, code = err.code, error = %err.message, "end of sync not acknowledged");
            }
        }
        result
    }

    fn run_steps(&mut self, backend: &mut dyn Backend) -> Result<SessionReport> {
        self.reconcile(backend)?;
        let applied = self.apply(backend)?;
        self.commit(backend, applied)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("datastore_id", &self.datastore_id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("first_time", &self.first_time)
            .field("records", &self.changelog.len())
            .finish()
    }
}

/// A fresh record carrying the entry's identity.
/// Drop the record an entry started from when the item now lives under
/// another local ID.
fn retire_previous(entry: &PlanEntry, local_id: &str, batch: &mut ChangeBatch) {
    if let Some(previous) = &entry.previous {
        if previous.local_id != local_id {
            batch.remove(previous.local_id.clone());
        }
    }
}

fn record_for(entry: &PlanEntry, fingerprint: Fingerprint) -> ChangeRecord {
    let mut record = ChangeRecord::new(entry.local_id.clone().unwrap_or_default(), fingerprint);
    record.remote_id = entry.remote_id.clone();
    record
}
