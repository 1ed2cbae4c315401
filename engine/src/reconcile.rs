//! Reconciliation of the local datastore against the remote peer.
//!
//! The [`Reconciler`] turns the current state of both sides into an
//! [`OperationPlan`]. It runs in one of two modes:
//!
//! - **Incremental**: the change log is trusted. Local changes are found by
//!   comparing fingerprints against the stored ones, remote changes come from
//!   the backend's change feed, and local items missing from the enumeration
//!   are deletions.
//! - **Slow**: the change log is ignored. Every local item is matched
//!   against the full remote set at the `SlowSync` equivalence level;
//!   nothing is ever deleted.
//!
//! Wherever both copies of an item changed, the copies are compared at the
//! `Conflict` level. Matching copies are merged; the rest go to a
//! [`ConflictResolver`].

use crate::{
    backend::{Backend, BackendError, ChangeScope, RemoteChange, RemoteChangeKind, Side},
    changelog::{ChangeFlags, ChangeLog, ChangeRecord},
    classifier::{ClassifierRegistry, FieldMismatch, ItemClassifier, ScriptedCompare},
    config::ConfigError,
    error::Result,
    plan::{
        ConflictOutcome, ConflictReport, EntryAction, IdentityMatch, MatchKind, OperationPlan,
        PlanEntry, SyncMode,
    },
    ContentType, EquivalenceClass, Error, Fingerprint, Item, LocalId, RemoteId, SyncOp,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::Span;

/// Decision of a [`ConflictResolver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The local copy (or its absence) is written to the remote
    LocalWins,
    /// The remote copy (or its absence) is written locally
    RemoteWins,
    /// This content is written to both sides
    Merged(Item),
    /// Both sides stay untouched; the conflict is reported and re-checked
    /// next session
    Unresolved,
}

/// A conflict presented to a resolver. At most one side is absent, meaning
/// it was deleted while the other was changed.
#[derive(Debug, Clone, Copy)]
pub struct ConflictCase<'a> {
    pub local: Option<&'a Item>,
    pub remote: Option<&'a Item>,
    pub mismatches: &'a [FieldMismatch],
    pub classifier: &'a ItemClassifier,
}

/// Policy deciding conflicting concurrent edits.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, case: &ConflictCase<'_>) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConflictCase<'_>) -> Resolution + Send + Sync,
{
    fn resolve(&self, case: &ConflictCase<'_>) -> Resolution {
        self(case)
    }
}

/// Built-in conflict policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Leave both sides alone and report the conflict (default)
    #[default]
    Surface,
    /// Newer `modified_at` wins; a missing timestamp loses, ties go remote
    LastWriterWins,
    LocalWins,
    RemoteWins,
}

impl std::str::FromStr for ConflictStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "surface" => Ok(ConflictStrategy::Surface),
            "last-writer-wins" | "lww" => Ok(ConflictStrategy::LastWriterWins),
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" => Ok(ConflictStrategy::RemoteWins),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

impl ConflictResolver for ConflictStrategy {
    fn resolve(&self, case: &ConflictCase<'_>) -> Resolution {
        match self {
            ConflictStrategy::Surface => Resolution::Unresolved,
            ConflictStrategy::LocalWins => Resolution::LocalWins,
            ConflictStrategy::RemoteWins => Resolution::RemoteWins,
            ConflictStrategy::LastWriterWins => match (case.local, case.remote) {
                (Some(_), None) => Resolution::LocalWins,
                (None, Some(_)) => Resolution::RemoteWins,
                (Some(local), Some(remote)) => match (local.modified_at, remote.modified_at) {
                    (Some(l), Some(r)) if l > r => Resolution::LocalWins,
                    (Some(_), None) => Resolution::LocalWins,
                    _ => Resolution::RemoteWins,
                },
                (None, None) => Resolution::Unresolved,
            },
        }
    }
}

fn backend_error(context: &str, err: BackendError) -> Error {
    Error::Backend {
        code: err.code,
        message: format!("{}: {}", context, err.message),
    }
}

/// Computes the operation plan of one session.
pub struct Reconciler<'a> {
    changelog: &'a ChangeLog,
    registry: &'a ClassifierRegistry,
    resolver: &'a dyn ConflictResolver,
    hook: Option<ScriptedCompare<'a>>,
    compare_limit: Option<u64>,
    span: Span,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        changelog: &'a ChangeLog,
        registry: &'a ClassifierRegistry,
        resolver: &'a dyn ConflictResolver,
        span: &Span,
    ) -> Self {
        Self {
            changelog,
            registry,
            resolver,
            hook: None,
            compare_limit: None,
            span: span.clone(),
        }
    }

    /// Compare `Scripted` fields with this hook.
    pub fn with_scripted_compare(mut self, hook: ScriptedCompare<'a>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Abort pairwise slow sync after `limit` comparisons.
    pub fn with_compare_limit(mut self, limit: Option<u64>) -> Self {
        self.compare_limit = limit;
        self
    }

    /// Build the plan for the given mode.
    pub fn reconcile(&self, backend: &mut dyn Backend, mode: SyncMode) -> Result<OperationPlan> {
        let mut plan = match mode {
            SyncMode::Incremental => self.incremental(backend)?,
            SyncMode::Slow => self.slow(backend)?,
        };
        plan.sort();
        tracing::debug!(
            parent: &self.span,
            %mode,
            entries = plan.entries.len(),
            ops = plan.ops.len(),
            "plan computed"
        );
        Ok(plan)
    }

    fn classifier(&self, content_type: ContentType) -> Result<&'a ItemClassifier> {
        self.registry.get(content_type)
    }

    fn fingerprint(&self, item: &Item) -> Result<Fingerprint> {
        Ok(Fingerprint::of(item, self.classifier(item.content_type)?))
    }

    /// Read the whole local enumeration. A failure part way through aborts
    /// the comparison; trusting a partial list would turn every missing
    /// item into a deletion.
    fn collect_local(&self, backend: &mut dyn Backend) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for result in backend.enumerate_local_items() {
            let mut item = result.map_err(|e| {
                tracing::warn!(
                    parent: &self.span,
                    code = e.code,
                    error = %e.message,
                    "local enumeration failed"
                );
                backend_error("local enumeration failed", e)
            })?;
            if item.local_id.is_none() {
                return Err(Error::Backend {
                    code: 400,
                    message: "local enumeration returned an item without local ID".into(),
                });
            }
            item.set_operation(SyncOp::None);
            items.push(item);
        }
        Ok(items)
    }

    fn remote_changes(
        &self,
        backend: &mut dyn Backend,
        scope: ChangeScope,
    ) -> Result<Vec<RemoteChange>> {
        backend
            .remote_changes(scope)
            .map_err(|e| backend_error("remote change feed failed", e))
    }

    fn fetch(&self, backend: &mut dyn Backend, remote_id: &str) -> Result<Option<Item>> {
        let fetched = backend
            .fetch_remote_item(remote_id)
            .map_err(|e| backend_error(&format!("fetching '{}' failed", remote_id), e))?;
        Ok(fetched.map(|mut item| {
            item.local_id = None;
            item.remote_id = Some(remote_id.to_string());
            item.set_operation(SyncOp::None);
            item
        }))
    }

    fn incremental(&self, backend: &mut dyn Backend) -> Result<OperationPlan> {
        let mut plan = OperationPlan::new(SyncMode::Incremental);
        let locals = self.collect_local(backend)?;
        let changes = self.remote_changes(backend, ChangeScope::Incremental)?;

        let remote_kinds: HashMap<&str, RemoteChangeKind> = changes
            .iter()
            .map(|c| (c.remote_id.as_str(), c.kind))
            .collect();
        let mut consumed: HashSet<RemoteId> = HashSet::new();
        let mut seen: HashSet<LocalId> = HashSet::new();

        for mut local in locals {
            let local_id = local.local_id.clone().unwrap_or_default();
            seen.insert(local_id.clone());
            let fingerprint = self.fingerprint(&local)?;

            let record = match self.changelog.lookup_by_local_id(&local_id) {
                Some(record) => record.clone(),
                None => {
                    tracing::debug!(parent: &self.span, item = %local_id, "new local item");
                    local.remote_id = None;
                    let entry = PlanEntry::new(Some(local_id), None, EntryAction::Sync)
                        .with_fingerprint(fingerprint);
                    let idx = plan.push_entry(entry);
                    plan.push_op(idx, Side::Remote, SyncOp::Add, local);
                    continue;
                }
            };

            let remote_id = match record.remote_id.clone() {
                Some(remote_id) => remote_id,
                None => {
                    // Never acknowledged by the remote: retry the add
                    local.remote_id = None;
                    let entry = PlanEntry::new(Some(local_id), None, EntryAction::Sync)
                        .with_fingerprint(fingerprint)
                        .with_previous(Some(record));
                    let idx = plan.push_entry(entry);
                    plan.push_op(idx, Side::Remote, SyncOp::Add, local);
                    continue;
                }
            };
            local.remote_id = Some(remote_id.clone());
            consumed.insert(remote_id.clone());

            let local_changed = fingerprint != record.fingerprint
                || record.flags.contains(ChangeFlags::PENDING_UPDATE);
            let recheck = record.flags.contains(ChangeFlags::CONFLICT);
            let remote_kind = remote_kinds.get(remote_id.as_str()).copied();

            let remote = match remote_kind {
                Some(RemoteChangeKind::Deleted) => None,
                Some(RemoteChangeKind::Changed) => self.fetch(backend, &remote_id)?,
                None if recheck => self.fetch(backend, &remote_id)?,
                None => {
                    let entry = PlanEntry::new(
                        Some(local_id.clone()),
                        Some(remote_id),
                        EntryAction::Unchanged,
                    )
                    .with_fingerprint(fingerprint)
                    .with_previous(Some(record.clone()));
                    if local_changed {
                        let mut entry = entry;
                        entry.action = EntryAction::Sync;
                        let idx = plan.push_entry(entry);
                        plan.push_op(idx, Side::Remote, SyncOp::Replace, local);
                    } else if record.flags.is_empty() {
                        plan.push_entry(entry);
                    } else {
                        // Clear stale flags without touching either side
                        let mut entry = entry;
                        entry.action = EntryAction::Sync;
                        plan.push_entry(entry);
                    }
                    continue;
                }
            };

            match remote {
                None if local_changed => {
                    tracing::debug!(parent: &self.span, item = %local_id, "changed locally, deleted remotely");
                    self.resolve_conflict(
                        &mut plan,
                        Some(local),
                        None,
                        Vec::new(),
                        Some(record),
                        Some(local_id),
                        Some(remote_id),
                    )?;
                }
                None => {
                    let mut entry = PlanEntry::new(
                        Some(local_id),
                        Some(remote_id),
                        EntryAction::Sync,
                    )
                    .with_previous(Some(record));
                    entry.deletes = true;
                    let idx = plan.push_entry(entry);
                    plan.push_op(idx, Side::Local, SyncOp::Delete, local);
                }
                Some(remote) if local_changed || recheck => {
                    self.converge_pair(&mut plan, local, remote, Some(record))?;
                }
                Some(remote) => {
                    let remote_fp = self.fingerprint(&remote)?;
                    let mut entry = PlanEntry::new(
                        Some(local_id),
                        Some(remote_id),
                        EntryAction::Sync,
                    )
                    .with_fingerprint(remote_fp)
                    .with_previous(Some(record));
                    if remote_fp == fingerprint && entry_is_clean(&entry) {
                        entry.action = EntryAction::Unchanged;
                        plan.push_entry(entry);
                    } else if remote_fp == fingerprint {
                        plan.push_entry(entry);
                    } else {
                        let idx = plan.push_entry(entry);
                        local.replace_data_from(&remote);
                        plan.push_op(idx, Side::Local, SyncOp::Replace, local);
                    }
                }
            }
        }

        // Records whose local item is gone: local deletions
        let mut missing: Vec<&ChangeRecord> = self
            .changelog
            .records()
            .filter(|r| !seen.contains(&r.local_id))
            .collect();
        missing.sort_by(|a, b| a.local_id.cmp(&b.local_id));

        for record in missing {
            let record = record.clone();
            let local_id = record.local_id.clone();
            let remote_id = match record.remote_id.clone() {
                Some(remote_id) => remote_id,
                None => {
                    // Never uploaded, nothing to delete remotely
                    plan.push_entry(
                        PlanEntry::new(Some(local_id), None, EntryAction::Forget)
                            .with_previous(Some(record)),
                    );
                    continue;
                }
            };
            consumed.insert(remote_id.clone());

            let remote_kind = remote_kinds.get(remote_id.as_str()).copied();
            if remote_kind == Some(RemoteChangeKind::Deleted) {
                plan.push_entry(
                    PlanEntry::new(Some(local_id), Some(remote_id), EntryAction::Forget)
                        .with_previous(Some(record)),
                );
                continue;
            }

            let remote = match self.fetch(backend, &remote_id)? {
                Some(remote) => remote,
                None => {
                    plan.push_entry(
                        PlanEntry::new(Some(local_id), Some(remote_id), EntryAction::Forget)
                            .with_previous(Some(record)),
                    );
                    continue;
                }
            };

            let remote_changed = remote_kind == Some(RemoteChangeKind::Changed)
                || record.flags.contains(ChangeFlags::CONFLICT);
            if remote_changed {
                tracing::debug!(parent: &self.span, item = %local_id, "deleted locally, changed remotely");
                self.resolve_conflict(
                    &mut plan,
                    None,
                    Some(remote),
                    Vec::new(),
                    Some(record),
                    Some(local_id),
                    Some(remote_id),
                )?;
            } else {
                let mut entry =
                    PlanEntry::new(Some(local_id), Some(remote_id), EntryAction::Sync)
                        .with_previous(Some(record));
                entry.deletes = true;
                let idx = plan.push_entry(entry);
                plan.push_op(idx, Side::Remote, SyncOp::Delete, remote);
            }
        }

        // Remote changes nobody claimed: new remote items
        for change in &changes {
            if consumed.contains(&change.remote_id) || change.kind == RemoteChangeKind::Deleted {
                continue;
            }
            if self.changelog.lookup_by_remote_id(&change.remote_id).is_some() {
                continue;
            }
            if let Some(remote) = self.fetch(backend, &change.remote_id)? {
                tracing::debug!(parent: &self.span, remote_id = %change.remote_id, "new remote item");
                self.push_remote_add(&mut plan, remote)?;
            }
        }

        Ok(plan)
    }

    fn slow(&self, backend: &mut dyn Backend) -> Result<OperationPlan> {
        let mut plan = OperationPlan::new(SyncMode::Slow);
        let locals = self.collect_local(backend)?;

        let mut remotes: Vec<Item> = Vec::new();
        for change in self.remote_changes(backend, ChangeScope::All)? {
            if change.kind == RemoteChangeKind::Deleted {
                continue;
            }
            if let Some(item) = self.fetch(backend, &change.remote_id)? {
                remotes.push(item);
            }
        }

        let mut taken = vec![false; remotes.len()];
        let mut paired: HashMap<usize, (usize, MatchKind)> = HashMap::new();

        // Pair items whose remote ID the local backend already knows
        let by_id: HashMap<&str, usize> = remotes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.remote_id.as_deref().map(|id| (id, i)))
            .collect();
        let mut pending = Vec::new();
        for (li, local) in locals.iter().enumerate() {
            let direct = local
                .remote_id
                .as_deref()
                .and_then(|id| by_id.get(id).copied())
                .filter(|&ri| !taken[ri] && remotes[ri].content_type == local.content_type);
            match direct {
                Some(ri) => {
                    taken[ri] = true;
                    paired.insert(li, (ri, MatchKind::RemoteId));
                }
                None => pending.push(li),
            }
        }

        // Content matching, first remote candidate in enumeration order wins
        let mut index: HashMap<(ContentType, String), VecDeque<usize>> = HashMap::new();
        for (ri, remote) in remotes.iter().enumerate() {
            if taken[ri] {
                continue;
            }
            let classifier = self.classifier(remote.content_type)?;
            if self.uses_index(classifier) {
                index
                    .entry((
                        remote.content_type,
                        classifier.match_key(remote, EquivalenceClass::SlowSync),
                    ))
                    .or_default()
                    .push_back(ri);
            }
        }

        let mut comparisons: u64 = 0;
        for li in pending {
            let local = &locals[li];
            let classifier = self.classifier(local.content_type)?;
            let found = if self.uses_index(classifier) {
                let key = (
                    local.content_type,
                    classifier.match_key(local, EquivalenceClass::SlowSync),
                );
                index.get_mut(&key).and_then(VecDeque::pop_front)
            } else {
                let mut found = None;
                for (ri, remote) in remotes.iter().enumerate() {
                    if taken[ri] || remote.content_type != local.content_type {
                        continue;
                    }
                    comparisons += 1;
                    if let Some(limit) = self.compare_limit {
                        if comparisons > limit {
                            tracing::warn!(parent: &self.span, limit, "slow sync comparison limit hit");
                            return Err(Error::SlowSyncLimit(limit));
                        }
                    }
                    if classifier
                        .compare(local, remote, EquivalenceClass::SlowSync, self.hook)
                        .is_match()
                    {
                        found = Some(ri);
                        break;
                    }
                }
                found
            };
            if let Some(ri) = found {
                taken[ri] = true;
                paired.insert(li, (ri, MatchKind::Content));
            }
        }

        for (li, mut local) in locals.into_iter().enumerate() {
            match paired.get(&li) {
                Some(&(ri, kind)) => {
                    let remote = remotes[ri].clone();
                    let local_id = local.local_id.clone().unwrap_or_default();
                    let remote_id = remote.remote_id.clone().unwrap_or_default();
                    tracing::debug!(
                        parent: &self.span,
                        %local_id,
                        %remote_id,
                        ?kind,
                        "slow sync pair"
                    );
                    plan.matches.push(IdentityMatch {
                        local_id,
                        remote_id,
                        kind,
                    });
                    self.converge_pair(&mut plan, local, remote, None)?;
                }
                None => {
                    local.remote_id = None;
                    let fingerprint = self.fingerprint(&local)?;
                    let entry = PlanEntry::new(local.local_id.clone(), None, EntryAction::Sync)
                        .with_fingerprint(fingerprint);
                    let idx = plan.push_entry(entry);
                    plan.push_op(idx, Side::Remote, SyncOp::Add, local);
                }
            }
        }

        for (ri, remote) in remotes.into_iter().enumerate() {
            if !taken[ri] {
                self.push_remote_add(&mut plan, remote)?;
            }
        }

        Ok(plan)
    }

    /// Hash matching gives the same answer as pairwise comparison unless a
    /// scripted hook takes part.
    fn uses_index(&self, classifier: &ItemClassifier) -> bool {
        self.hook.is_none() || !classifier.has_scripted_fields()
    }

    fn push_remote_add(&self, plan: &mut OperationPlan, remote: Item) -> Result<()> {
        let fingerprint = self.fingerprint(&remote)?;
        let entry = PlanEntry::new(None, remote.remote_id.clone(), EntryAction::Sync)
            .with_fingerprint(fingerprint);
        let idx = plan.push_entry(entry);
        plan.push_op(idx, Side::Local, SyncOp::Add, remote);
        Ok(())
    }

    /// Both copies exist and may differ: merge when the conflict-relevant
    /// fields agree, otherwise ask the resolver.
    fn converge_pair(
        &self,
        plan: &mut OperationPlan,
        local: Item,
        remote: Item,
        previous: Option<ChangeRecord>,
    ) -> Result<()> {
        let classifier = self.classifier(local.content_type)?;
        let local_id = local.local_id.clone();
        let remote_id = remote.remote_id.clone();

        let comparison = classifier.compare(&local, &remote, EquivalenceClass::Conflict, self.hook);
        let mergeable = comparison.mismatches.iter().all(|m| {
            m.class != EquivalenceClass::Always
                && classifier.content_type.merges_missing_fields()
                && (absent(local.field(&m.field)) || absent(remote.field(&m.field)))
        });
        if !comparison.is_match() && !mergeable {
            tracing::debug!(
                parent: &self.span,
                item = ?local_id,
                fields = ?comparison.fields(),
                "conflicting changes"
            );
            return self.resolve_conflict(
                plan,
                Some(local),
                Some(remote),
                comparison.mismatches,
                previous,
                local_id,
                remote_id,
            );
        }

        let mut merged = classifier.merge(&local, &remote);
        merged.local_id = local_id.clone();
        merged.remote_id = remote_id.clone();
        let merged_fp = Fingerprint::of(&merged, classifier);

        let entry = PlanEntry::new(local_id, remote_id, EntryAction::Sync)
            .with_fingerprint(merged_fp)
            .with_previous(previous);
        let idx = plan.push_entry(entry);
        if Fingerprint::of(&remote, classifier) != merged_fp {
            plan.push_op(idx, Side::Remote, SyncOp::Replace, merged.clone());
        }
        if Fingerprint::of(&local, classifier) != merged_fp {
            plan.push_op(idx, Side::Local, SyncOp::Replace, merged);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_conflict(
        &self,
        plan: &mut OperationPlan,
        local: Option<Item>,
        remote: Option<Item>,
        mismatches: Vec<FieldMismatch>,
        previous: Option<ChangeRecord>,
        local_id: Option<LocalId>,
        remote_id: Option<RemoteId>,
    ) -> Result<()> {
        let content_type = match local.as_ref().or(remote.as_ref()) {
            Some(item) => item.content_type,
            None => return Ok(()),
        };
        let classifier = self.classifier(content_type)?;
        let resolution = self.resolver.resolve(&ConflictCase {
            local: local.as_ref(),
            remote: remote.as_ref(),
            mismatches: &mismatches,
            classifier,
        });

        let mut report = ConflictReport {
            local_id: local_id.clone(),
            remote_id: remote_id.clone(),
            mismatches,
            local_deleted: local.is_none(),
            remote_deleted: remote.is_none(),
            outcome: ConflictOutcome::Unresolved,
        };
        let mut entry = PlanEntry::new(local_id.clone(), remote_id.clone(), EntryAction::Sync)
            .with_previous(previous);
        let mut ops: Vec<(Side, SyncOp, Item)> = Vec::new();

        let with_ids = |mut item: Item| {
            item.local_id = local_id.clone();
            item.remote_id = remote_id.clone();
            item
        };

        match resolution {
            Resolution::LocalWins => {
                report.outcome = ConflictOutcome::LocalWins;
                match (local, remote) {
                    (Some(local), Some(_)) => {
                        entry.fingerprint = Some(Fingerprint::of(&local, classifier));
                        ops.push((Side::Remote, SyncOp::Replace, with_ids(local)));
                    }
                    (Some(mut local), None) => {
                        entry.fingerprint = Some(Fingerprint::of(&local, classifier));
                        entry.remote_id = None;
                        local.remote_id = None;
                        ops.push((Side::Remote, SyncOp::Add, local));
                    }
                    (None, Some(remote)) => {
                        entry.deletes = true;
                        ops.push((Side::Remote, SyncOp::Delete, with_ids(remote)));
                    }
                    (None, None) => {}
                }
            }
            Resolution::RemoteWins => {
                report.outcome = ConflictOutcome::RemoteWins;
                match (local, remote) {
                    (Some(mut local), Some(remote)) => {
                        local.replace_data_from(&remote);
                        entry.fingerprint = Some(Fingerprint::of(&local, classifier));
                        ops.push((Side::Local, SyncOp::Replace, with_ids(local)));
                    }
                    (Some(local), None) => {
                        entry.deletes = true;
                        ops.push((Side::Local, SyncOp::Delete, with_ids(local)));
                    }
                    (None, Some(mut remote)) => {
                        entry.fingerprint = Some(Fingerprint::of(&remote, classifier));
                        entry.local_id = None;
                        remote.local_id = None;
                        ops.push((Side::Local, SyncOp::Add, remote));
                    }
                    (None, None) => {}
                }
            }
            Resolution::Merged(merged) => {
                report.outcome = ConflictOutcome::Merged;
                entry.fingerprint = Some(Fingerprint::of(&merged, classifier));
                let merged = with_ids(merged);
                if local.is_some() {
                    ops.push((Side::Local, SyncOp::Replace, merged.clone()));
                } else {
                    entry.local_id = None;
                    let mut add = merged.clone();
                    add.local_id = None;
                    ops.push((Side::Local, SyncOp::Add, add));
                }
                if remote.is_some() {
                    ops.push((Side::Remote, SyncOp::Replace, merged));
                } else {
                    entry.remote_id = None;
                    let mut add = merged;
                    add.remote_id = None;
                    ops.push((Side::Remote, SyncOp::Add, add));
                }
            }
            Resolution::Unresolved => {
                entry.action = EntryAction::Conflict;
            }
        }

        tracing::info!(
            parent: &self.span,
            item = %entry.display_id(),
            outcome = ?report.outcome,
            "conflict resolved"
        );
        entry.conflict = Some(report);
        let idx = plan.push_entry(entry);
        for (side, op, item) in ops {
            plan.push_op(idx, side, op, item);
        }
        Ok(())
    }
}

fn absent(value: Option<&serde_json::Value>) -> bool {
    value.map_or(true, serde_json::Value::is_null)
}

fn entry_is_clean(entry: &PlanEntry) -> bool {
    entry
        .previous
        .as_ref()
        .map_or(true, |record| record.flags.is_empty() && Some(record.fingerprint) == entry.fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::CapacityConfig;
    use serde_json::json;

    fn contact(fields: serde_json::Value) -> Item {
        Item::from_json(ContentType::Contact, fields)
    }

    fn empty_log() -> ChangeLog {
        ChangeLog::new("contacts", CapacityConfig::default(), Span::none())
    }

    fn plan(
        log: &ChangeLog,
        backend: &mut MemoryBackend,
        mode: SyncMode,
        strategy: ConflictStrategy,
    ) -> OperationPlan {
        let registry = ClassifierRegistry::with_defaults();
        Reconciler::new(log, &registry, &strategy, &Span::none())
            .reconcile(backend, mode)
            .unwrap()
    }

    /// Record a local/remote pair as synced with the given content.
    fn synced(log: &mut ChangeLog, backend: &mut MemoryBackend, fields: serde_json::Value) -> (String, String) {
        let registry = ClassifierRegistry::with_defaults();
        let local_id = backend.insert_local(contact(fields.clone()));
        let remote_id = backend.insert_remote(contact(fields.clone()));
        let fp = log.fingerprint_of(&contact(fields), &registry).unwrap();
        log.upsert(ChangeRecord::new(local_id.clone(), fp).with_remote_id(remote_id.clone()))
            .unwrap();
        (local_id, remote_id)
    }

    fn ops(plan: &OperationPlan) -> Vec<(Side, SyncOp)> {
        plan.ops.iter().map(|o| (o.side, o.op)).collect()
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("lww".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::LastWriterWins);
        assert_eq!(" Remote-Wins ".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::RemoteWins);
        assert!("nope".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn last_writer_wins_rules() {
        let classifier = ContentType::Contact.default_classifier();
        let older = contact(json!({"FN": "a"})).with_modified_at(100);
        let newer = contact(json!({"FN": "b"})).with_modified_at(200);
        let undated = contact(json!({"FN": "c"}));
        let lww = ConflictStrategy::LastWriterWins;
        let case = |local: Option<&Item>, remote: Option<&Item>| {
            lww.resolve(&ConflictCase {
                local,
                remote,
                mismatches: &[],
                classifier: &classifier,
            })
        };

        assert_eq!(case(Some(&newer), Some(&older)), Resolution::LocalWins);
        assert_eq!(case(Some(&older), Some(&newer)), Resolution::RemoteWins);
        assert_eq!(case(Some(&older), Some(&older)), Resolution::RemoteWins);
        assert_eq!(case(Some(&undated), Some(&older)), Resolution::RemoteWins);
        assert_eq!(case(Some(&older), Some(&undated)), Resolution::LocalWins);
        assert_eq!(case(None, Some(&older)), Resolution::RemoteWins);
        assert_eq!(case(Some(&older), None), Resolution::LocalWins);
    }

    #[test]
    fn closures_are_resolvers() {
        let classifier = ContentType::Contact.default_classifier();
        fn keep_local(case: &ConflictCase<'_>) -> Resolution {
            match case.local {
                Some(local) => Resolution::Merged(local.clone()),
                None => Resolution::Unresolved,
            }
        }
        let resolver = keep_local;
        let item = contact(json!({"FN": "a"}));
        let resolution = resolver.resolve(&ConflictCase {
            local: Some(&item),
            remote: None,
            mismatches: &[],
            classifier: &classifier,
        });
        assert_eq!(resolution, Resolution::Merged(item));
    }

    #[test]
    fn new_local_item_is_added_remotely() {
        let mut backend = MemoryBackend::new();
        backend.insert_local(contact(json!({"FN": "Alice"})));

        let plan = plan(&empty_log(), &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Remote, SyncOp::Add)]);
        assert_eq!(plan.admitted_records(), 1);
    }

    #[test]
    fn unchanged_items_produce_no_ops() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert!(plan.ops.is_empty());
        assert_eq!(plan.entries[0].action, EntryAction::Unchanged);
    }

    #[test]
    fn never_field_change_is_not_a_change() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, _) = synced(&mut log, &mut backend, json!({"FN": "Alice", "REV": "1"}));
        backend.end_sync(true).unwrap();
        backend.edit_local(&local_id, |item| {
            item.set_field("REV", json!("2"));
        });

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn local_change_replaces_remote() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.edit_local(&local_id, |item| {
            item.set_field("TEL", json!("555"));
        });

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Remote, SyncOp::Replace)]);
        assert_eq!(plan.ops[0].item.remote_id.as_deref(), Some(remote_id.as_str()));
    }

    #[test]
    fn remote_change_replaces_local() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.edit_remote(&remote_id, |item| {
            item.set_field("TEL", json!("555"));
        });

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Local, SyncOp::Replace)]);
        let item = &plan.ops[0].item;
        assert_eq!(item.local_id.as_deref(), Some(local_id.as_str()));
        assert_eq!(item.field("TEL"), Some(&json!("555")));
    }

    #[test]
    fn compatible_changes_merge() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.edit_local(&local_id, |item| {
            item.set_field("TEL", json!("555"));
        });
        backend.edit_remote(&remote_id, |item| {
            item.set_field("EMAIL", json!("a@x"));
        });

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        // Local lacks EMAIL and remote lacks TEL, but no field disagrees
        assert!(plan.conflicts().next().is_none());
        assert_eq!(
            ops(&plan),
            vec![(Side::Local, SyncOp::Replace), (Side::Remote, SyncOp::Replace)]
        );
        assert_eq!(plan.ops[0].item.field("EMAIL"), Some(&json!("a@x")));
        assert_eq!(plan.ops[0].item.field("TEL"), Some(&json!("555")));
    }

    #[test]
    fn conflicting_changes_are_surfaced() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice", "TEL": "1"}));
        backend.end_sync(true).unwrap();
        backend.edit_local(&local_id, |item| {
            item.set_field("TEL", json!("2"));
        });
        backend.edit_remote(&remote_id, |item| {
            item.set_field("TEL", json!("3"));
        });

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert!(plan.ops.is_empty());
        let conflict = plan.conflicts().next().unwrap();
        assert_eq!(conflict.outcome, ConflictOutcome::Unresolved);
        assert_eq!(conflict.mismatches[0].field, "TEL");
        assert_eq!(plan.entries[0].action, EntryAction::Conflict);
    }

    #[test]
    fn local_deletion_deletes_remote() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.delete_local(&local_id);

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Remote, SyncOp::Delete)]);
        assert_eq!(plan.ops[0].item.remote_id.as_deref(), Some(remote_id.as_str()));
        assert!(plan.entries[0].deletes);
    }

    #[test]
    fn remote_deletion_deletes_local() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (_, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.delete_remote(&remote_id);

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Local, SyncOp::Delete)]);
    }

    #[test]
    fn update_delete_collision_goes_to_resolver() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        let (local_id, remote_id) = synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        backend.end_sync(true).unwrap();
        backend.edit_local(&local_id, |item| {
            item.set_field("TEL", json!("9"));
        });
        backend.delete_remote(&remote_id);

        let plan = plan(&log, &mut backend, SyncMode::Incremental, ConflictStrategy::LocalWins);
        let conflict = plan.conflicts().next().unwrap();
        assert!(conflict.remote_deleted);
        assert_eq!(conflict.outcome, ConflictOutcome::LocalWins);
        // Local wins against a deletion: upload again under a new ID
        assert_eq!(ops(&plan), vec![(Side::Remote, SyncOp::Add)]);
        assert_eq!(plan.ops[0].item.remote_id, None);
    }

    #[test]
    fn new_remote_item_is_added_locally() {
        let mut backend = MemoryBackend::new();
        backend.insert_remote(contact(json!({"FN": "Bob"})));

        let plan = plan(&empty_log(), &mut backend, SyncMode::Incremental, ConflictStrategy::Surface);
        assert_eq!(ops(&plan), vec![(Side::Local, SyncOp::Add)]);
    }

    #[test]
    fn slow_sync_matches_by_content() {
        let mut backend = MemoryBackend::new();
        backend.insert_local(contact(json!({"FN": "A"})));
        backend.insert_local(contact(json!({"FN": "B"})));
        backend.insert_remote(contact(json!({"FN": "A"})));
        backend.insert_remote(contact(json!({"FN": "X"})));
        backend.insert_remote(contact(json!({"FN": "Y"})));

        let plan = plan(&empty_log(), &mut backend, SyncMode::Slow, ConflictStrategy::Surface);
        assert_eq!(plan.matches.len(), 1);
        assert_eq!(plan.matches[0].kind, MatchKind::Content);
        // Entries: the A pair, local B, then remote X and Y
        assert_eq!(
            ops(&plan),
            vec![
                (Side::Remote, SyncOp::Add),
                (Side::Local, SyncOp::Add),
                (Side::Local, SyncOp::Add),
            ]
        );
        assert!(plan.ops.iter().all(|o| o.op != SyncOp::Delete));
    }

    #[test]
    fn slow_sync_pairs_known_remote_ids() {
        let mut backend = MemoryBackend::new();
        let remote_id = backend.insert_remote(contact(json!({"FN": "Renamed"})));
        backend.insert_local(contact(json!({"FN": "Original"})).with_remote_id(remote_id.clone()));

        let plan = plan(&empty_log(), &mut backend, SyncMode::Slow, ConflictStrategy::RemoteWins);
        assert_eq!(plan.matches[0].kind, MatchKind::RemoteId);
        assert_eq!(plan.matches[0].remote_id, remote_id);
        assert_eq!(ops(&plan), vec![(Side::Local, SyncOp::Replace)]);
    }

    #[test]
    fn pairwise_limit_aborts() {
        let mut backend = MemoryBackend::new();
        for i in 0..3 {
            backend.insert_local(contact(json!({"FN": format!("l{}", i), "TEL": "1"})));
            backend.insert_remote(contact(json!({"FN": format!("r{}", i), "TEL": "1"})));
        }
        let registry = ClassifierRegistry::new().with_classifier(
            ContentType::Contact
                .default_classifier()
                .with_field("TEL", EquivalenceClass::Scripted),
        );
        let hook: ScriptedCompare<'_> = &|_, a, b, _| a == b;
        let log = empty_log();
        let strategy = ConflictStrategy::Surface;

        let result = Reconciler::new(&log, &registry, &strategy, &Span::none())
            .with_scripted_compare(hook)
            .with_compare_limit(Some(4))
            .reconcile(&mut backend, SyncMode::Slow);
        assert!(matches!(result, Err(Error::SlowSyncLimit(4))));
    }

    #[test]
    fn enumeration_error_aborts_before_deleting() {
        let mut backend = MemoryBackend::new();
        let mut log = empty_log();
        synced(&mut log, &mut backend, json!({"FN": "Alice"}));
        synced(&mut log, &mut backend, json!({"FN": "Bob"}));
        backend.fail_enumeration_after(Some(1));

        let registry = ClassifierRegistry::with_defaults();
        let strategy = ConflictStrategy::Surface;
        let result = Reconciler::new(&log, &registry, &strategy, &Span::none())
            .reconcile(&mut backend, SyncMode::Incremental);
        assert!(matches!(result, Err(Error::Backend { code: 503, .. })));
    }
}
