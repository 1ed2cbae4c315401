//! Operation plans and session reports.
//!
//! The reconciler produces an [`OperationPlan`]: one [`PlanEntry`] per
//! logical item plus the backend operations needed to converge it. Operations
//! are totally ordered so that adds run first and deletes run last.

use crate::{
    backend::{Ack, BackendError, Side},
    changelog::ChangeRecord,
    classifier::FieldMismatch,
    Fingerprint, Generation, Item, LocalId, RemoteId, SyncOp,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How the session compared the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Driven by the change log and the remote change feed
    Incremental,
    /// Full comparison of both sides without trusting the change log
    Slow,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Slow => write!(f, "slow"),
        }
    }
}

/// What the plan does for one logical item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryAction {
    /// Both sides agree with the change log
    Unchanged,
    /// Operations will be applied
    Sync,
    /// Conflict left unresolved; both sides stay as they are
    Conflict,
    /// Only the change record is dropped
    Forget,
}

/// Which side wins a conflict, or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictOutcome {
    LocalWins,
    RemoteWins,
    Merged,
    Unresolved,
}

/// Description of a conflict between the two copies of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<RemoteId>,
    /// Fields that differed; empty for update/delete collisions
    pub mismatches: Vec<FieldMismatch>,
    pub local_deleted: bool,
    pub remote_deleted: bool,
    pub outcome: ConflictOutcome,
}

/// How a slow sync paired a local item with a remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    /// The local backend already knew the remote ID
    RemoteId,
    /// Equal at the slow sync level
    Content,
}

/// A local/remote pair found during slow sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMatch {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub kind: MatchKind,
}

/// The plan for one logical item.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<RemoteId>,
    pub action: EntryAction,
    /// Fingerprint of the content both sides hold once the operations
    /// succeed
    pub fingerprint: Option<Fingerprint>,
    /// Record before this session, if any
    pub previous: Option<ChangeRecord>,
    /// The item ends up deleted on both sides
    pub deletes: bool,
    pub conflict: Option<ConflictReport>,
}

impl PlanEntry {
    pub fn new(local_id: Option<LocalId>, remote_id: Option<RemoteId>, action: EntryAction) -> Self {
        Self {
            local_id,
            remote_id,
            action,
            fingerprint: None,
            previous: None,
            deletes: false,
            conflict: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_previous(mut self, previous: Option<ChangeRecord>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictReport) -> Self {
        self.conflict = Some(conflict);
        self
    }

    /// Whether a successful commit of this entry creates a change record.
    pub fn admits_record(&self) -> bool {
        self.previous.is_none()
            && !self.deletes
            && matches!(self.action, EntryAction::Sync | EntryAction::Conflict)
    }

    /// Human readable identity for logs and reports.
    pub fn display_id(&self) -> String {
        match (&self.local_id, &self.remote_id) {
            (Some(local), Some(remote)) => format!("{}<->{}", local, remote),
            (Some(local), None) => local.clone(),
            (None, Some(remote)) => format!("remote:{}", remote),
            (None, None) => "<unassigned>".to_string(),
        }
    }
}

/// One backend operation of the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    /// Index of the owning [`PlanEntry`]
    pub entry: usize,
    pub side: Side,
    pub op: SyncOp,
    /// Item to send, tagged with `op`
    pub item: Item,
}

impl PlannedOp {
    pub fn new(entry: usize, side: Side, op: SyncOp, mut item: Item) -> Self {
        item.set_operation(op);
        Self {
            entry,
            side,
            op,
            item,
        }
    }

    fn rank(&self) -> u8 {
        match self.op {
            SyncOp::Add => 0,
            SyncOp::Replace => 1,
            SyncOp::None | SyncOp::Conflict => 2,
            SyncOp::Delete => 3,
        }
    }
}

/// Ordered by (kind, entry, side): adds, replaces, then deletes.
impl Ord for PlannedOp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => match self.entry.cmp(&other.entry) {
                Ordering::Equal => self.side.cmp(&other.side),
                other => other,
            },
            other => other,
        }
    }
}

impl PartialOrd for PlannedOp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for PlannedOp {}

/// Everything a session will do.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPlan {
    pub mode: SyncMode,
    pub entries: Vec<PlanEntry>,
    pub ops: Vec<PlannedOp>,
    /// Pairs found during slow sync
    pub matches: Vec<IdentityMatch>,
}

impl OperationPlan {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            ops: Vec::new(),
            matches: Vec::new(),
        }
    }

    /// Add an entry, returning its index.
    pub fn push_entry(&mut self, entry: PlanEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn push_op(&mut self, entry: usize, side: Side, op: SyncOp, item: Item) {
        self.ops.push(PlannedOp::new(entry, side, op, item));
    }

    /// Put operations into execution order.
    pub fn sort(&mut self) {
        self.ops.sort();
    }

    /// Number of change records a successful commit would add.
    pub fn admitted_records(&self) -> usize {
        self.entries.iter().filter(|e| e.admits_record()).count()
    }

    pub fn ops_for(&self, entry: usize) -> impl Iterator<Item = &PlannedOp> {
        self.ops.iter().filter(move |op| op.entry == entry)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictReport> {
        self.entries.iter().filter_map(|e| e.conflict.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of one applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResult {
    pub entry: usize,
    pub side: Side,
    pub op: SyncOp,
    pub result: Result<Ack, BackendError>,
}

impl AppliedResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Final per-item outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ItemOutcome {
    /// Operations applied, listed as `(side, op)`
    Applied { ops: Vec<(Side, SyncOp)> },
    Unchanged,
    Conflict { report: ConflictReport },
    Error { code: u16, message: String },
}

/// Outcome of one logical item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<RemoteId>,
    pub outcome: ItemOutcome,
}

/// Overall result of a committed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Every item converged
    Success,
    /// Committed, but some items failed or stayed in conflict
    PartialSuccess,
}

/// Summary returned by `Session::commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub datastore_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub mode: SyncMode,
    /// No change log existed before this session
    pub first_time: bool,
    /// Generation written by the commit
    pub generation: Generation,
    pub outcomes: Vec<ItemReport>,
    /// Stale deletions dropped after the commit
    pub purged: usize,
}

impl SessionReport {
    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn applied_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Applied { .. }))
    }

    pub fn unchanged_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Unchanged))
    }

    pub fn conflict_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Conflict { .. }))
    }

    pub fn error_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Error { .. }))
    }

    /// Operations applied on one side, e.g. for asserting convergence.
    pub fn ops_on(&self, side: Side) -> Vec<SyncOp> {
        self.outcomes
            .iter()
            .filter_map(|r| match &r.outcome {
                ItemOutcome::Applied { ops } => Some(ops),
                _ => None,
            })
            .flatten()
            .filter(|(s, _)| *s == side)
            .map(|(_, op)| *op)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentType;
    use serde_json::json;

    fn item() -> Item {
        Item::from_json(ContentType::Task, json!({"SUMMARY": "x"}))
    }

    #[test]
    fn deletes_sort_last() {
        let mut plan = OperationPlan::new(SyncMode::Incremental);
        plan.push_op(0, Side::Remote, SyncOp::Delete, item());
        plan.push_op(1, Side::Local, SyncOp::Replace, item());
        plan.push_op(2, Side::Remote, SyncOp::Add, item());
        plan.push_op(1, Side::Remote, SyncOp::Replace, item());
        plan.sort();

        let order: Vec<_> = plan.ops.iter().map(|o| (o.op, o.entry, o.side)).collect();
        assert_eq!(
            order,
            vec![
                (SyncOp::Add, 2, Side::Remote),
                (SyncOp::Replace, 1, Side::Local),
                (SyncOp::Replace, 1, Side::Remote),
                (SyncOp::Delete, 0, Side::Remote),
            ]
        );
    }

    #[test]
    fn planned_op_tags_item() {
        let op = PlannedOp::new(0, Side::Local, SyncOp::Add, item());
        assert_eq!(op.item.operation(), SyncOp::Add);
    }

    #[test]
    fn admitted_records() {
        let mut plan = OperationPlan::new(SyncMode::Slow);
        plan.push_entry(PlanEntry::new(Some("l-1".into()), None, EntryAction::Sync));
        plan.push_entry(PlanEntry::new(Some("l-2".into()), None, EntryAction::Unchanged));
        let mut deleting = PlanEntry::new(Some("l-3".into()), None, EntryAction::Sync);
        deleting.deletes = true;
        plan.push_entry(deleting);
        plan.push_entry(
            PlanEntry::new(Some("l-4".into()), None, EntryAction::Sync).with_previous(Some(
                ChangeRecord::new("l-4", Fingerprint::default()),
            )),
        );

        assert_eq!(plan.admitted_records(), 1);
    }

    #[test]
    fn report_counts() {
        let report = SessionReport {
            datastore_id: "tasks".into(),
            session_id: "s".into(),
            status: SessionStatus::PartialSuccess,
            mode: SyncMode::Incremental,
            first_time: false,
            generation: 3,
            outcomes: vec![
                ItemReport {
                    local_id: Some("l-1".into()),
                    remote_id: None,
                    outcome: ItemOutcome::Applied {
                        ops: vec![(Side::Remote, SyncOp::Add)],
                    },
                },
                ItemReport {
                    local_id: Some("l-2".into()),
                    remote_id: Some("r-2".into()),
                    outcome: ItemOutcome::Unchanged,
                },
                ItemReport {
                    local_id: Some("l-3".into()),
                    remote_id: None,
                    outcome: ItemOutcome::Error {
                        code: 500,
                        message: "boom".into(),
                    },
                },
            ],
            purged: 0,
        };

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.unchanged_count(), 1);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.conflict_count(), 0);
        assert_eq!(report.ops_on(Side::Remote), vec![SyncOp::Add]);
        assert!(report.ops_on(Side::Local).is_empty());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"kind\":\"unchanged\""));
        assert!(json.contains("\"firstTime\":false"));
    }

    #[test]
    fn entry_display_id() {
        let entry = PlanEntry::new(Some("l".into()), Some("r".into()), EntryAction::Forget);
        assert_eq!(entry.display_id(), "l<->r");
    }
}
