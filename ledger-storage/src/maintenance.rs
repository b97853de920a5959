//! Index maintenance engine.
//!
//! The engine is the only writer of derived index entries. Projections are
//! pure functions of a primary record; every mutation is expressed as a
//! primary write plus the delta between the old and new projections, and the
//! two travel in one [`WriteBatch`].
//!
//! # Commit protocol
//!
//! A batch that fails transiently may have landed partially on a substrate
//! without atomic batches. Before each retry the engine re-reads every
//! primary in the batch:
//!
//! - landed: the write is replaced by a condition check at the version it
//!   wrote, so the retry only proceeds while that version is still current
//! - pending: the write is retried unchanged
//! - diverged: another writer moved the item on; its projections are rebuilt
//!   from the current primary record and the commit fails with `Conflict`
//!
//! A retry that is rejected outright (a landed write's check no longer holds)
//! is repaired the same way before the `Conflict` is returned.
//!
//! Index writes are idempotent and are always re-sent.

use std::sync::Arc;

use ledger_core::{
    Decision, DecisionStatus, LedgerError, LedgerResult, Project, ProjectMember, RetryPolicy,
    StorageError, Timestamp, KEY_SEPARATOR,
};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::keys::{
    project_partition, IndexEntryKey, IndexKey, IndexName, ItemKey, PrimaryKey, Projection,
    SortCondition, MEMBER_PREFIX,
};
use crate::record::LedgerRecord;
use crate::retry::{call_with_timeout, unavailable, with_retry};
use crate::store::{
    CommitReceipt, Expect, IndexEntry, IndexWrite, ItemStore, ItemWrite, PageRequest, StoredItem,
    WriteBatch,
};

// ============================================================================
// PROJECTIONS
// ============================================================================

fn projected(key: IndexEntryKey, body: &Value) -> IndexEntry {
    let projection = match key.index().projection() {
        Projection::All => body.clone(),
        Projection::KeysOnly => Value::Null,
    };
    IndexEntry { key, projection }
}

/// Index entries derived from a decision: GSI2, GSI3 and, when it supersedes
/// another decision, GSI4.
pub fn decision_entries(decision: &Decision) -> LedgerResult<Vec<IndexEntry>> {
    let target = decision.primary_key();
    let body = decision.to_body()?;
    let mut keys = vec![
        IndexKey::project_decisions(&decision.project_id, &decision.created_at),
        IndexKey::status_filter(decision.status, &decision.project_id, &decision.created_at),
    ];
    if let Some(superseded) = &decision.supersedes_id {
        keys.push(IndexKey::supersedes(superseded));
    }
    Ok(keys
        .into_iter()
        .map(|index_key| projected(IndexEntryKey::new(index_key, target.clone()), &body))
        .collect())
}

/// GSI1 entry for a membership, carrying both the member and the project snapshot.
pub fn membership_entry(member: &ProjectMember, project: &Project) -> LedgerResult<IndexEntry> {
    Ok(IndexEntry {
        key: IndexEntryKey::new(
            IndexKey::user_projects(&member.user_id, &member.joined_at),
            member.primary_key(),
        ),
        projection: json!({
            "member": member.to_body()?,
            "project": project.to_body()?,
        }),
    })
}

/// Writes that turn the `before` projections into the `after` projections.
pub fn index_delta(before: &[IndexEntry], after: &[IndexEntry]) -> Vec<IndexWrite> {
    let mut writes: Vec<IndexWrite> = before
        .iter()
        .filter(|old| !after.iter().any(|new| new.key == old.key))
        .map(|old| IndexWrite::Delete {
            key: old.key.clone(),
        })
        .collect();
    writes.extend(
        after
            .iter()
            .filter(|new| !before.contains(new))
            .cloned()
            .map(|entry| IndexWrite::Put { entry }),
    );
    writes
}

/// Index writes for a brand-new record.
pub fn index_puts(entries: Vec<IndexEntry>) -> impl Iterator<Item = IndexWrite> {
    entries.into_iter().map(|entry| IndexWrite::Put { entry })
}

// ============================================================================
// STATUS TRANSITIONS
// ============================================================================

/// A validated status transition and the index deltas it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub before: Decision,
    pub decision: Decision,
    pub index_writes: Vec<IndexWrite>,
}

impl StatusChange {
    /// Add the version-guarded primary update and its deltas to `batch`.
    pub fn append_to(&self, batch: &mut WriteBatch) -> LedgerResult<()> {
        batch.put(self.decision.to_stored()?, Expect::Version(self.before.version));
        batch.extend_index(self.index_writes.iter().cloned());
        Ok(())
    }
}

/// Validate `current.status -> next` and compute the updated decision with its index deltas.
///
/// The GSI3 entry moves from the old status partition to the new one and the
/// GSI2 projection is rewritten. GSI4 is keys-only and never changes.
pub fn plan_status_change(
    current: &Decision,
    next: DecisionStatus,
    now: Timestamp,
) -> LedgerResult<StatusChange> {
    if !current.status.can_transition_to(next) {
        return Err(LedgerError::InvalidTransition {
            decision_id: current.id,
            from: current.status,
            to: next,
        });
    }
    let mut decision = current.clone();
    decision.status = next;
    decision.updated_at = now.max(current.updated_at);
    decision.version = current.version + 1;
    let index_writes = index_delta(&decision_entries(current)?, &decision_entries(&decision)?);
    Ok(StatusChange {
        before: current.clone(),
        decision,
        index_writes,
    })
}

/// Map a failed item condition to a `Conflict` naming the entity.
pub(crate) fn conflict_from(error: LedgerError) -> LedgerError {
    match error {
        LedgerError::Storage(StorageError::ConditionFailed {
            partition_key,
            sort_key,
            reason,
        }) => match ItemKey::decode(&partition_key, &sort_key) {
            Ok(key) => LedgerError::Conflict {
                kind: key.kind(),
                id: key.id_string(),
                reason,
            },
            Err(_) => LedgerError::Storage(StorageError::ConditionFailed {
                partition_key,
                sort_key,
                reason,
            }),
        },
        other => other,
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Counts of index entries touched by a repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    pub written: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.removed == 0 && self.written == 0
    }

    fn absorb(&mut self, other: ReconcileReport) {
        self.removed += other.removed;
        self.written += other.written;
    }
}

/// Projections a record should have, with the primary conditions they were computed under.
struct Expected {
    guards: Vec<(PrimaryKey, Expect)>,
    entries: Vec<IndexEntry>,
    decision: Option<Decision>,
}

enum Recovery {
    Retry(WriteBatch),
    Diverged { key: PrimaryKey, reason: String },
}

/// Sole writer of derived index entries.
pub struct IndexMaintenance {
    store: Arc<dyn ItemStore>,
    retry: RetryPolicy,
    page_size: usize,
    commits: watch::Sender<u64>,
}

impl std::fmt::Debug for IndexMaintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMaintenance")
            .field("retry", &self.retry)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl IndexMaintenance {
    pub fn new(store: Arc<dyn ItemStore>, retry: RetryPolicy, page_size: usize) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            store,
            retry,
            page_size: page_size.max(1),
            commits,
        }
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Receiver of the latest committed change-feed sequence.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }

    /// Point read of a typed record, retried on transient failures.
    pub async fn load<R: LedgerRecord>(&self, key: &ItemKey) -> LedgerResult<Option<R>> {
        self.load_stored(key)
            .await?
            .map(|item| R::from_stored(&item))
            .transpose()
    }

    async fn load_stored(&self, key: &ItemKey) -> LedgerResult<Option<StoredItem>> {
        let primary = key.primary();
        with_retry(&self.retry, "get", || self.store.get(&primary)).await
    }

    /// Commit a batch under the retry budget, recovering from partial application.
    pub async fn commit(&self, operation: &str, batch: WriteBatch) -> LedgerResult<CommitReceipt> {
        let mut pending = batch;
        let mut recovered = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                call_with_timeout(&self.retry, operation, self.store.transact(pending.clone())).await;
            let error = match result {
                Ok(receipt) => {
                    tracing::debug!(
                        operation,
                        items = pending.items.len(),
                        index_writes = pending.index.len(),
                        sequence = ?receipt.last_sequence,
                        attempt,
                        "Committed batch"
                    );
                    self.publish(receipt.last_sequence, recovered).await;
                    return Ok(receipt);
                }
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    // An earlier attempt may have landed writes whose index
                    // deltas were never applied.
                    if attempt > 1 {
                        tracing::warn!(operation, attempt, error = %e, "Retried batch rejected, repairing its items");
                        self.repair_batch_items(&pending).await;
                    }
                    return Err(conflict_from(e));
                }
            };

            if attempt >= self.retry.max_attempts {
                tracing::error!(operation, attempts = attempt, error = %error, "Retry budget exhausted");
                return Err(unavailable(operation, attempt, &error));
            }
            let delay = self.retry.backoff_for(attempt);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient commit failure, re-reading batch primaries"
            );
            tokio::time::sleep(delay).await;

            match self.recover(&pending).await? {
                Recovery::Retry(next) => {
                    if next != pending {
                        tracing::warn!(
                            operation,
                            landed = pending.mutation_count() - next.mutation_count(),
                            "Batch applied partially, retrying the remainder"
                        );
                        recovered = true;
                    }
                    pending = next;
                }
                Recovery::Diverged { key, reason } => {
                    tracing::warn!(operation, item = %key, %reason, "Batch item moved on during recovery");
                    self.repair_batch_items(&pending).await;
                    return Err(conflict_from(
                        StorageError::ConditionFailed {
                            partition_key: key.partition,
                            sort_key: key.sort,
                            reason,
                        }
                        .into(),
                    ));
                }
            }
        }
    }

    async fn recover(&self, batch: &WriteBatch) -> LedgerResult<Recovery> {
        let mut next = WriteBatch {
            items: Vec::with_capacity(batch.items.len()),
            index: batch.index.clone(),
        };
        for write in &batch.items {
            let key = write.key();
            let current = with_retry(&self.retry, "get", || self.store.get(key)).await?;
            match write {
                ItemWrite::Put { item, .. } if current.as_ref() == Some(item) => {
                    next.check(key.clone(), Expect::Version(item.version));
                }
                ItemWrite::Delete {
                    expect: Expect::Version(_),
                    ..
                } if current.is_none() => {
                    next.check(key.clone(), Expect::Absent);
                }
                _ if write.expect().holds(current.as_ref()) => next.items.push(write.clone()),
                _ => {
                    let reason = match &current {
                        Some(item) => format!("now at version {}", item.version),
                        None => "now absent".to_string(),
                    };
                    return Ok(Recovery::Diverged {
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(Recovery::Retry(next))
    }

    async fn repair_batch_items(&self, batch: &WriteBatch) {
        for write in &batch.items {
            let Ok(key) = write.key().to_item_key() else {
                continue;
            };
            if let Err(e) = self.reconcile_item(&key).await {
                tracing::warn!(item = %key, error = %e, "Batch item repair failed");
            }
        }
    }

    async fn publish(&self, sequence: Option<u64>, recovered: bool) {
        let sequence = match sequence {
            Some(sequence) => sequence,
            // Records from an earlier partial attempt were never signalled.
            None if recovered => match self.store.latest_sequence().await {
                Ok(sequence) => sequence,
                Err(_) => return,
            },
            None => return,
        };
        self.commits.send_if_modified(|latest| {
            if sequence > *latest {
                *latest = sequence;
                true
            } else {
                false
            }
        });
    }

    // ------------------------------------------------------------------------
    // Repair
    // ------------------------------------------------------------------------

    /// Compare a primary record with every candidate index entry and repair
    /// the differences. Entities without projections report a clean result.
    pub async fn reconcile(&self, key: &ItemKey) -> LedgerResult<ReconcileReport> {
        match key {
            ItemKey::Decision { .. } | ItemKey::Member { .. } => self.reconcile_item(key).await,
            ItemKey::Project { project_id } => {
                let mut report = ReconcileReport::default();
                let members = SortCondition::BeginsWith(format!("{}{}", MEMBER_PREFIX, KEY_SEPARATOR));
                let partition = project_partition(project_id);
                let mut cursor = None;
                loop {
                    let request = PageRequest::default().with_limit(self.page_size).after(cursor);
                    let page = with_retry(&self.retry, "query", || {
                        self.store.query(&partition, &members, &request)
                    })
                    .await?;
                    for item in &page.items {
                        report.absorb(self.reconcile_item(&item.key.to_item_key()?).await?);
                    }
                    match page.last_key {
                        Some(last) => cursor = Some(last),
                        None => return Ok(report),
                    }
                }
            }
            ItemKey::Participant { .. } | ItemKey::Tag { .. } => Ok(ReconcileReport::default()),
        }
    }

    /// Check one index hit against its primary record.
    ///
    /// Returns the hit when it is current. A stale hit is repaired and replaced
    /// by the current entry for the same index partition, if the record still
    /// belongs there.
    pub async fn verify_hit(&self, hit: &IndexEntry) -> LedgerResult<Option<IndexEntry>> {
        let key = hit.key.target.to_item_key()?;
        let desired = self.expected_entries(&key).await?.entries;
        if desired.contains(hit) {
            return Ok(Some(hit.clone()));
        }
        tracing::warn!(
            index = %hit.key.index(),
            partition = %hit.key.index_key.partition,
            target = %hit.key.target,
            "Stale index entry, repairing"
        );
        self.reconcile_item(&key).await?;
        Ok(desired.into_iter().find(|entry| {
            entry.key.index() == hit.key.index()
                && entry.key.index_key.partition == hit.key.index_key.partition
        }))
    }

    async fn reconcile_item(&self, key: &ItemKey) -> LedgerResult<ReconcileReport> {
        for _ in 0..self.retry.max_attempts {
            let expected = self.expected_entries(key).await?;
            let existing = self.candidate_entries(key, &expected).await?;
            let writes = index_delta(&existing, &expected.entries);
            if writes.is_empty() {
                return Ok(ReconcileReport::default());
            }
            let report = ReconcileReport {
                removed: writes
                    .iter()
                    .filter(|w| matches!(w, IndexWrite::Delete { .. }))
                    .count(),
                written: writes
                    .iter()
                    .filter(|w| matches!(w, IndexWrite::Put { .. }))
                    .count(),
            };
            let mut batch = WriteBatch::new();
            for (primary, expect) in expected.guards {
                batch.check(primary, expect);
            }
            batch.extend_index(writes);
            match with_retry(&self.retry, "reconcile", || self.store.transact(batch.clone())).await {
                Ok(_) => {
                    tracing::warn!(
                        item = %key,
                        removed = report.removed,
                        written = report.written,
                        "Repaired derived index entries"
                    );
                    return Ok(report);
                }
                Err(LedgerError::Storage(StorageError::ConditionFailed { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Conflict {
            kind: key.kind(),
            id: key.id_string(),
            reason: "record kept changing during reconcile".to_string(),
        })
    }

    /// Current projections of a record, with the primary conditions they depend on.
    async fn expected_entries(&self, key: &ItemKey) -> LedgerResult<Expected> {
        let guard = |item: &Option<StoredItem>| match item {
            Some(item) => Expect::Version(item.version),
            None => Expect::Absent,
        };
        match key {
            ItemKey::Decision { .. } => {
                let stored = self.load_stored(key).await?;
                let guards = vec![(key.primary(), guard(&stored))];
                let decision = stored.as_ref().map(Decision::from_stored).transpose()?;
                let entries = match &decision {
                    Some(decision) => decision_entries(decision)?,
                    None => Vec::new(),
                };
                Ok(Expected {
                    guards,
                    entries,
                    decision,
                })
            }
            ItemKey::Member { project_id, .. } => {
                let project_key = ItemKey::Project {
                    project_id: *project_id,
                };
                let member = self.load_stored(key).await?;
                let project = self.load_stored(&project_key).await?;
                let guards = vec![
                    (key.primary(), guard(&member)),
                    (project_key.primary(), guard(&project)),
                ];
                let entries = match (&member, &project) {
                    (Some(member), Some(project)) => vec![membership_entry(
                        &ProjectMember::from_stored(member)?,
                        &Project::from_stored(project)?,
                    )?],
                    _ => Vec::new(),
                };
                Ok(Expected {
                    guards,
                    entries,
                    decision: None,
                })
            }
            _ => Ok(Expected {
                guards: vec![(key.primary(), guard(&self.load_stored(key).await?))],
                entries: Vec::new(),
                decision: None,
            }),
        }
    }

    /// Index entries that currently exist for a record.
    async fn candidate_entries(
        &self,
        key: &ItemKey,
        expected: &Expected,
    ) -> LedgerResult<Vec<IndexEntry>> {
        let target = key.primary();
        match key {
            ItemKey::Decision { .. } => {
                // Decisions are never deleted, so a missing record has no entries to find.
                let Some(decision) = &expected.decision else {
                    return Ok(Vec::new());
                };
                let mut keys = vec![IndexEntryKey::new(
                    IndexKey::project_decisions(&decision.project_id, &decision.created_at),
                    target.clone(),
                )];
                for status in DecisionStatus::ALL {
                    keys.push(IndexEntryKey::new(
                        IndexKey::status_filter(status, &decision.project_id, &decision.created_at),
                        target.clone(),
                    ));
                }
                if let Some(superseded) = &decision.supersedes_id {
                    keys.push(IndexEntryKey::new(IndexKey::supersedes(superseded), target));
                }

                let mut found = Vec::new();
                for entry_key in &keys {
                    let entry =
                        with_retry(&self.retry, "get_index", || self.store.get_index(entry_key)).await?;
                    found.extend(entry);
                }
                Ok(found)
            }
            ItemKey::Member { user_id, .. } => {
                let mut found = Vec::new();
                let mut cursor = None;
                loop {
                    let request = PageRequest::default().with_limit(self.page_size).after(cursor);
                    let page = with_retry(&self.retry, "query_index", || {
                        self.store.query_index(
                            IndexName::UserProjects,
                            user_id.as_str(),
                            &SortCondition::All,
                            &request,
                        )
                    })
                    .await?;
                    found.extend(page.items.into_iter().filter(|e| e.key.target == target));
                    match page.last_key {
                        Some(last) => cursor = Some(last),
                        None => return Ok(found),
                    }
                }
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::status_partition;
    use crate::store::InMemoryItemStore;
    use chrono::{TimeZone, Utc};
    use ledger_core::{DecisionId, EntityKind, MemberRole, ProjectId, ProjectStatus, UserId};
    use std::time::Duration;

    fn ts(secs: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    fn decision(status: DecisionStatus) -> Decision {
        Decision {
            id: DecisionId::new(),
            project_id: ProjectId::new(),
            title: "Use DynamoDB for the new service".to_string(),
            body: "Single-table design".to_string(),
            raw_content: None,
            status,
            supersedes_id: None,
            author_id: None,
            source: None,
            created_at: ts(1),
            updated_at: ts(1),
            version: 1,
        }
    }

    fn engine() -> IndexMaintenance {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        IndexMaintenance::new(Arc::new(InMemoryItemStore::new()), policy, 2)
    }

    #[test]
    fn test_decision_projections() {
        let mut d = decision(DecisionStatus::Open);
        assert_eq!(decision_entries(&d).unwrap().len(), 2);

        d.supersedes_id = Some(DecisionId::new());
        let entries = decision_entries(&d).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].key.index_key.partition, status_partition(DecisionStatus::Open, &d.project_id));
        assert_eq!(entries[2].key.index(), IndexName::Supersedes);
        assert_eq!(entries[2].projection, Value::Null);
        assert_eq!(entries[0].projection, d.to_body().unwrap());
        assert_eq!(entries[1].projection, entries[0].projection);
    }

    #[test]
    fn test_status_plan_moves_status_partition() {
        let current = decision(DecisionStatus::Open);
        let plan = plan_status_change(&current, DecisionStatus::Confirmed, ts(5)).unwrap();
        assert_eq!(plan.decision.status, DecisionStatus::Confirmed);
        assert_eq!(plan.decision.version, 2);
        assert_eq!(plan.decision.updated_at, ts(5));

        let deletes: Vec<_> = plan
            .index_writes
            .iter()
            .filter_map(|w| match w {
                IndexWrite::Delete { key } => Some(key.index_key.partition.clone()),
                IndexWrite::Put { .. } => None,
            })
            .collect();
        assert_eq!(deletes, [status_partition(DecisionStatus::Open, &current.project_id)]);

        let puts: Vec<_> = plan
            .index_writes
            .iter()
            .filter_map(|w| match w {
                IndexWrite::Put { entry } => Some(entry.key.index()),
                IndexWrite::Delete { .. } => None,
            })
            .collect();
        assert_eq!(puts, [IndexName::ProjectDecisions, IndexName::StatusFilter]);
    }

    #[test]
    fn test_status_plan_rejects_illegal_moves() {
        let current = decision(DecisionStatus::Superseded);
        let err = plan_status_change(&current, DecisionStatus::Open, ts(5)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                decision_id: current.id,
                from: DecisionStatus::Superseded,
                to: DecisionStatus::Open,
            }
        );
    }

    #[test]
    fn test_condition_failure_maps_to_entity_conflict() {
        let d = decision(DecisionStatus::Open);
        let key = d.primary_key();
        let err = conflict_from(
            StorageError::ConditionFailed {
                partition_key: key.partition,
                sort_key: key.sort,
                reason: "expected version 1, found 2".to_string(),
            }
            .into(),
        );
        assert!(matches!(
            err,
            LedgerError::Conflict { kind: EntityKind::Decision, ref id, .. } if *id == d.id.to_string()
        ));
    }

    #[tokio::test]
    async fn test_reconcile_removes_stale_status_entry() {
        let engine = engine();
        let open = decision(DecisionStatus::Open);
        let mut batch = WriteBatch::new();
        batch.put(open.to_stored().unwrap(), Expect::Absent);
        batch.extend_index(index_puts(decision_entries(&open).unwrap()));
        engine.commit("create_decision", batch).await.unwrap();

        // Primary moves on without its index deltas.
        let plan = plan_status_change(&open, DecisionStatus::Confirmed, ts(3)).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(plan.decision.to_stored().unwrap(), Expect::Version(1));
        engine.store().transact(batch).await.unwrap();

        let report = engine.reconcile(&open.item_key()).await.unwrap();
        assert_eq!(report, ReconcileReport { removed: 1, written: 2 });
        assert!(engine.reconcile(&open.item_key()).await.unwrap().is_clean());

        let stale = IndexEntry {
            key: decision_entries(&open).unwrap()[1].key.clone(),
            projection: open.to_body().unwrap(),
        };
        assert!(engine.store().get_index(&stale.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_member_reconcile_refreshes_project_snapshot() {
        let engine = engine();
        let owner = UserId::new("U001").unwrap();
        let mut project = Project {
            id: ProjectId::new(),
            name: "Backend Rewrite".to_string(),
            description: None,
            owner_id: owner.clone(),
            status: ProjectStatus::Active,
            slack_channels: vec!["#backend".to_string()],
            notification_channel: None,
            auto_confirm_meeting_decisions: false,
            created_at: ts(1),
            updated_at: ts(1),
            version: 1,
        };
        let member = ProjectMember {
            project_id: project.id,
            user_id: owner,
            role: MemberRole::Owner,
            joined_at: ts(1),
            version: 1,
        };
        let mut batch = WriteBatch::new();
        batch.put(project.to_stored().unwrap(), Expect::Absent);
        batch.put(member.to_stored().unwrap(), Expect::Absent);
        batch.put_index(
            membership_entry(&member, &project).unwrap().key,
            membership_entry(&member, &project).unwrap().projection,
        );
        engine.commit("create_project", batch).await.unwrap();

        project.name = "Backend Rewrite v2".to_string();
        project.version = 2;
        let mut batch = WriteBatch::new();
        batch.put(project.to_stored().unwrap(), Expect::Version(1));
        engine.store().transact(batch).await.unwrap();

        let report = engine.reconcile(&ItemKey::Project { project_id: project.id }).await.unwrap();
        assert_eq!(report.written, 1);
        let entry = engine
            .store()
            .get_index(&membership_entry(&member, &project).unwrap().key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.projection["project"]["name"], "Backend Rewrite v2");
    }

    #[tokio::test]
    async fn test_commit_signals_latest_sequence() {
        let engine = engine();
        let mut commits = engine.subscribe();
        let d = decision(DecisionStatus::Open);
        let mut batch = WriteBatch::new();
        batch.put(d.to_stored().unwrap(), Expect::Absent);
        engine.commit("create_decision", batch).await.unwrap();
        assert!(commits.has_changed().unwrap());
        assert_eq!(*commits.borrow_and_update(), 1);
    }
}
