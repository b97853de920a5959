//! Access-pattern query layer.
//!
//! Read-only. Index reads are eventually consistent with primary records;
//! under [`ConsistencyMode::Verify`] every hit is checked against its primary
//! record and stale hits are repaired before results are returned.

use std::sync::Arc;

use ledger_core::{
    ConsistencyMode, Decision, DecisionId, DecisionStatus, LedgerResult, Project, ProjectId,
    ProjectMember, StorageError, Timestamp, UserId,
};
use serde::Deserialize;

use crate::keys::{status_partition, IndexKey, IndexName, ItemKey, SortCondition};
use crate::ledger::LedgerContext;
use crate::record::LedgerRecord;
use crate::retry::with_retry;
use crate::store::{IndexEntry, PageRequest, ScanOrder};

/// Inclusive bounds on a creation or join timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(since: Timestamp) -> Self {
        Self {
            since: Some(since),
            until: None,
        }
    }

    pub fn until(until: Timestamp) -> Self {
        Self {
            since: None,
            until: Some(until),
        }
    }

    pub fn between(since: Timestamp, until: Timestamp) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
        }
    }

    fn condition(&self) -> SortCondition {
        SortCondition::time_range(self.since.as_ref(), self.until.as_ref())
    }
}

/// Paging options for a decision scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub order: ScanOrder,
    /// Entries fetched per substrate call. Defaults to the configured scan page size.
    pub page_size: Option<usize>,
    /// Stop after this many entries overall.
    pub limit: Option<usize>,
}

impl ScanOptions {
    pub fn descending() -> Self {
        Self {
            order: ScanOrder::Descending,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A membership together with the project snapshot stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProject {
    pub member: ProjectMember,
    pub project: Project,
}

fn projection_error(what: &str, e: serde_json::Error) -> ledger_core::LedgerError {
    StorageError::Serialization {
        what: what.to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// Query handle. Cheap to clone.
#[derive(Clone)]
pub struct Queries {
    ctx: Arc<LedgerContext>,
}

impl std::fmt::Debug for Queries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queries").finish_non_exhaustive()
    }
}

impl Queries {
    pub(crate) fn new(ctx: Arc<LedgerContext>) -> Self {
        Self { ctx }
    }

    /// Projects a user belongs to, in the order the memberships were created (GSI1).
    pub async fn list_projects_for_user(&self, user_id: &UserId) -> LedgerResult<Vec<UserProject>> {
        let mut scan = IndexScan::new(
            self.ctx.clone(),
            IndexName::UserProjects,
            user_id.as_str().to_string(),
            SortCondition::All,
            ScanOptions::default(),
        );
        let mut projects = Vec::new();
        while let Some(entries) = scan.next_entries().await? {
            for entry in entries {
                let found = UserProject::deserialize(&entry.projection)
                    .map_err(|e| projection_error("GSI1 projection", e))?;
                projects.push(found);
            }
        }
        Ok(projects)
    }

    /// Decisions of a project by creation time, ascending (GSI2).
    pub async fn list_decisions_for_project(
        &self,
        project_id: ProjectId,
        range: TimeRange,
    ) -> LedgerResult<Vec<Decision>> {
        self.scan_decisions_for_project(project_id, range, ScanOptions::default())
            .collect_all()
            .await
    }

    /// Decisions of a project in one status by creation time, ascending (GSI3).
    pub async fn list_decisions_by_status(
        &self,
        project_id: ProjectId,
        status: DecisionStatus,
        range: TimeRange,
    ) -> LedgerResult<Vec<Decision>> {
        self.scan_decisions_by_status(project_id, status, range, ScanOptions::default())
            .collect_all()
            .await
    }

    /// The decision that directly supersedes `decision_id`, if any (GSI4).
    pub async fn find_superseding_decision(
        &self,
        decision_id: DecisionId,
    ) -> LedgerResult<Option<Decision>> {
        let mut scan = IndexScan::new(
            self.ctx.clone(),
            IndexName::Supersedes,
            IndexKey::supersedes(&decision_id).partition,
            SortCondition::All,
            ScanOptions::default().with_limit(1),
        );
        let Some(entry) = scan.next_entries().await?.and_then(|entries| entries.into_iter().next())
        else {
            return Ok(None);
        };
        // Keys-only index: the decision itself comes from its primary record.
        let key = entry.key.target.to_item_key()?;
        let successor = match key {
            ItemKey::Decision { .. } => self.ctx.maintenance.load::<Decision>(&key).await?,
            _ => None,
        };
        Ok(successor.filter(|d| d.supersedes_id == Some(decision_id)))
    }

    /// Paged scan over a project's decisions (GSI2).
    pub fn scan_decisions_for_project(
        &self,
        project_id: ProjectId,
        range: TimeRange,
        options: ScanOptions,
    ) -> DecisionScan {
        DecisionScan {
            inner: IndexScan::new(
                self.ctx.clone(),
                IndexName::ProjectDecisions,
                project_id.to_string(),
                range.condition(),
                options,
            ),
        }
    }

    /// Paged scan over a project's decisions in one status (GSI3).
    pub fn scan_decisions_by_status(
        &self,
        project_id: ProjectId,
        status: DecisionStatus,
        range: TimeRange,
        options: ScanOptions,
    ) -> DecisionScan {
        DecisionScan {
            inner: IndexScan::new(
                self.ctx.clone(),
                IndexName::StatusFilter,
                status_partition(status, &project_id),
                range.condition(),
                options,
            ),
        }
    }
}

/// Cursor over one index partition. Holds no substrate state between pages.
struct IndexScan {
    ctx: Arc<LedgerContext>,
    index: IndexName,
    partition: String,
    condition: SortCondition,
    order: ScanOrder,
    page_size: usize,
    remaining: Option<usize>,
    cursor: Option<Vec<u8>>,
    exhausted: bool,
}

impl IndexScan {
    fn new(
        ctx: Arc<LedgerContext>,
        index: IndexName,
        partition: String,
        condition: SortCondition,
        options: ScanOptions,
    ) -> Self {
        let page_size = options
            .page_size
            .unwrap_or(ctx.config.scan_page_size)
            .max(1);
        Self {
            ctx,
            index,
            partition,
            condition,
            order: options.order,
            page_size,
            remaining: options.limit,
            cursor: None,
            exhausted: false,
        }
    }

    async fn next_entries(&mut self) -> LedgerResult<Option<Vec<IndexEntry>>> {
        if self.exhausted || self.remaining == Some(0) {
            return Ok(None);
        }
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };
        let request = PageRequest::new(self.order)
            .with_limit(limit)
            .after(self.cursor.take());
        let store = self.ctx.maintenance.store();
        let page = with_retry(self.ctx.maintenance.retry_policy(), "query_index", || {
            store.query_index(self.index, &self.partition, &self.condition, &request)
        })
        .await?;

        self.cursor = page.last_key;
        self.exhausted = self.cursor.is_none();

        let entries = if self.ctx.config.consistency == ConsistencyMode::Verify {
            let mut verified = Vec::with_capacity(page.items.len());
            for hit in &page.items {
                verified.extend(self.ctx.maintenance.verify_hit(hit).await?);
            }
            verified
        } else {
            page.items
        };
        // Dropped stale hits do not count against the limit.
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(entries.len());
        }
        Ok(Some(entries))
    }
}

/// Paged, resumable scan over decisions in a derived index.
///
/// Each call to [`DecisionScan::next_page`] issues one range query. Dropping
/// the scan at any point leaves nothing behind.
pub struct DecisionScan {
    inner: IndexScan,
}

impl std::fmt::Debug for DecisionScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionScan")
            .field("index", &self.inner.index)
            .field("partition", &self.inner.partition)
            .field("exhausted", &self.inner.exhausted)
            .finish_non_exhaustive()
    }
}

impl DecisionScan {
    /// Next page of decisions, or `None` once the range or limit is exhausted.
    pub async fn next_page(&mut self) -> LedgerResult<Option<Vec<Decision>>> {
        let Some(entries) = self.inner.next_entries().await? else {
            return Ok(None);
        };
        entries
            .iter()
            .map(|entry| Decision::from_body(&entry.projection))
            .collect::<LedgerResult<Vec<_>>>()
            .map(Some)
    }

    /// Drain the remaining pages.
    pub async fn collect_all(mut self) -> LedgerResult<Vec<Decision>> {
        let mut decisions = Vec::new();
        while let Some(page) = self.next_page().await? {
            decisions.extend(page);
        }
        Ok(decisions)
    }
}
