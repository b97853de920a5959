//! Storage substrate contract.
//!
//! An [`ItemStore`] holds primary items, the entries of the four derived
//! indexes, and a replayable change feed. Writes arrive as a [`WriteBatch`]
//! whose item conditions are all checked before anything is applied; the
//! shipped backends apply the whole batch atomically.

mod lmdb;
mod memory;

pub use lmdb::{LmdbItemStore, LmdbStoreError};
pub use memory::InMemoryItemStore;

use std::collections::HashSet;

use async_trait::async_trait;
use ledger_core::{ChangeOperation, LedgerResult, StorageError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::{IndexEntryKey, IndexName, PrimaryKey, SortCondition};

// ============================================================================
// ITEMS AND WRITES
// ============================================================================

/// A primary item as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub key: PrimaryKey,
    pub version: u64,
    pub body: Value,
}

/// A derived index entry as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: IndexEntryKey,
    /// Projected attributes. `Value::Null` for keys-only indexes.
    pub projection: Value,
}

/// Precondition on the current state of a primary item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expect {
    /// The item must not exist.
    Absent,
    /// The item must exist at exactly this version.
    Version(u64),
}

impl Expect {
    pub fn holds(&self, current: Option<&StoredItem>) -> bool {
        match (self, current) {
            (Expect::Absent, None) => true,
            (Expect::Version(v), Some(item)) => item.version == *v,
            _ => false,
        }
    }
}

/// A conditional operation on one primary item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemWrite {
    Put { item: StoredItem, expect: Expect },
    Delete { key: PrimaryKey, expect: Expect },
    /// Assert a condition without writing.
    Check { key: PrimaryKey, expect: Expect },
}

impl ItemWrite {
    pub fn key(&self) -> &PrimaryKey {
        match self {
            ItemWrite::Put { item, .. } => &item.key,
            ItemWrite::Delete { key, .. } | ItemWrite::Check { key, .. } => key,
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            ItemWrite::Put { expect, .. }
            | ItemWrite::Delete { expect, .. }
            | ItemWrite::Check { expect, .. } => *expect,
        }
    }

    /// Operation reported on the change feed, `None` for checks.
    pub fn change_operation(&self) -> Option<ChangeOperation> {
        match self {
            ItemWrite::Put {
                expect: Expect::Absent,
                ..
            } => Some(ChangeOperation::Create),
            ItemWrite::Put { .. } => Some(ChangeOperation::Update),
            ItemWrite::Delete { .. } => Some(ChangeOperation::Delete),
            ItemWrite::Check { .. } => None,
        }
    }
}

/// An unconditional operation on one index entry. Index writes are idempotent.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexWrite {
    Put { entry: IndexEntry },
    Delete { key: IndexEntryKey },
}

impl IndexWrite {
    pub fn key(&self) -> &IndexEntryKey {
        match self {
            IndexWrite::Put { entry } => &entry.key,
            IndexWrite::Delete { key } => key,
        }
    }
}

/// A group of writes committed as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub items: Vec<ItemWrite>,
    pub index: Vec<IndexWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, item: StoredItem, expect: Expect) -> &mut Self {
        self.items.push(ItemWrite::Put { item, expect });
        self
    }

    pub fn delete(&mut self, key: PrimaryKey, version: u64) -> &mut Self {
        self.items.push(ItemWrite::Delete {
            key,
            expect: Expect::Version(version),
        });
        self
    }

    pub fn check(&mut self, key: PrimaryKey, expect: Expect) -> &mut Self {
        self.items.push(ItemWrite::Check { key, expect });
        self
    }

    pub fn put_index(&mut self, key: IndexEntryKey, projection: Value) -> &mut Self {
        self.index.push(IndexWrite::Put {
            entry: IndexEntry { key, projection },
        });
        self
    }

    pub fn delete_index(&mut self, key: IndexEntryKey) -> &mut Self {
        self.index.push(IndexWrite::Delete { key });
        self
    }

    pub fn extend_index(&mut self, writes: impl IntoIterator<Item = IndexWrite>) -> &mut Self {
        self.index.extend(writes);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.index.is_empty()
    }

    /// Number of item writes that change state (puts and deletes).
    pub fn mutation_count(&self) -> usize {
        self.items
            .iter()
            .filter(|w| !matches!(w, ItemWrite::Check { .. }))
            .count()
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Global change-feed sequence of the last record appended, if any.
    pub last_sequence: Option<u64>,
    pub committed_at: Timestamp,
}

// ============================================================================
// QUERIES AND CHANGE FEED
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanOrder {
    #[default]
    Ascending,
    Descending,
}

/// Paging parameters for a range query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub order: ScanOrder,
    pub limit: Option<usize>,
    /// Encoded key of the last entry of the previous page.
    pub start_after: Option<Vec<u8>>,
}

impl PageRequest {
    pub fn new(order: ScanOrder) -> Self {
        Self {
            order,
            limit: None,
            start_after: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: Option<Vec<u8>>) -> Self {
        self.start_after = cursor;
        self
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` when the range is exhausted.
    pub last_key: Option<Vec<u8>>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            last_key: None,
        }
    }
}

/// One committed primary write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub partition_sequence: u64,
    pub key: PrimaryKey,
    pub operation: ChangeOperation,
    pub before: Option<StoredItem>,
    pub after: Option<StoredItem>,
    pub committed_at: Timestamp,
}

/// Selection of change records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedQuery {
    /// Return records with a global sequence strictly greater than this.
    pub after: u64,
    /// Restrict to one partition key.
    pub partition: Option<String>,
    pub limit: usize,
}

/// Keyed store backing the ledger.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Point read by primary key. Linearizable against committed batches.
    async fn get(&self, key: &PrimaryKey) -> LedgerResult<Option<StoredItem>>;

    /// Check every item condition, then apply the batch and append change records.
    async fn transact(&self, batch: WriteBatch) -> LedgerResult<CommitReceipt>;

    /// Range query over the primary items of one partition.
    async fn query(
        &self,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<StoredItem>>;

    /// Range query over one partition of a derived index.
    async fn query_index(
        &self,
        index: IndexName,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<IndexEntry>>;

    /// Point read of one index entry.
    async fn get_index(&self, key: &IndexEntryKey) -> LedgerResult<Option<IndexEntry>>;

    /// Read change records in sequence order.
    async fn read_changes(&self, query: &ChangeFeedQuery) -> LedgerResult<Vec<ChangeRecord>>;

    /// Highest global sequence appended so far (0 when empty).
    async fn latest_sequence(&self) -> LedgerResult<u64>;
}

// ============================================================================
// SHARED BATCH APPLICATION
// ============================================================================

/// Mutable view of a backend inside one write transaction.
pub(crate) trait BatchTarget {
    fn current_item(&mut self, key: &[u8]) -> LedgerResult<Option<StoredItem>>;
    fn write_item(&mut self, key: &[u8], item: &StoredItem) -> LedgerResult<()>;
    fn remove_item(&mut self, key: &[u8]) -> LedgerResult<()>;
    fn write_index(&mut self, key: &[u8], projection: &Value) -> LedgerResult<()>;
    fn remove_index(&mut self, key: &[u8]) -> LedgerResult<()>;
    fn next_sequence(&mut self) -> LedgerResult<u64>;
    fn next_partition_sequence(&mut self, partition: &str) -> LedgerResult<u64>;
    fn append_change(&mut self, record: &ChangeRecord) -> LedgerResult<()>;
}

fn condition_failed(key: &PrimaryKey, expect: Expect, current: Option<&StoredItem>) -> StorageError {
    let reason = match (expect, current) {
        (Expect::Absent, Some(item)) => format!("exists at version {}", item.version),
        (Expect::Version(v), None) => format!("expected version {}, item is absent", v),
        (Expect::Version(v), Some(item)) => {
            format!("expected version {}, found {}", v, item.version)
        }
        (Expect::Absent, None) => "condition not met".to_string(),
    };
    StorageError::ConditionFailed {
        partition_key: key.partition.clone(),
        sort_key: key.sort.clone(),
        reason,
    }
}

/// Validate and apply `batch` against `target`.
///
/// The first pass reads every item and checks its condition; nothing is
/// written unless all conditions hold. The caller commits or discards the
/// surrounding transaction.
pub(crate) fn apply_batch<T: BatchTarget>(
    target: &mut T,
    batch: &WriteBatch,
    committed_at: Timestamp,
) -> LedgerResult<CommitReceipt> {
    let mut seen_items = HashSet::new();
    let mut current = Vec::with_capacity(batch.items.len());
    for write in &batch.items {
        let key = write.key();
        let encoded = key.encode();
        if !seen_items.insert(encoded.clone()) {
            return Err(StorageError::DuplicateBatchKey {
                key: key.describe(),
            }
            .into());
        }
        let existing = target.current_item(&encoded)?;
        let expect = write.expect();
        if !expect.holds(existing.as_ref()) {
            return Err(condition_failed(key, expect, existing.as_ref()).into());
        }
        current.push((encoded, existing));
    }

    let mut seen_index = HashSet::new();
    for write in &batch.index {
        if !seen_index.insert(write.key().encode()) {
            return Err(StorageError::DuplicateBatchKey {
                key: write.key().describe(),
            }
            .into());
        }
    }

    let mut last_sequence = None;
    for (write, (encoded, before)) in batch.items.iter().zip(current) {
        let after = match write {
            ItemWrite::Put { item, .. } => {
                target.write_item(&encoded, item)?;
                Some(item.clone())
            }
            ItemWrite::Delete { .. } => {
                target.remove_item(&encoded)?;
                None
            }
            ItemWrite::Check { .. } => continue,
        };
        let Some(operation) = write.change_operation() else {
            continue;
        };
        let key = write.key();
        let sequence = target.next_sequence()?;
        let partition_sequence = target.next_partition_sequence(&key.partition)?;
        target.append_change(&ChangeRecord {
            sequence,
            partition_sequence,
            key: key.clone(),
            operation,
            before,
            after,
            committed_at,
        })?;
        last_sequence = Some(sequence);
    }

    for write in &batch.index {
        match write {
            IndexWrite::Put { entry } => target.write_index(&entry.key.encode(), &entry.projection)?,
            IndexWrite::Delete { key } => target.remove_index(&key.encode())?,
        }
    }

    Ok(CommitReceipt {
        last_sequence,
        committed_at,
    })
}

/// Collect at most `limit` entries from an iterator of decoded results, returning a cursor
/// when the limit cut the scan short.
pub(crate) fn collect_page<T, I, K>(iter: I, limit: Option<usize>, encode: K) -> LedgerResult<Page<T>>
where
    I: Iterator<Item = LedgerResult<T>>,
    K: Fn(&T) -> Vec<u8>,
{
    let mut items = Vec::new();
    let mut last_key = None;
    for result in iter {
        let entry = result?;
        if limit.is_some_and(|limit| items.len() >= limit) {
            last_key = items.last().map(&encode);
            break;
        }
        items.push(entry);
    }
    Ok(Page { items, last_key })
}
