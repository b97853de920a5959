//! In-memory item store.
//!
//! Items and index entries live in ordered maps guarded by one lock, so a
//! batch is checked and applied under a single write guard.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use ledger_core::{Clock, LedgerResult, StorageError, SystemClock};
use serde_json::Value;

use super::{
    apply_batch, collect_page, BatchTarget, ChangeFeedQuery, ChangeRecord, CommitReceipt,
    IndexEntry, ItemStore, Page, PageRequest, ScanOrder, StoredItem, WriteBatch,
};
use crate::keys::{
    decode_index_key, IndexEntryKey, IndexName, KeyRange, PrimaryKey, SortCondition,
};

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<Vec<u8>, StoredItem>,
    index: BTreeMap<Vec<u8>, Value>,
    changes: Vec<ChangeRecord>,
    partition_sequences: HashMap<String, u64>,
}

impl BatchTarget for Inner {
    fn current_item(&mut self, key: &[u8]) -> LedgerResult<Option<StoredItem>> {
        Ok(self.items.get(key).cloned())
    }

    fn write_item(&mut self, key: &[u8], item: &StoredItem) -> LedgerResult<()> {
        self.items.insert(key.to_vec(), item.clone());
        Ok(())
    }

    fn remove_item(&mut self, key: &[u8]) -> LedgerResult<()> {
        self.items.remove(key);
        Ok(())
    }

    fn write_index(&mut self, key: &[u8], projection: &Value) -> LedgerResult<()> {
        self.index.insert(key.to_vec(), projection.clone());
        Ok(())
    }

    fn remove_index(&mut self, key: &[u8]) -> LedgerResult<()> {
        self.index.remove(key);
        Ok(())
    }

    fn next_sequence(&mut self) -> LedgerResult<u64> {
        Ok(self.changes.len() as u64 + 1)
    }

    fn next_partition_sequence(&mut self, partition: &str) -> LedgerResult<u64> {
        let counter = self
            .partition_sequences
            .entry(partition.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn append_change(&mut self, record: &ChangeRecord) -> LedgerResult<()> {
        self.changes.push(record.clone());
        Ok(())
    }
}

/// Item store held entirely in process memory.
///
/// Suitable for tests and single-process deployments; contents are lost on drop.
pub struct InMemoryItemStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryItemStore").finish_non_exhaustive()
    }
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for change-record commit timestamps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Number of stored primary items.
    pub fn item_count(&self) -> LedgerResult<usize> {
        Ok(self.read()?.items.len())
    }

    /// Number of stored index entries across all indexes.
    pub fn index_entry_count(&self) -> LedgerResult<usize> {
        Ok(self.read()?.index.len())
    }
}

fn scan<'a, V, T, F>(
    map: &'a BTreeMap<Vec<u8>, V>,
    range: KeyRange,
    order: ScanOrder,
    decode: F,
) -> Box<dyn Iterator<Item = LedgerResult<T>> + 'a>
where
    F: Fn(&'a [u8], &'a V) -> LedgerResult<T> + 'a,
    T: 'a,
{
    if range.is_empty() {
        return Box::new(std::iter::empty());
    }
    let (lower, upper) = range.as_slices();
    let entries = map.range::<[u8], _>((lower, upper));
    match order {
        ScanOrder::Ascending => Box::new(entries.map(move |(k, v)| decode(k.as_slice(), v))),
        ScanOrder::Descending => Box::new(entries.rev().map(move |(k, v)| decode(k.as_slice(), v))),
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get(&self, key: &PrimaryKey) -> LedgerResult<Option<StoredItem>> {
        Ok(self.read()?.items.get(&key.encode()).cloned())
    }

    async fn transact(&self, batch: WriteBatch) -> LedgerResult<CommitReceipt> {
        let committed_at = self.clock.now();
        let mut inner = self.write()?;
        apply_batch(&mut *inner, &batch, committed_at)
    }

    async fn query(
        &self,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<StoredItem>> {
        let mut range = KeyRange::items(partition, condition);
        if let Some(cursor) = &page.start_after {
            range = range.resume_after(cursor, page.order == ScanOrder::Descending);
        }
        let inner = self.read()?;
        let iter = scan(&inner.items, range, page.order, |_, item| Ok(item.clone()));
        collect_page(iter, page.limit, |item| item.key.encode())
    }

    async fn query_index(
        &self,
        index: IndexName,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<IndexEntry>> {
        let mut range = KeyRange::index(index, partition, condition);
        if let Some(cursor) = &page.start_after {
            range = range.resume_after(cursor, page.order == ScanOrder::Descending);
        }
        let inner = self.read()?;
        let iter = scan(&inner.index, range, page.order, |key, projection| {
            Ok(IndexEntry {
                key: decode_index_key(key)?,
                projection: projection.clone(),
            })
        });
        collect_page(iter, page.limit, |entry| entry.key.encode())
    }

    async fn get_index(&self, key: &IndexEntryKey) -> LedgerResult<Option<IndexEntry>> {
        let inner = self.read()?;
        Ok(inner.index.get(&key.encode()).map(|projection| IndexEntry {
            key: key.clone(),
            projection: projection.clone(),
        }))
    }

    async fn read_changes(&self, query: &ChangeFeedQuery) -> LedgerResult<Vec<ChangeRecord>> {
        let inner = self.read()?;
        let start = inner.changes.partition_point(|r| r.sequence <= query.after);
        Ok(inner.changes[start..]
            .iter()
            .filter(|r| {
                query
                    .partition
                    .as_ref()
                    .map_or(true, |p| &r.key.partition == p)
            })
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn latest_sequence(&self) -> LedgerResult<u64> {
        Ok(self.read()?.changes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IndexKey;
    use crate::store::Expect;
    use ledger_core::{ChangeOperation, LedgerError};
    use serde_json::json;

    fn item(pk: &str, sk: &str, version: u64) -> StoredItem {
        StoredItem {
            key: PrimaryKey::new(pk, sk),
            version,
            body: json!({"pk": pk, "sk": sk, "version": version}),
        }
    }

    fn index_key(partition: &str, sort: &str, target: &str) -> IndexEntryKey {
        IndexEntryKey::new(
            IndexKey {
                index: IndexName::ProjectDecisions,
                partition: partition.to_string(),
                sort: sort.to_string(),
            },
            PrimaryKey::new(target, "METADATA"),
        )
    }

    #[tokio::test]
    async fn test_failed_condition_applies_nothing() {
        let store = InMemoryItemStore::new();
        let mut seed = WriteBatch::new();
        seed.put(item("DECISION#a", "METADATA", 1), Expect::Absent);
        store.transact(seed).await.expect("seed should succeed");

        let mut batch = WriteBatch::new();
        batch
            .put(item("DECISION#b", "METADATA", 1), Expect::Absent)
            .put(item("DECISION#a", "METADATA", 3), Expect::Version(2))
            .put_index(index_key("p", "2024", "DECISION#b"), json!({}));
        let err = store.transact(batch).await.unwrap_err();

        assert!(matches!(
            err,
            LedgerError::Storage(StorageError::ConditionFailed { ref partition_key, .. })
                if partition_key == "DECISION#a"
        ));
        assert_eq!(store.item_count().unwrap(), 1);
        assert_eq!(store.index_entry_count().unwrap(), 0);
        assert_eq!(store.latest_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_rejected() {
        let store = InMemoryItemStore::new();
        let mut batch = WriteBatch::new();
        batch
            .put(item("DECISION#a", "METADATA", 1), Expect::Absent)
            .check(PrimaryKey::new("DECISION#a", "METADATA"), Expect::Absent);
        assert!(matches!(
            store.transact(batch).await,
            Err(LedgerError::Storage(StorageError::DuplicateBatchKey { .. }))
        ));
    }

    #[tokio::test]
    async fn test_partition_query_orders_and_pages() {
        let store = InMemoryItemStore::new();
        let mut batch = WriteBatch::new();
        for user in ["U3", "U1", "U2"] {
            batch.put(item("PROJECT#p", &format!("MEMBER#{user}"), 1), Expect::Absent);
        }
        batch.put(item("PROJECT#p", "TAG#x", 1), Expect::Absent);
        batch.put(item("PROJECT#pp", "MEMBER#U0", 1), Expect::Absent);
        store.transact(batch).await.unwrap();

        let members = SortCondition::BeginsWith("MEMBER#".to_string());
        let first = store
            .query("PROJECT#p", &members, &PageRequest::default().with_limit(2))
            .await
            .unwrap();
        let sorts: Vec<_> = first.items.iter().map(|i| i.key.sort.as_str()).collect();
        assert_eq!(sorts, ["MEMBER#U1", "MEMBER#U2"]);

        let rest = store
            .query(
                "PROJECT#p",
                &members,
                &PageRequest::default().with_limit(2).after(first.last_key),
            )
            .await
            .unwrap();
        let sorts: Vec<_> = rest.items.iter().map(|i| i.key.sort.as_str()).collect();
        assert_eq!(sorts, ["MEMBER#U3"]);
        assert!(rest.last_key.is_none());

        let desc = store
            .query("PROJECT#p", &SortCondition::All, &PageRequest::new(ScanOrder::Descending))
            .await
            .unwrap();
        assert_eq!(desc.items.len(), 4);
        assert_eq!(desc.items[0].key.sort, "TAG#x");
    }

    #[tokio::test]
    async fn test_change_feed_records_images_and_partition_sequence() {
        let store = InMemoryItemStore::new();
        let mut batch = WriteBatch::new();
        batch.put(item("DECISION#a", "METADATA", 1), Expect::Absent);
        batch.put(item("DECISION#b", "METADATA", 1), Expect::Absent);
        store.transact(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put(item("DECISION#a", "METADATA", 2), Expect::Version(1));
        batch.check(PrimaryKey::new("DECISION#b", "METADATA"), Expect::Version(1));
        let receipt = store.transact(batch).await.unwrap();
        assert_eq!(receipt.last_sequence, Some(3));

        let all = store
            .read_changes(&ChangeFeedQuery {
                after: 0,
                partition: Some("DECISION#a".to_string()),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].operation, ChangeOperation::Create);
        assert_eq!(all[1].operation, ChangeOperation::Update);
        assert_eq!(all[1].partition_sequence, 2);
        assert_eq!(all[1].before.as_ref().map(|b| b.version), Some(1));

        let tail = store
            .read_changes(&ChangeFeedQuery {
                after: 2,
                partition: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(tail.iter().map(|r| r.sequence).collect::<Vec<_>>(), [3]);
    }

    #[tokio::test]
    async fn test_index_entries_are_idempotent() {
        let store = InMemoryItemStore::new();
        let key = index_key("p", "2024-01-01", "DECISION#a");
        for _ in 0..2 {
            let mut batch = WriteBatch::new();
            batch.put_index(key.clone(), json!({"status": "open"}));
            store.transact(batch).await.unwrap();
        }
        assert_eq!(store.index_entry_count().unwrap(), 1);
        assert_eq!(store.latest_sequence().await.unwrap(), 0);

        let found = store.get_index(&key).await.unwrap().unwrap();
        assert_eq!(found.projection, json!({"status": "open"}));

        let mut batch = WriteBatch::new();
        batch.delete_index(key.clone());
        store.transact(batch).await.unwrap();
        assert!(store.get_index(&key).await.unwrap().is_none());
    }
}
