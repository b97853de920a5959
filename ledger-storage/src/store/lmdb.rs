//! LMDB-backed item store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep the ledger in a
//! memory-mapped, ACID key-value file.
//!
//! # Layout
//!
//! Four named databases inside one environment:
//! - `items`: encoded primary key -> JSON [`StoredItem`]
//! - `index`: encoded index entry key -> JSON projection
//! - `changes`: big-endian global sequence -> JSON [`ChangeRecord`]
//! - `meta`: sequence counters
//!
//! # Atomicity
//!
//! A batch is checked and applied inside one LMDB write transaction. Any
//! failure before `commit` drops the transaction, which aborts it.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use ledger_core::{Clock, LedgerError, LedgerResult, StorageError, SystemClock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{
    apply_batch, collect_page, BatchTarget, ChangeFeedQuery, ChangeRecord, CommitReceipt,
    IndexEntry, ItemStore, Page, PageRequest, ScanOrder, StoredItem, WriteBatch,
};
use crate::keys::{
    decode_index_key, IndexEntryKey, IndexName, KeyRange, PrimaryKey, SortCondition,
};

const GLOBAL_SEQUENCE_KEY: &[u8] = b"global_sequence";
const PARTITION_SEQUENCE_PREFIX: &[u8] = b"partition_sequence:";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for LedgerError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Deserialization(reason) => {
                LedgerError::Storage(StorageError::Serialization {
                    what: "lmdb value".to_string(),
                    reason,
                })
            }
            other => LedgerError::Storage(StorageError::Backend {
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_error(e: heed::Error) -> LedgerError {
    LmdbStoreError::Transaction(e.to_string()).into()
}

fn to_json<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        StorageError::Serialization {
            what: "lmdb value".to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Deserialization(e.to_string()).into())
}

fn read_u64(bytes: &[u8]) -> LedgerResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LmdbStoreError::Deserialization("invalid counter width".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// LMDB-backed item store.
///
/// # Example
///
/// ```ignore
/// use ledger_storage::LmdbItemStore;
///
/// let store = LmdbItemStore::open("/var/lib/decision-ledger", 1024)?;
/// let ledger = Ledger::builder(config).with_store(Arc::new(store)).build()?;
/// ```
pub struct LmdbItemStore {
    env: Env,
    items: Database<Bytes, Bytes>,
    index: Database<Bytes, Bytes>,
    changes: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LmdbItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbItemStore")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbItemStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the memory map in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - A named database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbStoreError::EnvOpen(format!("map size of {max_size_mb} MB overflows")))?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process and
        // the memory map is only accessed through heed transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let mut create = |name: &'static str| -> Result<Database<Bytes, Bytes>, LmdbStoreError> {
            env.create_database(&mut wtxn, Some(name))
                .map_err(|e| LmdbStoreError::DbOpen {
                    name,
                    reason: e.to_string(),
                })
        };
        let items = create("items")?;
        let index = create("index")?;
        let changes = create("changes")?;
        let meta = create("meta")?;
        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            items,
            index,
            changes,
            meta,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` for change-record commit timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn read_txn(&self) -> LedgerResult<RoTxn<'_>> {
        self.env.read_txn().map_err(txn_error)
    }

    fn scan<T, F>(
        &self,
        db: Database<Bytes, Bytes>,
        range: KeyRange,
        page: &PageRequest,
        decode: F,
    ) -> LedgerResult<Page<T>>
    where
        F: Fn(&[u8], &[u8]) -> LedgerResult<T>,
    {
        if range.is_empty() {
            return Ok(Page::empty());
        }
        let rtxn = self.read_txn()?;
        let bounds = range.as_slices();
        match page.order {
            ScanOrder::Ascending => {
                let iter = db.range(&rtxn, &bounds).map_err(txn_error)?;
                collect_keyed(iter, page.limit, &decode)
            }
            ScanOrder::Descending => {
                let iter = db.rev_range(&rtxn, &bounds).map_err(txn_error)?;
                collect_keyed(iter, page.limit, &decode)
            }
        }
    }
}

/// Page collection over raw LMDB iterators, keeping the raw key for the cursor.
fn collect_keyed<'txn, I, T, F>(iter: I, limit: Option<usize>, decode: &F) -> LedgerResult<Page<T>>
where
    I: Iterator<Item = heed::Result<(&'txn [u8], &'txn [u8])>>,
    F: Fn(&[u8], &[u8]) -> LedgerResult<T>,
{
    let decoded = iter.map(|result| {
        let (key, value) = result.map_err(txn_error)?;
        Ok((key.to_vec(), decode(key, value)?))
    });
    let page = collect_page(decoded, limit, |(key, _): &(Vec<u8>, T)| key.clone())?;
    Ok(Page {
        items: page.items.into_iter().map(|(_, value)| value).collect(),
        last_key: page.last_key,
    })
}

struct LmdbBatch<'t, 'env> {
    store: &'t LmdbItemStore,
    txn: &'t mut RwTxn<'env>,
}

impl LmdbBatch<'_, '_> {
    fn partition_sequence_key(partition: &str) -> Vec<u8> {
        let mut key = PARTITION_SEQUENCE_PREFIX.to_vec();
        key.extend_from_slice(partition.as_bytes());
        key
    }

    fn bump(&mut self, key: &[u8]) -> LedgerResult<u64> {
        let current = match self.store.meta.get(&**self.txn, key).map_err(txn_error)? {
            Some(bytes) => read_u64(bytes)?,
            None => 0,
        };
        let next = current + 1;
        self.store
            .meta
            .put(self.txn, key, &next.to_be_bytes())
            .map_err(txn_error)?;
        Ok(next)
    }
}

impl BatchTarget for LmdbBatch<'_, '_> {
    fn current_item(&mut self, key: &[u8]) -> LedgerResult<Option<StoredItem>> {
        match self.store.items.get(&**self.txn, key).map_err(txn_error)? {
            Some(bytes) => Ok(Some(from_json(bytes)?)),
            None => Ok(None),
        }
    }

    fn write_item(&mut self, key: &[u8], item: &StoredItem) -> LedgerResult<()> {
        let bytes = to_json(item)?;
        self.store
            .items
            .put(self.txn, key, &bytes)
            .map_err(txn_error)
    }

    fn remove_item(&mut self, key: &[u8]) -> LedgerResult<()> {
        self.store
            .items
            .delete(self.txn, key)
            .map(|_| ())
            .map_err(txn_error)
    }

    fn write_index(&mut self, key: &[u8], projection: &Value) -> LedgerResult<()> {
        let bytes = to_json(projection)?;
        self.store
            .index
            .put(self.txn, key, &bytes)
            .map_err(txn_error)
    }

    fn remove_index(&mut self, key: &[u8]) -> LedgerResult<()> {
        self.store
            .index
            .delete(self.txn, key)
            .map(|_| ())
            .map_err(txn_error)
    }

    fn next_sequence(&mut self) -> LedgerResult<u64> {
        self.bump(GLOBAL_SEQUENCE_KEY)
    }

    fn next_partition_sequence(&mut self, partition: &str) -> LedgerResult<u64> {
        self.bump(&Self::partition_sequence_key(partition))
    }

    fn append_change(&mut self, record: &ChangeRecord) -> LedgerResult<()> {
        let bytes = to_json(record)?;
        self.store
            .changes
            .put(self.txn, &record.sequence.to_be_bytes(), &bytes)
            .map_err(txn_error)
    }
}

#[async_trait]
impl ItemStore for LmdbItemStore {
    async fn get(&self, key: &PrimaryKey) -> LedgerResult<Option<StoredItem>> {
        let rtxn = self.read_txn()?;
        match self.items.get(&rtxn, &key.encode()).map_err(txn_error)? {
            Some(bytes) => Ok(Some(from_json(bytes)?)),
            None => Ok(None),
        }
    }

    async fn transact(&self, batch: WriteBatch) -> LedgerResult<CommitReceipt> {
        let committed_at = self.clock.now();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let receipt = {
            let mut target = LmdbBatch {
                store: self,
                txn: &mut wtxn,
            };
            apply_batch(&mut target, &batch, committed_at)?
        };
        wtxn.commit().map_err(txn_error)?;
        Ok(receipt)
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
        self.scan(self.items, range, page, |_, value| from_json(value))
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
        self.scan(self.index, range, page, |key, value| {
            Ok(IndexEntry {
                key: decode_index_key(key)?,
                projection: from_json(value)?,
            })
        })
    }

    async fn get_index(&self, key: &IndexEntryKey) -> LedgerResult<Option<IndexEntry>> {
        let rtxn = self.read_txn()?;
        match self.index.get(&rtxn, &key.encode()).map_err(txn_error)? {
            Some(bytes) => Ok(Some(IndexEntry {
                key: key.clone(),
                projection: from_json(bytes)?,
            })),
            None => Ok(None),
        }
    }

    async fn read_changes(&self, query: &ChangeFeedQuery) -> LedgerResult<Vec<ChangeRecord>> {
        let rtxn = self.read_txn()?;
        let after = query.after.to_be_bytes();
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Excluded(&after[..]), Bound::Unbounded);
        let mut records = Vec::new();
        for result in self.changes.range(&rtxn, &bounds).map_err(txn_error)? {
            if records.len() >= query.limit {
                break;
            }
            let (_, bytes) = result.map_err(txn_error)?;
            let record: ChangeRecord = from_json(bytes)?;
            if query
                .partition
                .as_ref()
                .map_or(true, |p| &record.key.partition == p)
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn latest_sequence(&self) -> LedgerResult<u64> {
        let rtxn = self.read_txn()?;
        match self.meta.get(&rtxn, GLOBAL_SEQUENCE_KEY).map_err(txn_error)? {
            Some(bytes) => read_u64(bytes),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IndexKey;
    use crate::store::Expect;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbItemStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LmdbItemStore::open(temp_dir.path(), 10).expect("Failed to open store");
        (store, temp_dir)
    }

    fn item(pk: &str, sk: &str, version: u64) -> StoredItem {
        StoredItem {
            key: PrimaryKey::new(pk, sk),
            version,
            body: json!({"version": version}),
        }
    }

    #[test]
    fn test_overflowing_map_size_is_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let result = LmdbItemStore::open(temp_dir.path(), usize::MAX);
        assert!(matches!(result, Err(LmdbStoreError::EnvOpen(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_batch_roundtrip_and_change_feed() {
        let (store, _dir) = create_test_store();
        let entry = IndexEntryKey::new(
            IndexKey {
                index: IndexName::StatusFilter,
                partition: "open#p".to_string(),
                sort: "2024-01-01T00:00:00.000000Z".to_string(),
            },
            PrimaryKey::new("DECISION#a", "METADATA"),
        );

        let mut batch = WriteBatch::new();
        batch
            .put(item("DECISION#a", "METADATA", 1), Expect::Absent)
            .put_index(entry.clone(), json!({"status": "open"}));
        let receipt = store.transact(batch).await.expect("transact should succeed");
        assert_eq!(receipt.last_sequence, Some(1));

        let got = store
            .get(&PrimaryKey::new("DECISION#a", "METADATA"))
            .await
            .expect("get should succeed");
        assert_eq!(got, Some(item("DECISION#a", "METADATA", 1)));

        let page = store
            .query_index(IndexName::StatusFilter, "open#p", &SortCondition::All, &PageRequest::default())
            .await
            .expect("query should succeed");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].key, entry);

        let changes = store
            .read_changes(&ChangeFeedQuery {
                after: 0,
                partition: None,
                limit: 10,
            })
            .await
            .expect("read_changes should succeed");
        assert_eq!(changes.len(), 1);
        assert_eq!(store.latest_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_condition_failure_aborts_transaction() {
        let (store, _dir) = create_test_store();
        let mut seed = WriteBatch::new();
        seed.put(item("DECISION#a", "METADATA", 1), Expect::Absent);
        store.transact(seed).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put(item("DECISION#b", "METADATA", 1), Expect::Absent)
            .put(item("DECISION#a", "METADATA", 2), Expect::Absent);
        assert!(store.transact(batch).await.is_err());

        assert!(store
            .get(&PrimaryKey::new("DECISION#b", "METADATA"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.latest_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_preserves_items_and_sequences() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let store = LmdbItemStore::open(temp_dir.path(), 10).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(item("PROJECT#p", "METADATA", 1), Expect::Absent);
            store.transact(batch).await.unwrap();
        }

        let store = LmdbItemStore::open(temp_dir.path(), 10).unwrap();
        assert!(store
            .get(&PrimaryKey::new("PROJECT#p", "METADATA"))
            .await
            .unwrap()
            .is_some());

        let mut batch = WriteBatch::new();
        batch.put(item("PROJECT#p", "METADATA", 2), Expect::Version(1));
        let receipt = store.transact(batch).await.unwrap();
        assert_eq!(receipt.last_sequence, Some(2));
    }

    #[tokio::test]
    async fn test_descending_pages_resume_from_cursor() {
        let (store, _dir) = create_test_store();
        let mut batch = WriteBatch::new();
        for n in 1..=5 {
            batch.put(item("DECISION#a", &format!("PARTICIPANT#U{n}"), 1), Expect::Absent);
        }
        store.transact(batch).await.unwrap();

        let request = PageRequest::new(ScanOrder::Descending).with_limit(3);
        let first = store
            .query("DECISION#a", &SortCondition::BeginsWith("PARTICIPANT#".into()), &request)
            .await
            .unwrap();
        let sorts: Vec<_> = first.items.iter().map(|i| i.key.sort.clone()).collect();
        assert_eq!(sorts, ["PARTICIPANT#U5", "PARTICIPANT#U4", "PARTICIPANT#U3"]);

        let second = store
            .query(
                "DECISION#a",
                &SortCondition::BeginsWith("PARTICIPANT#".into()),
                &request.clone().after(first.last_key),
            )
            .await
            .unwrap();
        let sorts: Vec<_> = second.items.iter().map(|i| i.key.sort.clone()).collect();
        assert_eq!(sorts, ["PARTICIPANT#U2", "PARTICIPANT#U1"]);
        assert!(second.last_key.is_none());
    }
}
