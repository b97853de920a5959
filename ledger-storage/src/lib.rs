//! Decision Ledger Storage - Single-Table Store, Index Maintenance and Change Feed
//!
//! Maps ledger entities onto one keyed store with four derived indexes,
//! keeps those indexes consistent with their primary records, answers the
//! ledger's access-pattern queries and publishes committed writes as ordered
//! change events.

pub mod keys;
pub mod maintenance;
pub mod notifier;
pub mod query;
pub mod record;
pub mod repository;
pub mod retry;
pub mod store;

mod ledger;

pub use ledger::{Ledger, LedgerBuilder};

pub use keys::{IndexEntryKey, IndexKey, IndexName, ItemKey, PrimaryKey, Projection, SortCondition};
pub use maintenance::{IndexMaintenance, ReconcileReport, StatusChange};
pub use notifier::{ChangeNotifier, ChangeSink};
pub use query::{DecisionScan, Queries, ScanOptions, TimeRange, UserProject};
pub use record::LedgerRecord;
pub use repository::Repository;
pub use store::{
    ChangeFeedQuery, ChangeRecord, CommitReceipt, Expect, InMemoryItemStore, IndexEntry,
    IndexWrite, ItemStore, ItemWrite, LmdbItemStore, LmdbStoreError, Page, PageRequest,
    ScanOrder, StoredItem, WriteBatch,
};
