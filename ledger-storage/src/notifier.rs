//! Change notifier.
//!
//! Turns the store's change feed into [`ChangeEvent`]s for downstream
//! consumers. The write path only advances a watch channel; delivery runs
//! wherever the consumer drives [`ChangeNotifier::drain`] or
//! [`ChangeNotifier::run`].
//!
//! Delivery is at-least-once: the cursor moves only after the sink accepts a
//! batch, so a failed batch is delivered again. Consumers deduplicate with
//! [`ChangeEvent::is_newer_than`] and the sequence token.

use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::{ChangeEvent, LedgerResult, RetryPolicy, SequenceToken};
use tokio::sync::watch;

use crate::retry::with_retry;
use crate::store::{ChangeFeedQuery, ChangeRecord, ItemStore};

/// Downstream consumer of change events.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Accept a batch in sequence order. An error leaves the batch undelivered.
    async fn deliver(&self, events: &[ChangeEvent]) -> LedgerResult<()>;
}

/// Convert a change record into its outbound event.
pub fn to_event(record: &ChangeRecord) -> LedgerResult<ChangeEvent> {
    let entity_kind = record.key.to_item_key()?.kind();
    let version = match (&record.after, &record.before) {
        (Some(after), _) => after.version,
        (None, Some(before)) => before.version + 1,
        (None, None) => 0,
    };
    Ok(ChangeEvent {
        entity_kind,
        operation: record.operation,
        partition_key: record.key.partition.clone(),
        sort_key: record.key.sort.clone(),
        before: record.before.as_ref().map(|item| item.body.clone()),
        after: record.after.as_ref().map(|item| item.body.clone()),
        version,
        sequence_token: SequenceToken {
            global: record.sequence,
            partition: record.partition_sequence,
        },
        committed_at: record.committed_at,
    })
}

/// Cursor over the change feed.
pub struct ChangeNotifier {
    store: Arc<dyn ItemStore>,
    retry: RetryPolicy,
    signal: watch::Receiver<u64>,
    cursor: u64,
    batch_size: usize,
    partition: Option<String>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("cursor", &self.cursor)
            .field("batch_size", &self.batch_size)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl ChangeNotifier {
    pub(crate) fn new(
        store: Arc<dyn ItemStore>,
        retry: RetryPolicy,
        signal: watch::Receiver<u64>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            retry,
            signal,
            cursor: 0,
            batch_size: batch_size.max(1),
            partition: None,
        }
    }

    /// Global sequence of the last delivered event.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Continue after `sequence`, a cursor the consumer persisted earlier.
    pub fn resume_from(mut self, sequence: u64) -> Self {
        self.cursor = sequence;
        self
    }

    /// Only deliver changes to items under one partition key.
    pub fn for_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Next batch after the cursor, without advancing it.
    pub async fn poll(&self) -> LedgerResult<Vec<ChangeEvent>> {
        let query = ChangeFeedQuery {
            after: self.cursor,
            partition: self.partition.clone(),
            limit: self.batch_size,
        };
        let records =
            with_retry(&self.retry, "read_changes", || self.store.read_changes(&query)).await?;
        records.iter().map(to_event).collect()
    }

    /// Deliver everything currently in the feed. Returns the number of events delivered.
    pub async fn drain(&mut self, sink: &dyn ChangeSink) -> LedgerResult<usize> {
        let mut delivered = 0;
        loop {
            let events = self.poll().await?;
            let Some(last) = events.last() else {
                return Ok(delivered);
            };
            let next_cursor = last.sequence_token.global;
            sink.deliver(&events).await?;
            self.cursor = next_cursor;
            delivered += events.len();
            tracing::debug!(cursor = self.cursor, events = events.len(), "Delivered change batch");
        }
    }

    /// Deliver changes as they are committed until `shutdown` turns true.
    ///
    /// A failed delivery is retried with backoff. Returns the final cursor.
    pub async fn run(
        mut self,
        sink: Arc<dyn ChangeSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        tracing::info!(cursor = self.cursor, partition = ?self.partition, "Change notifier started");
        let mut failures: u32 = 0;
        loop {
            self.signal.borrow_and_update();
            match self.drain(sink.as_ref()).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(cursor = self.cursor, failures, error = %e, "Change delivery failed, will redeliver");
                }
            }
            let backoff = self.retry.backoff_for(failures.max(1));

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = self.signal.changed(), if failures == 0 => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff), if failures > 0 => {}
            }
        }
        tracing::info!(cursor = self.cursor, "Change notifier stopped");
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrimaryKey;
    use crate::store::StoredItem;
    use chrono::Utc;
    use ledger_core::{ChangeOperation, DecisionId, EntityKind};
    use serde_json::json;

    #[test]
    fn test_delete_event_carries_next_version() {
        let key = PrimaryKey::new(format!("DECISION#{}", DecisionId::new()), "TAG#launch");
        let record = ChangeRecord {
            sequence: 9,
            partition_sequence: 3,
            key: key.clone(),
            operation: ChangeOperation::Delete,
            before: Some(StoredItem {
                key,
                version: 1,
                body: json!({"name": "launch"}),
            }),
            after: None,
            committed_at: Utc::now(),
        };
        let event = to_event(&record).unwrap();
        assert_eq!(event.entity_kind, EntityKind::Tag);
        assert_eq!(event.version, 2);
        assert_eq!(event.sequence_token, SequenceToken { global: 9, partition: 3 });
        assert!(event.after.is_none());
        assert!(event.is_newer_than(Some(1)));
    }
}
