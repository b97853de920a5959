//! Decision Ledger Test Utilities
//!
//! Shared test infrastructure for the ledger workspace:
//! - Proptest generators for identifiers, statuses and roles
//! - A fault-injecting item store and an unreliable change sink
//! - Fixtures, including the two-project sample ledger
//! - Assertions for ledger error variants

pub use ledger_core::{
    ChangeEvent, Clock, Decision, DecisionId, DecisionSource, DecisionStatus, EntityKind,
    IdGenerator, LedgerConfig, LedgerError, LedgerResult, ManualClock, MemberRole, NewDecision,
    NewProject, ParticipantRole, Project, ProjectId, ProjectSettingsUpdate, RetryPolicy,
    SourceKind, StorageError, TagName, TagTarget, Timestamp, UserId,
};
pub use ledger_storage::{
    ChangeFeedQuery, ChangeRecord, ChangeSink, CommitReceipt, InMemoryItemStore, IndexEntry,
    IndexEntryKey, IndexName, ItemStore, Ledger, Page, PageRequest, PrimaryKey, SortCondition,
    StoredItem, WriteBatch,
};

use async_trait::async_trait;
use chrono::TimeZone;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-friendly fmt subscriber once per process. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ledger types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_project_id() -> impl Strategy<Value = ProjectId> {
        any::<[u8; 16]>().prop_map(|bytes| ProjectId::from_uuid(Uuid::from_bytes(bytes)))
    }

    pub fn arb_decision_id() -> impl Strategy<Value = DecisionId> {
        any::<[u8; 16]>().prop_map(|bytes| DecisionId::from_uuid(Uuid::from_bytes(bytes)))
    }

    /// Chat-style user ids such as `U0042`.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        "U[0-9A-Z]{3,10}".prop_map(|s| UserId::new(s).expect("generated user id is valid"))
    }

    pub fn arb_tag_name() -> impl Strategy<Value = TagName> {
        "[a-z][a-z0-9\\-]{0,15}".prop_map(|s| TagName::new(s).expect("generated tag is valid"))
    }

    pub fn arb_decision_status() -> impl Strategy<Value = DecisionStatus> {
        prop_oneof![
            Just(DecisionStatus::Open),
            Just(DecisionStatus::Confirmed),
            Just(DecisionStatus::Superseded),
        ]
    }

    /// Roles that can be granted after project creation.
    pub fn arb_grantable_role() -> impl Strategy<Value = MemberRole> {
        prop_oneof![Just(MemberRole::Admin), Just(MemberRole::Member)]
    }

    pub fn arb_participant_role() -> impl Strategy<Value = ParticipantRole> {
        prop_oneof![
            Just(ParticipantRole::Proposer),
            Just(ParticipantRole::Decider),
            Just(ParticipantRole::Approver),
            Just(ParticipantRole::Contributor),
        ]
    }

    pub fn arb_title() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9 ,.]{0,60}"
    }

    /// Offsets in seconds from the fixture epoch, for ordering tests.
    pub fn arb_creation_offsets(max_len: usize) -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(0u32..86_400, 1..=max_len)
    }
}

// ============================================================================
// MOCK SUBSTRATE AND SINK
// ============================================================================

/// Fault injected into the next [`FlakyStore`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail without applying anything.
    Transient,
    /// Apply the first `items` item writes and `index` index writes, then fail.
    PartialApply { items: usize, index: usize },
    /// Apply the batch after sleeping; long enough delays trip the call timeout.
    Delay(Duration),
    /// Commit another writer's batch to the inner store, then apply this one.
    Interleave(WriteBatch),
}

fn injected(operation: &str) -> LedgerError {
    StorageError::Transient {
        operation: operation.to_string(),
        reason: "injected fault".to_string(),
    }
    .into()
}

/// Item store wrapper whose batches fail, stall or land partially on demand.
///
/// Models a substrate without atomic batches. Faults are consumed in order,
/// one per `transact` call; reads fail while `failing_reads` is non-zero.
pub struct FlakyStore {
    inner: Arc<dyn ItemStore>,
    faults: Mutex<VecDeque<Fault>>,
    failing_reads: AtomicUsize,
    transact_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ItemStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(VecDeque::new()),
            failing_reads: AtomicUsize::new(0),
            transact_calls: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryItemStore::new()))
    }

    pub fn push_fault(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(fault);
    }

    /// Fail the next `count` point reads and range queries transiently.
    pub fn fail_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn transact_calls(&self) -> usize {
        self.transact_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn ItemStore> {
        &self.inner
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn read_fault(&self, operation: &str) -> LedgerResult<()> {
        let failed = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(injected(operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn get(&self, key: &PrimaryKey) -> LedgerResult<Option<StoredItem>> {
        self.read_fault("get")?;
        self.inner.get(key).await
    }

    async fn transact(&self, batch: WriteBatch) -> LedgerResult<CommitReceipt> {
        self.transact_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_fault() {
            None => self.inner.transact(batch).await,
            Some(Fault::Transient) => Err(injected("transact")),
            Some(Fault::PartialApply { items, index }) => {
                let prefix = WriteBatch {
                    items: batch.items.into_iter().take(items).collect(),
                    index: batch.index.into_iter().take(index).collect(),
                };
                if !prefix.is_empty() {
                    self.inner.transact(prefix).await?;
                }
                Err(injected("transact"))
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.inner.transact(batch).await
            }
            Some(Fault::Interleave(concurrent)) => {
                self.inner.transact(concurrent).await?;
                self.inner.transact(batch).await
            }
        }
    }

    async fn query(
        &self,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<StoredItem>> {
        self.read_fault("query")?;
        self.inner.query(partition, condition, page).await
    }

    async fn query_index(
        &self,
        index: IndexName,
        partition: &str,
        condition: &SortCondition,
        page: &PageRequest,
    ) -> LedgerResult<Page<IndexEntry>> {
        self.read_fault("query_index")?;
        self.inner.query_index(index, partition, condition, page).await
    }

    async fn get_index(&self, key: &IndexEntryKey) -> LedgerResult<Option<IndexEntry>> {
        self.read_fault("get_index")?;
        self.inner.get_index(key).await
    }

    async fn read_changes(&self, query: &ChangeFeedQuery) -> LedgerResult<Vec<ChangeRecord>> {
        self.inner.read_changes(query).await
    }

    async fn latest_sequence(&self) -> LedgerResult<u64> {
        self.inner.latest_sequence().await
    }
}

/// Change sink that records deliveries and rejects the first `n` of them.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChangeEvent>>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    /// Events accepted so far, in delivery order (duplicates included).
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Delivery calls made, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSink for RecordingSink {
    async fn deliver(&self, events: &[ChangeEvent]) -> LedgerResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(injected("deliver"));
        }
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(events);
        Ok(())
    }
}

/// Id generator that replays a fixed script, then falls back to UUIDv7.
pub struct ScriptedIds {
    script: Mutex<VecDeque<Uuid>>,
}

impl ScriptedIds {
    pub fn new(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            script: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// The same id `times` times in a row.
    pub fn repeating(id: Uuid, times: usize) -> Self {
        Self::new(std::iter::repeat(id).take(times))
    }
}

impl IdGenerator for ScriptedIds {
    fn next_uuid(&self) -> Uuid {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(Uuid::now_v7)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built ledgers for common test scenarios.

    use super::*;

    /// 2024-01-15T09:00:00Z, the clock start of every fixture ledger.
    pub fn epoch() -> Timestamp {
        chrono::Utc
            .with_ymd_and_hms(2024, 1, 15, 9, 0, 0)
            .single()
            .expect("valid fixture epoch")
    }

    /// Retry policy with millisecond backoff so fault tests stay fast.
    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(4)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
            .with_call_timeout(Duration::from_millis(500))
    }

    pub fn test_config() -> LedgerConfig {
        LedgerConfig::for_environment("test").with_retry(fast_retry())
    }

    pub fn user(id: &str) -> UserId {
        UserId::new(id).expect("fixture user id is valid")
    }

    pub fn tag(name: &str) -> TagName {
        TagName::new(name).expect("fixture tag is valid")
    }

    /// In-memory ledger driven by a manual clock starting at [`epoch`].
    pub fn test_ledger() -> (Ledger, ManualClock) {
        test_ledger_with(Arc::new(InMemoryItemStore::new()), test_config())
    }

    pub fn test_ledger_with(store: Arc<dyn ItemStore>, config: LedgerConfig) -> (Ledger, ManualClock) {
        init_test_tracing();
        let clock = ManualClock::new(epoch());
        let ledger = Ledger::builder(config)
            .with_store(store)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .expect("fixture ledger builds");
        (ledger, clock)
    }

    /// The two-project sample data set used for local development.
    pub struct SampleLedger {
        pub ledger: Ledger,
        pub clock: ManualClock,
        pub backend_rewrite: Project,
        pub mobile_app: Project,
        /// "Launch date set for March 15th", superseded by `launch_april`.
        pub launch_march: Decision,
        /// "Use DynamoDB for the new service", confirmed.
        pub dynamodb: Decision,
        /// Open framework evaluation recorded in a meeting.
        pub framework_eval: Decision,
        /// "Launch date moved to April 1st", confirmed.
        pub launch_april: Decision,
    }

    /// Seed a ledger with the sample data, advancing the clock one minute per write.
    pub async fn seed_sample_ledger() -> LedgerResult<SampleLedger> {
        let (ledger, clock) = test_ledger();
        seed_into(ledger, clock).await
    }

    pub async fn seed_into(ledger: Ledger, clock: ManualClock) -> LedgerResult<SampleLedger> {
        let repo = ledger.repository();
        let tick = || clock.advance(chrono::Duration::minutes(1));

        let backend_rewrite = repo
            .create_project(
                NewProject::new("Backend Rewrite", user("U001"))
                    .with_description("Rewriting the backend services in Rust")
                    .with_slack_channel("#backend")
                    .with_slack_channel("#engineering")
                    .with_notification_channel("#backend-decisions"),
            )
            .await?;
        tick();
        repo.add_member(backend_rewrite.id, user("U002"), MemberRole::Member)
            .await?;
        tick();
        let mobile_app = repo
            .create_project(
                NewProject::new("Mobile App v2", user("U003"))
                    .with_description("Next generation mobile experience")
                    .with_slack_channel("#mobile")
                    .with_slack_channel("#product")
                    .with_notification_channel("#mobile-updates"),
            )
            .await?;
        tick();
        repo.add_member(mobile_app.id, user("U001"), MemberRole::Member)
            .await?;
        tick();

        let launch_march = repo
            .create_decision(
                NewDecision::new(
                    backend_rewrite.id,
                    "Launch date set for March 15th",
                    "The team agreed to target March 15th for the public launch.",
                )
                .with_author(user("U001"))
                .with_source(DecisionSource::new(SourceKind::Slack).with_channel("#backend"))
                .with_participant(user("U001"), ParticipantRole::Decider)
                .with_participant(user("U002"), ParticipantRole::Approver),
            )
            .await?;
        tick();
        for name in ["timeline", "launch"] {
            repo.add_tag(TagTarget::Decision(launch_march.id), tag(name))
                .await?;
        }
        tick();

        let dynamodb = repo
            .create_decision(
                NewDecision::new(
                    backend_rewrite.id,
                    "Use DynamoDB for the new service",
                    "Single-table design with four secondary indexes.",
                )
                .with_author(user("U002"))
                .with_source(DecisionSource::new(SourceKind::Slack).with_channel("#engineering")),
            )
            .await?;
        tick();
        let dynamodb = repo
            .update_decision_status(dynamodb.id, DecisionStatus::Confirmed)
            .await?;
        tick();

        let framework_eval = repo
            .create_decision(
                NewDecision::new(
                    mobile_app.id,
                    "Evaluating React Native vs Flutter for the mobile rewrite",
                    "No decision yet; prototypes due next sprint.",
                )
                .with_author(user("U003"))
                .with_source(DecisionSource::new(SourceKind::Meeting).with_channel("Weekly Standup")),
            )
            .await?;
        tick();
        // Enabled after the evaluation was recorded, so it stays open.
        let mobile_app = repo
            .update_project_settings(
                mobile_app.id,
                ProjectSettingsUpdate {
                    auto_confirm_meeting_decisions: Some(true),
                    ..ProjectSettingsUpdate::default()
                },
            )
            .await?;
        tick();

        let launch_april = repo
            .create_decision(
                NewDecision::new(
                    backend_rewrite.id,
                    "Launch date moved to April 1st",
                    "Load testing needs two more weeks.",
                )
                .with_author(user("U001"))
                .superseding(launch_march.id),
            )
            .await?;
        tick();
        let launch_april = repo
            .update_decision_status(launch_april.id, DecisionStatus::Confirmed)
            .await?;
        tick();
        let launch_march = repo.get_decision(launch_march.id).await?;

        Ok(SampleLedger {
            ledger,
            clock,
            backend_rewrite,
            mobile_app,
            launch_march,
            dynamodb,
            framework_eval,
            launch_april,
        })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for ledger error variants.

    use super::*;

    pub fn assert_not_found<T: std::fmt::Debug>(result: &LedgerResult<T>, kind: EntityKind) {
        match result {
            Err(LedgerError::NotFound { kind: actual, .. }) => {
                assert_eq!(*actual, kind, "NotFound for the wrong entity kind")
            }
            other => panic!("Expected NotFound({kind}), got {other:?}"),
        }
    }

    pub fn assert_conflict<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        assert!(
            matches!(result, Err(LedgerError::Conflict { .. })),
            "Expected Conflict, got {result:?}"
        );
    }

    pub fn assert_invalid_state<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        assert!(
            matches!(result, Err(LedgerError::InvalidState { .. })),
            "Expected InvalidState, got {result:?}"
        );
    }

    pub fn assert_invalid_transition<T: std::fmt::Debug>(
        result: &LedgerResult<T>,
        from: DecisionStatus,
        to: DecisionStatus,
    ) {
        match result {
            Err(LedgerError::InvalidTransition {
                from: actual_from,
                to: actual_to,
                ..
            }) => {
                assert_eq!((*actual_from, *actual_to), (from, to));
            }
            other => panic!("Expected InvalidTransition({from} -> {to}), got {other:?}"),
        }
    }

    pub fn assert_unavailable<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        assert!(
            matches!(result, Err(LedgerError::Unavailable { .. })),
            "Expected Unavailable, got {result:?}"
        );
    }

    /// Assert `decisions` are sorted by creation time (ties by id), oldest first.
    pub fn assert_created_ascending(decisions: &[Decision]) {
        for pair in decisions.windows(2) {
            assert!(
                (pair[0].created_at, pair[0].id.to_string()) <= (pair[1].created_at, pair[1].id.to_string()),
                "{} created at {} listed before {} created at {}",
                pair[0].id,
                pair[0].created_at,
                pair[1].id,
                pair[1].created_at
            );
        }
    }
}
