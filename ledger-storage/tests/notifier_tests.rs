//! Change notifier delivery: ordering, at-least-once redelivery, resume and
//! the background delivery loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ledger_core::ChangeOperation;
use ledger_test_utils::fixtures::*;
use ledger_test_utils::*;
use tokio::sync::watch;

async fn wait_for_events(sink: &RecordingSink, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.events().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events delivered in time");
}

#[tokio::test]
async fn test_events_follow_commit_order() -> LedgerResult<()> {
    let sample = seed_sample_ledger().await?;
    let sink = RecordingSink::new();
    let mut notifier = sample.ledger.notifier();

    let delivered = notifier.drain(&sink).await?;
    let events = sink.events();
    assert_eq!(delivered, events.len());
    assert_eq!(notifier.cursor(), sample.ledger.store().latest_sequence().await?);

    let globals: Vec<u64> = events.iter().map(|e| e.sequence_token.global).collect();
    assert!(globals.windows(2).all(|w| w[0] < w[1]), "{globals:?}");

    let mut last_per_partition: HashMap<&str, u64> = HashMap::new();
    for event in &events {
        let partition = event.sequence_token.partition;
        if let Some(previous) = last_per_partition.insert(event.partition_key.as_str(), partition) {
            assert!(previous < partition, "{} went {previous} -> {partition}", event.partition_key);
        }
    }

    // The first event is the Backend Rewrite project itself.
    assert_eq!(events[0].entity_kind, EntityKind::Project);
    assert_eq!(events[0].operation, ChangeOperation::Create);
    assert!(events[0].before.is_none());
    assert_eq!(events[0].version, 1);

    // Superseding D1 shows up as an update carrying both images.
    let superseded = events
        .iter()
        .filter(|e| e.entity_kind == EntityKind::Decision && e.operation == ChangeOperation::Update)
        .find(|e| {
            e.after.as_ref().and_then(|a| a.get("status")).and_then(|s| s.as_str())
                == Some("superseded")
        })
        .expect("supersede event");
    let before_status = superseded
        .before
        .as_ref()
        .and_then(|b| b.get("status"))
        .and_then(|s| s.as_str());
    assert_eq!(before_status, Some("open"));
    Ok(())
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered() -> LedgerResult<()> {
    let (ledger, _clock) = test_ledger();
    let repo = ledger.repository();
    repo.create_project(NewProject::new("P", user("U001"))).await?;

    let sink = RecordingSink::failing(1);
    let mut notifier = ledger.notifier();
    assert!(notifier.drain(&sink).await.is_err());
    assert_eq!(notifier.cursor(), 0);
    assert!(sink.events().is_empty());

    let delivered = notifier.drain(&sink).await?;
    assert_eq!(delivered, 2);
    assert_eq!(sink.attempts(), 2);
    assert_eq!(notifier.cursor(), 2);
    assert_eq!(notifier.drain(&sink).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_resume_from_persisted_cursor() -> LedgerResult<()> {
    let (ledger, _clock) = test_ledger();
    let repo = ledger.repository();
    let project = repo.create_project(NewProject::new("P", user("U001"))).await?;

    let first = RecordingSink::new();
    let mut notifier = ledger.notifier();
    notifier.drain(&first).await?;
    let persisted = notifier.cursor();
    drop(notifier);

    repo.add_tag(TagTarget::Project(project.id), tag("launch"))
        .await?;
    repo.remove_tag(TagTarget::Project(project.id), tag("launch"))
        .await?;

    let second = RecordingSink::new();
    let mut resumed = ledger.notifier().resume_from(persisted);
    resumed.drain(&second).await?;
    let events = second.events();
    let ops: Vec<ChangeOperation> = events.iter().map(|e| e.operation).collect();
    assert_eq!(ops, [ChangeOperation::Create, ChangeOperation::Delete]);
    assert!(events.iter().all(|e| e.entity_kind == EntityKind::Tag));

    let delete = &events[1];
    assert!(delete.after.is_none());
    assert!(delete.before.is_some());
    assert_eq!(delete.version, 2);
    Ok(())
}

#[tokio::test]
async fn test_partition_filter() -> LedgerResult<()> {
    let sample = seed_sample_ledger().await?;
    let partition = format!("PROJECT#{}", sample.mobile_app.id);

    let sink = RecordingSink::new();
    let mut notifier = sample.ledger.notifier().for_partition(partition.clone());
    notifier.drain(&sink).await?;
    let events = sink.events();

    // Project create, owner, added member, settings update.
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.partition_key == partition));
    let partition_sequences: Vec<u64> = events.iter().map(|e| e.sequence_token.partition).collect();
    assert_eq!(partition_sequences, [1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_consumer_skips_duplicate_events() -> LedgerResult<()> {
    let (ledger, _clock) = test_ledger();
    let repo = ledger.repository();
    let project = repo.create_project(NewProject::new("P", user("U001"))).await?;
    let decision = repo.create_decision(NewDecision::new(project.id, "t", "b")).await?;
    repo.update_decision_status(decision.id, DecisionStatus::Confirmed)
        .await?;

    let sink = RecordingSink::new();
    let notifier = ledger.notifier();
    let batch = notifier.poll().await?;
    sink.deliver(&batch).await?;
    sink.deliver(&batch).await?;

    // Idempotent application keyed by item and version.
    let mut applied: HashMap<(String, String), u64> = HashMap::new();
    let mut applications = 0;
    for event in sink.events() {
        let key = (event.partition_key.clone(), event.sort_key.clone());
        if event.is_newer_than(applied.get(&key).copied()) {
            applied.insert(key, event.version);
            applications += 1;
        }
    }
    assert_eq!(applications, batch.len());
    let decision_key = (format!("DECISION#{}", decision.id), "METADATA".to_string());
    assert_eq!(applied.get(&decision_key), Some(&2));
    Ok(())
}

// ============================================================================
// BACKGROUND LOOP
// ============================================================================

#[tokio::test]
async fn test_run_delivers_until_shutdown() -> LedgerResult<()> {
    let (ledger, _clock) = test_ledger();
    let repo = ledger.repository();
    let sink = Arc::new(RecordingSink::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ledger.notifier().run(sink.clone(), shutdown_rx));

    let project = repo.create_project(NewProject::new("P", user("U001"))).await?;
    wait_for_events(&sink, 2).await;
    repo.add_member(project.id, user("U002"), MemberRole::Member)
        .await?;
    wait_for_events(&sink, 3).await;

    shutdown_tx.send(true).expect("notifier still running");
    let cursor = handle.await.expect("notifier task");
    assert_eq!(cursor, 3);
    assert_eq!(sink.events().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_run_retries_a_rejecting_sink() -> LedgerResult<()> {
    let (ledger, _clock) = test_ledger();
    ledger
        .repository()
        .create_project(NewProject::new("P", user("U001")))
        .await?;

    let sink = Arc::new(RecordingSink::failing(2));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ledger.notifier().run(sink.clone(), shutdown_rx));

    wait_for_events(&sink, 2).await;
    assert_eq!(sink.attempts(), 3);

    shutdown_tx.send(true).expect("notifier still running");
    assert_eq!(handle.await.expect("notifier task"), 2);
    Ok(())
}
