//! The full ledger on the LMDB backend.

use std::sync::Arc;

use ledger_core::StoreBackend;
use ledger_storage::TimeRange;
use ledger_test_utils::assertions::*;
use ledger_test_utils::fixtures::*;
use ledger_test_utils::*;
use tempfile::TempDir;

fn lmdb_config(dir: &TempDir) -> LedgerConfig {
    test_config().with_backend(StoreBackend::Lmdb {
        path: dir.path().to_path_buf(),
        max_size_mb: 32,
    })
}

fn open_lmdb_ledger(dir: &TempDir) -> (Ledger, ManualClock) {
    init_test_tracing();
    let clock = ManualClock::new(epoch());
    let ledger = Ledger::builder(lmdb_config(dir))
        .with_clock(Arc::new(clock.clone()))
        .build()
        .expect("LMDB ledger opens");
    (ledger, clock)
}

#[tokio::test]
async fn test_sample_ledger_on_lmdb() -> LedgerResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (ledger, clock) = open_lmdb_ledger(&dir);
    let sample = seed_into(ledger, clock).await?;
    let queries = sample.ledger.queries();

    let superseded = queries
        .list_decisions_by_status(
            sample.backend_rewrite.id,
            DecisionStatus::Superseded,
            TimeRange::all(),
        )
        .await?;
    assert_eq!(superseded, vec![sample.launch_march.clone()]);

    let confirmed = queries
        .list_decisions_by_status(
            sample.backend_rewrite.id,
            DecisionStatus::Confirmed,
            TimeRange::all(),
        )
        .await?;
    let ids: Vec<DecisionId> = confirmed.iter().map(|d| d.id).collect();
    assert_eq!(ids, [sample.dynamodb.id, sample.launch_april.id]);

    let successor = queries.find_superseding_decision(sample.launch_march.id).await?;
    assert_eq!(successor, Some(sample.launch_april.clone()));

    let u001 = queries.list_projects_for_user(&user("U001")).await?;
    assert_eq!(u001.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_ledger_survives_reopen() -> LedgerResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (project, decision, sequence) = {
        let (ledger, _clock) = open_lmdb_ledger(&dir);
        let repo = ledger.repository();
        let project = repo.create_project(NewProject::new("P", user("U001"))).await?;
        let decision = repo.create_decision(NewDecision::new(project.id, "t", "b")).await?;
        let sequence = ledger.store().latest_sequence().await?;
        (project, decision, sequence)
    };

    let (ledger, _clock) = open_lmdb_ledger(&dir);
    let repo = ledger.repository();
    assert_eq!(repo.get_project(project.id).await?, project);
    assert_eq!(repo.get_decision(decision.id).await?, decision);
    assert_eq!(ledger.store().latest_sequence().await?, sequence);

    let confirmed = repo
        .update_decision_status(decision.id, DecisionStatus::Confirmed)
        .await?;
    assert_eq!(confirmed.version, 2);
    let listed = ledger
        .queries()
        .list_decisions_by_status(project.id, DecisionStatus::Confirmed, TimeRange::all())
        .await?;
    assert_eq!(listed, vec![confirmed]);

    // The feed continues the numbering from before the reopen.
    let sink = RecordingSink::new();
    ledger.notifier().resume_from(sequence).drain(&sink).await?;
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence_token.global, sequence + 1);
    Ok(())
}

#[tokio::test]
async fn test_lmdb_rejects_conflicting_and_illegal_writes() -> LedgerResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (ledger, _clock) = open_lmdb_ledger(&dir);
    let repo = ledger.repository();
    let project = repo.create_project(NewProject::new("P", user("U001"))).await?;
    let decision = repo.create_decision(NewDecision::new(project.id, "t", "b")).await?;
    let before = ledger.store().latest_sequence().await?;

    assert_conflict(
        &repo
            .update_decision_status_at(decision.id, 7, DecisionStatus::Confirmed)
            .await,
    );
    let superseded = repo
        .update_decision_status(decision.id, DecisionStatus::Superseded)
        .await?;
    assert_invalid_transition(
        &repo
            .update_decision_status(decision.id, DecisionStatus::Open)
            .await,
        DecisionStatus::Superseded,
        DecisionStatus::Open,
    );
    assert_eq!(repo.get_decision(decision.id).await?, superseded);
    assert_eq!(ledger.store().latest_sequence().await?, before + 1);
    Ok(())
}

#[test]
fn test_invalid_lmdb_config_is_rejected() {
    let config = test_config().with_backend(StoreBackend::Lmdb {
        path: std::path::PathBuf::new(),
        max_size_mb: 32,
    });
    let result = Ledger::open(config);
    assert!(matches!(result, Err(LedgerError::Config(_))), "got {result:?}");
}
