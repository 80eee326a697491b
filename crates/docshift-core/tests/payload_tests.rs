//! Runs whose documents sit close to the request size limit

use docshift_core::checkpoint::BACKUPS_COLLECTION;
use docshift_core::prelude::*;
use docshift_core::RollbackOutcome;
use docshift_store::{MemoryStore, StoreLimits};
use docshift_test_utils::*;
use std::sync::Arc;
use std::time::Duration;

const SMALL_REQUEST: usize = 64 * 1024;

/// Store limited to 64 KiB requests, seeded with ~1.25 KB documents
fn tight_store(count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_limits(StoreLimits {
        max_request_bytes: SMALL_REQUEST,
        ..StoreLimits::default()
    }));
    seed_padded(&store, COLLECTION, count, 1_170);
    store
}

/// 50 documents at 1300 estimated bytes fit one request, but their backup
/// records do not
fn tight_config() -> JobConfig {
    let mut config = fast_config(50, 2);
    config.estimated_document_bytes = 1_300;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_documents_complete_under_default_limits() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    seed_padded(&store, COLLECTION, 300, 44_000);
    let mut config = fast_config(200, 2);
    config.estimated_document_bytes = 50_000;

    let handle = Orchestrator::new(store.clone())
        .start(test_spec(config), rename_owner())
        .await
        .unwrap();
    assert_eq!(handle.wait().await, JobStatus::Completed);

    assert_eq!(handle.progress().documents_migrated, 300);
    assert_eq!(count_in_shape(&store.snapshot(COLLECTION), TARGET), 300);
    assert_eq!(store.snapshot(BACKUPS_COLLECTION).len(), 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_records_are_split_to_fit_small_requests() {
    init_tracing();
    let store = tight_store(300);
    let handle = Orchestrator::new(store.clone())
        .start(test_spec(tight_config()), rename_owner())
        .await
        .unwrap();
    assert_eq!(handle.wait().await, JobStatus::Completed);

    let backups = store.snapshot(BACKUPS_COLLECTION);
    let backup_bytes: usize = backups.iter().take(50).map(Document::encoded_len).sum();
    assert!(backup_bytes > SMALL_REQUEST, "backups of one batch fit a request");
    assert_eq!(backups.len(), 300);
    assert_eq!(count_in_shape(&store.snapshot(COLLECTION), TARGET), 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_restore_fits_small_requests() {
    init_tracing();
    let store = tight_store(600);
    let before = store.snapshot(COLLECTION);
    store.set_commit_latency(Some(Duration::from_millis(5)));
    let handle = Orchestrator::new(store.clone())
        .start(test_spec(tight_config()), rename_owner())
        .await
        .unwrap();

    handle.wait_until(|_, p| p.checkpoints >= 2).await;
    let status = handle
        .rollback(RollbackStrategy::BackupRestore, None)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::RolledBack);
    assert_same_content(&before, &store.snapshot(COLLECTION));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complete_revert_fits_small_requests() {
    init_tracing();
    let store = tight_store(600);
    let before = store.snapshot(COLLECTION);
    store.set_commit_latency(Some(Duration::from_millis(5)));
    let orchestrator = Orchestrator::new(store.clone());
    let handle = orchestrator
        .start(test_spec(tight_config()), rename_owner())
        .await
        .unwrap();

    handle.wait_until(|_, p| p.documents_migrated >= 100).await;
    assert_eq!(handle.abort().await.unwrap(), JobStatus::RolledBack);
    assert_same_content(&before, &store.snapshot(COLLECTION));

    let plan = orchestrator.status(handle.id()).await.unwrap().last_rollback.unwrap();
    assert!(matches!(
        plan.outcome,
        RollbackOutcome::Succeeded { documents_reverted } if documents_reverted >= 100
    ));
}
