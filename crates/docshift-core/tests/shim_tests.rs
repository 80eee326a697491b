//! Application reads and writes through the compatibility shim while a job runs

use docshift_core::prelude::*;
use docshift_core::ShimState;
use docshift_test_utils::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn both_shapes_readable_and_writes_survive_migration() {
    init_tracing();
    let store = seeded_store(400);
    store.set_commit_latency(Some(Duration::from_millis(5)));
    let handle = Orchestrator::new(store.clone())
        .start(test_spec(fast_config(20, 2)), rename_owner())
        .await
        .unwrap();
    let shim = handle.shim();

    handle.wait_until(|_, p| p.checkpoints >= 2).await;
    assert_eq!(handle.pause().await.unwrap(), JobStatus::PausedManual);
    assert_eq!(shim.state(), ShimState::Active);

    let covered = (0..400).map(key).find(|k| shim.covers(k)).unwrap();
    let pending = (0..400).map(key).rev().find(|k| !shim.covers(k)).unwrap();

    for k in [&covered, &pending] {
        let old = shim.read_as(k, SOURCE).await.unwrap().unwrap();
        assert!(old.body.get("owner").is_some(), "{k}: {}", old.body);
        assert!(old.body.get("owner_id").is_none());

        let new = shim.read_as(k, TARGET).await.unwrap().unwrap();
        assert_eq!(new.body.get("owner_id"), old.body.get("owner"));
    }
    assert_eq!(shim.read(&covered).await.unwrap().unwrap().shape, TARGET);
    assert_eq!(shim.serving_shape(&pending), SOURCE);

    // writer on the new shape touches a document the job has not reached yet
    let written = shim
        .write(
            &pending,
            json!({"owner_id": "owner-new", "amount": 1, "status": "open"}),
            TARGET,
        )
        .await
        .unwrap();
    assert_eq!(written.shape, SOURCE);
    assert_eq!(written.body["owner"], "owner-new");
    assert_eq!(written.body["owner_id"], "owner-new");

    // brand-new document, written in the old shape
    let fresh = key(999_999);
    shim.write(&fresh, json!({"owner": "late", "amount": 0, "status": "open"}), SOURCE)
        .await
        .unwrap();

    assert_eq!(handle.resume().await.unwrap(), JobStatus::Running);
    assert_eq!(handle.wait().await, JobStatus::Completed);

    let stored = store.snapshot(COLLECTION);
    let doc = stored.iter().find(|d| d.key == pending).unwrap();
    assert_eq!(doc.shape, TARGET);
    assert_eq!(doc.body, json!({"owner_id": "owner-new", "amount": 1, "status": "open"}));
    let doc = stored.iter().find(|d| d.key == fresh).unwrap();
    assert_eq!(doc.shape, TARGET);
    assert_eq!(doc.body["owner_id"], "late");
}

#[tokio::test]
async fn shim_retires_after_grace_period() {
    let store = seeded_store(40);
    let handle = Orchestrator::new(store)
        .start(test_spec(fast_config(20, 2)), rename_owner())
        .await
        .unwrap();
    let shim = handle.shim();
    assert_eq!(handle.wait().await, JobStatus::Completed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shim.state(), ShimState::Retired);

    let k = key(3);
    let doc = shim.read(&k).await.unwrap().unwrap();
    assert_eq!(doc.shape, TARGET);
    assert!(matches!(
        shim.read_as(&k, SOURCE).await,
        Err(EngineError::IllegalOperation { .. })
    ));
}
