//! Deployment lock manager behaviour against a shared store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hangar_coord::lock::{DeploymentLockManager, LockOptions, LockState, lock_key};
use hangar_core::{Error, LockConfig, NewResource, ResourceStore};
use hangar_test_utils::{
    FailOn, RecordingStore, StoreOp, assert_already_locked, init_test_logging, lock_options,
    lock_options_at, lock_options_value,
};

fn manager(store: &Arc<RecordingStore>) -> DeploymentLockManager<RecordingStore> {
    DeploymentLockManager::new(Arc::clone(store), LockConfig::default())
}

#[tokio::test]
async fn lock_check_and_unlock_fresh_name() {
    init_test_logging();
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);

    let version = locks
        .lock("i1", lock_options("b1", "create"))
        .await
        .expect("lock");
    assert!(!version.is_empty());

    let status = locks.check_write_lock_status("i1").await.expect("status");
    assert!(status.is_write_locked);
    let details = status.lock_details.expect("details");
    assert_eq!(
        serde_json::to_value(details.lock_type).expect("encode"),
        "WRITE"
    );

    locks.unlock("i1", None, None, None).await.expect("unlock");
    let status = locks.check_write_lock_status("i1").await.expect("status");
    assert!(!status.is_write_locked);
    assert!(status.lock_details.is_none());

    let info = locks.get_lock("i1").await.expect("get").expect("present");
    assert_eq!(info.state, Some(LockState::Unlocked));
}

#[tokio::test]
async fn second_lock_reports_holder() {
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);
    let first = lock_options("b1", "create");
    let lock_time = first.lock_time;
    locks.lock("i1", first).await.expect("first lock");

    let err = locks
        .lock("i1", lock_options("b2", "update"))
        .await
        .expect_err("already locked");
    assert_already_locked(&err, "i1");
    let message = err.to_string();
    assert!(message.contains(&lock_time.to_rfc3339()), "{message}");
    assert!(message.contains("`create`"), "{message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lockers_have_exactly_one_winner() {
    let store = Arc::new(RecordingStore::with_latency(Duration::from_millis(1)));
    let locks = Arc::new(manager(&store));

    let mut handles = Vec::new();
    for i in 0..8 {
        let locks = Arc::clone(&locks);
        handles.push(tokio::spawn(async move {
            locks
                .lock("i1", lock_options(&format!("b{i}"), "backup"))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(_) => winners += 1,
            Err(err) => assert_already_locked(&err, "i1"),
        }
    }
    assert_eq!(winners, 1);
    assert!(
        locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );
}

async fn seed_lock(store: &RecordingStore, options: &LockOptions, state: LockState) {
    store
        .create_resource(
            NewResource::new(lock_key("i1"), lock_options_value(options))
                .with_state(state.as_str()),
        )
        .await
        .expect("seed lock");
    store.clear_operations();
}

async fn race_for_existing_lock(store: &Arc<RecordingStore>) -> usize {
    let locks = Arc::new(manager(store));
    let mut handles = Vec::new();
    for i in 0..8 {
        let locks = Arc::clone(&locks);
        handles.push(tokio::spawn(async move {
            locks
                .lock("i1", lock_options(&format!("b{i}"), "backup"))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(_) => winners += 1,
            Err(err) => assert_already_locked(&err, "i1"),
        }
    }
    // Every attempt went through the conditional patch, never a create.
    assert_eq!(store.count(|op| matches!(op, StoreOp::Create { .. })), 0);
    winners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_lockers_on_released_lock_have_one_winner() {
    let store = Arc::new(RecordingStore::with_latency(Duration::from_millis(1)));
    seed_lock(&store, &lock_options("b0", "backup"), LockState::Unlocked).await;

    assert_eq!(race_for_existing_lock(&store).await, 1);
    let info = manager(&store)
        .get_lock("i1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(info.state, Some(LockState::Locked));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_lockers_on_expired_lock_have_one_winner() {
    let store = Arc::new(RecordingStore::with_latency(Duration::from_millis(1)));
    let stale = lock_options_at(Utc::now() - chrono::Duration::hours(2), "b0", "backup")
        .with_ttl(Duration::from_secs(3600));
    seed_lock(&store, &stale, LockState::Locked).await;

    assert_eq!(race_for_existing_lock(&store).await, 1);
    let info = manager(&store)
        .get_lock("i1")
        .await
        .expect("get")
        .expect("present");
    let holder = info.options.locked_resource_details.expect("details");
    assert_ne!(holder.resource_id, "b0");
}

#[tokio::test]
async fn expired_lock_is_not_locked_and_can_be_retaken() {
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);
    let stale = lock_options_at(Utc::now() - chrono::Duration::hours(2), "b1", "backup")
        .with_ttl(Duration::from_secs(3600));
    locks.lock("i1", stale).await.expect("stale lock");

    assert!(
        !locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );

    locks
        .lock("i1", lock_options("b2", "update"))
        .await
        .expect("retake expired lock");
    let info = locks.get_lock("i1").await.expect("get").expect("present");
    let details = info.options.locked_resource_details.expect("details");
    assert_eq!(details.resource_id, "b2");
    assert_eq!(info.state, Some(LockState::Locked));
}

#[tokio::test]
async fn unlock_is_idempotent_without_retries() {
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);
    let key = lock_key("i1");

    // Never locked.
    locks
        .unlock("i1", None, Some(3), Some(Duration::from_secs(60)))
        .await
        .expect("unlock absent");
    assert_eq!(store.updates_to(&key), 1);

    locks
        .lock("i1", lock_options("b1", "create"))
        .await
        .expect("lock");
    locks.unlock("i1", None, None, None).await.expect("unlock");
    store.clear_operations();

    // Already unlocked.
    locks
        .unlock("i1", None, Some(3), Some(Duration::from_secs(60)))
        .await
        .expect("unlock again");
    assert_eq!(store.updates_to(&key), 1);

    // Deleted.
    assert!(locks.force_unlock("i1").await.expect("delete"));
    store.clear_operations();
    locks
        .unlock("i1", Some("42"), Some(3), Some(Duration::from_secs(60)))
        .await
        .expect("unlock deleted");
    assert_eq!(store.updates_to(&key), 1);
}

#[tokio::test]
async fn unlock_retries_transient_errors() {
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);
    locks
        .lock("i1", lock_options("b1", "create"))
        .await
        .expect("lock");
    store.clear_operations();

    store.fail_next(FailOn::Update, 1);
    locks
        .unlock("i1", None, Some(3), Some(Duration::from_millis(5)))
        .await
        .expect("unlock after retry");
    assert_eq!(store.updates_to(&lock_key("i1")), 2);
    assert!(
        !locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );
}

#[tokio::test]
async fn unlock_times_out_after_retry_budget() {
    let store = Arc::new(RecordingStore::new());
    let locks = manager(&store);
    locks
        .lock("i1", lock_options("b1", "create"))
        .await
        .expect("lock");
    store.clear_operations();

    store.fail_next(FailOn::Update, 10);
    let err = locks
        .unlock("i1", None, Some(2), Some(Duration::from_millis(5)))
        .await
        .expect_err("timeout");
    match &err {
        Error::Timeout {
            resource, retries, ..
        } => {
            assert_eq!(*retries, 2);
            assert!(resource.ends_with("/i1"), "{resource}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(store.updates_to(&lock_key("i1")), 3);

    // The lock stays held until something else clears it.
    store.clear_failures();
    assert!(
        locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );
}

#[tokio::test]
async fn lock_without_ttl_or_default_never_expires() {
    let store = Arc::new(RecordingStore::new());
    let locks = DeploymentLockManager::new(
        Arc::clone(&store),
        LockConfig {
            default_ttl: None,
            ..LockConfig::default()
        },
    );
    locks
        .lock(
            "i1",
            lock_options_at(Utc::now() - chrono::Duration::days(30), "b1", "backup"),
        )
        .await
        .expect("lock");

    let info = locks.get_lock("i1").await.expect("get").expect("present");
    assert_eq!(info.options.lock_ttl, None);
    // No default TTL: old locks never expire.
    assert!(
        locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );
}
