//! Unlock poller releasing locks of finished operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hangar_coord::lock::{DeploymentLockManager, LockOptions, lock_key};
use hangar_coord::poller::UnlockResourcePoller;
use hangar_core::{LockConfig, ResourcePatch, ResourceStatus, ResourceStore};
use hangar_test_utils::{
    FailOn, RecordingStore, TestContext, backup_details, backup_key, fast_watch_config,
    init_test_logging, lock_options, poller_config,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

async fn wait_until<F>(what: &str, limit: Duration, mut check: F) -> Duration
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < limit {
        if check() {
            return started.elapsed();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn lock_exists(store: &RecordingStore, name: &str) -> bool {
    store.memory().raw(&lock_key(name)).expect("raw").is_some()
}

async fn finish<S: ResourceStore + ?Sized>(store: &S, backup_id: &str, state: &str) {
    store
        .update_resource(
            &backup_key(backup_id),
            ResourcePatch::new().with_status(ResourceStatus::with_state(state)),
        )
        .await
        .expect("finish backup");
}

#[tokio::test]
async fn lock_is_deleted_within_one_interval_of_success() {
    init_test_logging();
    let ctx = TestContext::new();
    let locks = DeploymentLockManager::new(Arc::clone(&ctx.store), LockConfig::default());
    let poller = UnlockResourcePoller::new(Arc::clone(&ctx.store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    ctx.seed_backup("b1", "in_progress").await;
    locks
        .lock("i1", lock_options("b1", "backup"))
        .await
        .expect("lock");
    wait_until("poller to start", Duration::from_secs(2), || {
        poller.active_pollers() == vec!["i1".to_string()]
    })
    .await;

    // Several intervals pass while the backup runs.
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert!(lock_exists(&ctx.store, "i1"));

    finish(&ctx.store, "b1", "succeeded").await;
    let elapsed = wait_until("lock deletion", Duration::from_secs(2), || {
        !lock_exists(&ctx.store, "i1")
    })
    .await;
    assert!(
        elapsed <= POLL_INTERVAL + Duration::from_millis(50),
        "released after {elapsed:?}"
    );
    wait_until("poller entry removal", Duration::from_secs(1), || {
        poller.active_pollers().is_empty()
    })
    .await;

    shutdown.cancel();
    task.await.expect("poller task");
}

#[tokio::test]
async fn deleted_operation_releases_lock() {
    let ctx = TestContext::new();
    let locks = DeploymentLockManager::new(Arc::clone(&ctx.store), LockConfig::default());
    let poller = UnlockResourcePoller::new(Arc::clone(&ctx.store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    ctx.seed_backup("b1", "in_progress").await;
    locks
        .lock("i1", lock_options("b1", "backup"))
        .await
        .expect("lock");
    wait_until("poller to start", Duration::from_secs(2), || {
        !poller.active_pollers().is_empty()
    })
    .await;

    ctx.store
        .delete_resource(&backup_key("b1"))
        .await
        .expect("delete backup");
    wait_until("lock deletion", Duration::from_secs(2), || {
        !lock_exists(&ctx.store, "i1")
    })
    .await;

    shutdown.cancel();
    task.await.expect("poller task");
    assert!(poller.active_pollers().is_empty());
}

#[tokio::test]
async fn transient_poll_errors_do_not_stop_the_timer() {
    let ctx = TestContext::new();
    let locks = DeploymentLockManager::new(Arc::clone(&ctx.store), LockConfig::default());
    let poller = UnlockResourcePoller::new(Arc::clone(&ctx.store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    ctx.seed_backup("b1", "in_progress").await;
    locks
        .lock("i1", lock_options("b1", "backup"))
        .await
        .expect("lock");
    wait_until("poller to start", Duration::from_secs(2), || {
        !poller.active_pollers().is_empty()
    })
    .await;

    ctx.store.inject_failure(backup_key("b1").to_string());
    finish(ctx.store.memory(), "b1", "failed").await;
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert!(lock_exists(&ctx.store, "i1"), "lock must survive failed polls");
    assert_eq!(poller.active_pollers(), vec!["i1".to_string()]);

    ctx.store.clear_failures();
    wait_until("lock deletion", Duration::from_secs(2), || {
        !lock_exists(&ctx.store, "i1")
    })
    .await;

    shutdown.cancel();
    task.await.expect("poller task");
}

#[tokio::test]
async fn lock_retaken_without_details_is_not_deleted() {
    let ctx = TestContext::new();
    let locks = DeploymentLockManager::new(Arc::clone(&ctx.store), LockConfig::default());
    let poller = UnlockResourcePoller::new(Arc::clone(&ctx.store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    ctx.seed_backup("b1", "in_progress").await;
    let version = locks
        .lock("i1", lock_options("b1", "backup"))
        .await
        .expect("lock");
    wait_until("poller to start", Duration::from_secs(2), || {
        poller.polled_operation("i1") == Some(backup_details("b1"))
    })
    .await;

    // b1's owner releases, another caller takes the deployment without naming
    // an operation, then b1 finishes.
    locks
        .unlock("i1", Some(&version), None, None)
        .await
        .expect("unlock");
    locks
        .lock("i1", LockOptions::write(Utc::now()))
        .await
        .expect("second lock");
    finish(&ctx.store, "b1", "succeeded").await;

    wait_until("poller entry retired", Duration::from_secs(2), || {
        poller.active_pollers().is_empty()
    })
    .await;
    tokio::time::sleep(POLL_INTERVAL * 2).await;
    assert!(lock_exists(&ctx.store, "i1"));
    assert!(
        locks
            .check_write_lock_status("i1")
            .await
            .expect("status")
            .is_write_locked
    );

    shutdown.cancel();
    task.await.expect("poller task");
}

#[tokio::test]
async fn relock_after_resolution_starts_fresh_poller() {
    let ctx = TestContext::new();
    let locks = DeploymentLockManager::new(Arc::clone(&ctx.store), LockConfig::default());
    let poller = UnlockResourcePoller::new(Arc::clone(&ctx.store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    ctx.seed_backup("b1", "succeeded").await;
    locks
        .lock("i1", lock_options("b1", "backup"))
        .await
        .expect("lock");
    wait_until("first lock deletion", Duration::from_secs(2), || {
        !lock_exists(&ctx.store, "i1") && poller.active_pollers().is_empty()
    })
    .await;

    ctx.seed_backup("b2", "in_progress").await;
    locks
        .lock("i1", lock_options("b2", "backup"))
        .await
        .expect("relock");
    wait_until("second poller", Duration::from_secs(2), || {
        poller
            .polled_operation("i1")
            .is_some_and(|d| d.resource_id == "b2")
    })
    .await;

    shutdown.cancel();
    task.await.expect("poller task");
    assert!(poller.active_pollers().is_empty(), "shutdown clears entries");
    assert!(lock_exists(&ctx.store, "i1"));
}

#[tokio::test]
async fn watch_outage_is_retried() {
    let store = Arc::new(RecordingStore::new());
    store.fail_next(FailOn::Watch, 3);
    let poller = UnlockResourcePoller::new(Arc::clone(&store), poller_config(POLL_INTERVAL));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(poller.clone().run(fast_watch_config(), shutdown.clone()));

    let locks = DeploymentLockManager::new(Arc::clone(&store), LockConfig::default());
    locks
        .lock("i1", lock_options("missing", "backup"))
        .await
        .expect("lock");
    wait_until("lock deletion after outage", Duration::from_secs(3), || {
        !lock_exists(&store, "i1")
    })
    .await;

    shutdown.cancel();
    task.await.expect("poller task");
}
