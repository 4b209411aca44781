//! Pre-built fixtures for coordination tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hangar_coord::lock::{LockOptions, LockedResourceDetails};
use hangar_core::{
    NewResource, OwnerId, PollerConfig, Resource, ResourceKey, ResourceStore, WatchConfig,
    WatchEvent, WatchEventType,
};
use serde_json::{Value, json};

use crate::storage::RecordingStore;

/// Group of the sample reconciled kind.
pub const DIRECTOR_GROUP: &str = "deployment.hangar.io";
/// Type of the sample reconciled kind.
pub const DIRECTOR_KIND: &str = "directors";
/// Group of the sample operation kind referenced by locks.
pub const BACKUP_GROUP: &str = "backup.hangar.io";
/// Type of the sample operation kind referenced by locks.
pub const BACKUP_KIND: &str = "backups";

/// Test context with a shared recording store.
pub struct TestContext {
    /// Shared store.
    pub store: Arc<RecordingStore>,
}

impl TestContext {
    /// Creates a context with an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(RecordingStore::new()),
        }
    }

    /// Creates a director resource in `state`.
    pub async fn seed_director(&self, id: &str, state: &str) -> Resource {
        self.store
            .create_resource(director(id, state))
            .await
            .expect("seed director")
    }

    /// Creates a backup operation resource in `state`.
    pub async fn seed_backup(&self, id: &str, state: &str) -> Resource {
        self.store
            .create_resource(NewResource::new(backup_key(id), json!({})).with_state(state))
            .await
            .expect("seed backup")
    }

    /// Reads a resource, panicking if absent.
    pub async fn get(&self, key: &ResourceKey) -> Resource {
        self.store.get_resource(key).await.expect("get resource")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner id for a named test process.
#[must_use]
pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name).expect("valid owner id")
}

/// Key of a director resource.
#[must_use]
pub fn director_key(id: &str) -> ResourceKey {
    ResourceKey::new(DIRECTOR_GROUP, DIRECTOR_KIND, id)
}

/// Key of a backup operation resource.
#[must_use]
pub fn backup_key(id: &str) -> ResourceKey {
    ResourceKey::new(BACKUP_GROUP, BACKUP_KIND, id)
}

/// A director resource in `state` with a small plan.
#[must_use]
pub fn director(id: &str, state: &str) -> NewResource {
    NewResource::new(
        director_key(id),
        json!({"plan_id": "small", "parameters": {"nodes": 1}}),
    )
    .with_state(state)
}

/// Wraps a resource as an `ADDED` event.
#[must_use]
pub fn added(object: Resource) -> WatchEvent {
    WatchEvent {
        event_type: WatchEventType::Added,
        object,
    }
}

/// Lock details pointing at a backup operation.
#[must_use]
pub fn backup_details(backup_id: &str) -> LockedResourceDetails {
    LockedResourceDetails::new(BACKUP_GROUP, BACKUP_KIND, backup_id, "backup")
}

/// Write-lock options for `operation` on backup `backup_id`, taken at `lock_time`.
#[must_use]
pub fn lock_options_at(lock_time: DateTime<Utc>, backup_id: &str, operation: &str) -> LockOptions {
    LockOptions::write(lock_time).with_details(LockedResourceDetails::new(
        BACKUP_GROUP,
        BACKUP_KIND,
        backup_id,
        operation,
    ))
}

/// Write-lock options for `operation` on backup `backup_id`, taken now.
#[must_use]
pub fn lock_options(backup_id: &str, operation: &str) -> LockOptions {
    lock_options_at(Utc::now(), backup_id, operation)
}

/// Encodes lock options as `spec.options`.
#[must_use]
pub fn lock_options_value(options: &LockOptions) -> Value {
    serde_json::to_value(options).expect("encode lock options")
}

/// Watch settings with short reconnect delays.
#[must_use]
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        refresh_interval: Duration::from_millis(10),
        error_delay: Duration::from_millis(20),
    }
}

/// Poller settings with the given interval and default terminal states.
#[must_use]
pub fn poller_config(poll_interval: Duration) -> PollerConfig {
    PollerConfig {
        poll_interval,
        ..PollerConfig::default()
    }
}
