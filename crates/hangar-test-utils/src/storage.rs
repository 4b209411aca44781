//! Resource store wrapper with operation recording and fault injection.
//!
//! Wraps a [`MemoryStore`] so tests can assert which store calls a component
//! made and simulate an unavailable backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hangar_core::{
    Error, MemoryStore, NewResource, Resource, ResourceKey, ResourcePatch, ResourceStore, Result,
    WatchRequest, WatchStream,
};

/// Record of a store call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// `get_resource`.
    Get {
        /// Key that was read.
        key: ResourceKey,
    },
    /// `create_resource`.
    Create {
        /// Key that was created.
        key: ResourceKey,
    },
    /// `update_resource`.
    Update {
        /// Key that was patched.
        key: ResourceKey,
        /// Version the patch was conditional on.
        expected_version: Option<String>,
    },
    /// `delete_resource`.
    Delete {
        /// Key that was deleted.
        key: ResourceKey,
    },
    /// `register_watcher`.
    Watch {
        /// Watched group.
        group: String,
        /// Watched type.
        resource_type: String,
        /// Selector as text.
        selector: String,
    },
}

impl StoreOp {
    /// Returns the key the operation touched, if any.
    #[must_use]
    pub fn key(&self) -> Option<&ResourceKey> {
        match self {
            Self::Get { key }
            | Self::Create { key }
            | Self::Update { key, .. }
            | Self::Delete { key } => Some(key),
            Self::Watch { .. } => None,
        }
    }
}

/// Which store call an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// `get_resource`.
    Get,
    /// `create_resource`.
    Create,
    /// `update_resource`.
    Update,
    /// `delete_resource`.
    Delete,
    /// `register_watcher`.
    Watch,
}

#[derive(Debug, Default)]
struct Failures {
    get: AtomicU32,
    create: AtomicU32,
    update: AtomicU32,
    delete: AtomicU32,
    watch: AtomicU32,
}

impl Failures {
    fn counter(&self, on: FailOn) -> &AtomicU32 {
        match on {
            FailOn::Get => &self.get,
            FailOn::Create => &self.create,
            FailOn::Update => &self.update,
            FailOn::Delete => &self.delete,
            FailOn::Watch => &self.watch,
        }
    }

    /// Consumes one pending failure, if any.
    fn take(&self, on: FailOn) -> bool {
        self.counter(on)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// [`MemoryStore`] wrapper recording every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    failures: Arc<Failures>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl RecordingStore {
    /// Creates an empty recording store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that sleeps before every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns the wrapped memory store.
    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Counts recorded operations matching the predicate.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&StoreOp) -> bool) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|op| predicate(op))
            .count()
    }

    /// Counts `update_resource` calls against `key`.
    #[must_use]
    pub fn updates_to(&self, key: &ResourceKey) -> usize {
        self.count(|op| matches!(op, StoreOp::Update { key: k, .. } if k == key))
    }

    /// Makes the next `times` calls of the given kind fail with `Unavailable`.
    pub fn fail_next(&self, on: FailOn, times: u32) {
        self.failures.counter(on).store(times, Ordering::SeqCst);
    }

    /// Makes every call on keys whose display form starts with `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
        for on in [
            FailOn::Get,
            FailOn::Create,
            FailOn::Update,
            FailOn::Delete,
            FailOn::Watch,
        ] {
            self.failures.counter(on).store(0, Ordering::SeqCst);
        }
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, on: FailOn, key: Option<&ResourceKey>) -> Result<()> {
        if self.failures.take(on) {
            return Err(Error::unavailable(format!("injected {on:?} failure")));
        }
        if let Some(key) = key {
            let key = key.to_string();
            let prefixes = self.fail_prefixes.lock().expect("lock");
            if prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                return Err(Error::unavailable(format!("injected failure for {key}")));
            }
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ResourceStore for RecordingStore {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Resource> {
        self.maybe_delay().await;
        self.record(StoreOp::Get { key: key.clone() });
        self.check_failure(FailOn::Get, Some(key))?;
        self.inner.get_resource(key).await
    }

    async fn create_resource(&self, resource: NewResource) -> Result<Resource> {
        self.maybe_delay().await;
        self.record(StoreOp::Create {
            key: resource.key.clone(),
        });
        self.check_failure(FailOn::Create, Some(&resource.key))?;
        self.inner.create_resource(resource).await
    }

    async fn update_resource(&self, key: &ResourceKey, patch: ResourcePatch) -> Result<Resource> {
        self.maybe_delay().await;
        self.record(StoreOp::Update {
            key: key.clone(),
            expected_version: patch.expected_version.clone(),
        });
        self.check_failure(FailOn::Update, Some(key))?;
        self.inner.update_resource(key, patch).await
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<()> {
        self.maybe_delay().await;
        self.record(StoreOp::Delete { key: key.clone() });
        self.check_failure(FailOn::Delete, Some(key))?;
        self.inner.delete_resource(key).await
    }

    async fn register_watcher(&self, request: WatchRequest) -> Result<WatchStream> {
        self.record(StoreOp::Watch {
            group: request.group.clone(),
            resource_type: request.resource_type.clone(),
            selector: request.selector.to_string(),
        });
        self.check_failure(FailOn::Watch, None)?;
        self.inner.register_watcher(request).await
    }
}
