//! Compensating release of deployment locks.
//!
//! The poller watches lock resources. For each lock that names the operation
//! holding it, a timer polls that operation's resource until it reaches a
//! terminal state or disappears, then deletes the lock. This releases locks
//! whose owner crashed or forgot to call `unlock()`.
//!
//! Entries are a process-local cache of work in flight. They are never
//! consulted for cross-process correctness: two processes may both poll the
//! same lock, and a duplicate delete is harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hangar_core::{
    PollerConfig, ResourceStore, WatchConfig, WatchEvent, WatchEventType, WatchRequest,
    get_optional,
};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock::{DEPLOYMENT_LOCKS, LOCK_GROUP, LockOptions, LockedResourceDetails, lock_key};
use crate::metrics::CoordMetrics;
use crate::watch::{WatchEventHandler, run_watch};

/// Identifies one poll task, so a stale handle cannot clear its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerHandle(u64);

struct PollerEntry {
    handle: PollerHandle,
    details: LockedResourceDetails,
    task: AbortHandle,
}

struct Inner<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    config: PollerConfig,
    entries: Mutex<HashMap<String, PollerEntry>>,
    next_id: AtomicU64,
    metrics: CoordMetrics,
}

enum PollResult {
    Pending,
    Resolved(&'static str),
}

enum Release {
    Done,
    Retry,
    Follow(LockedResourceDetails),
}

/// Watches deployment locks and deletes them once their operation finishes.
pub struct UnlockResourcePoller<S: ResourceStore + ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ResourceStore + ?Sized> Clone for UnlockResourcePoller<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ResourceStore + ?Sized> UnlockResourcePoller<S> {
    /// Creates a poller. No timers run until events arrive.
    pub fn new(store: Arc<S>, config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                metrics: CoordMetrics::new(),
            }),
        }
    }

    /// Returns the watch request for lock resources.
    #[must_use]
    pub fn watch_request() -> WatchRequest {
        WatchRequest::new(LOCK_GROUP, DEPLOYMENT_LOCKS)
    }

    /// Handles one lock resource event.
    ///
    /// Returns the handle of a newly started poll task, if one was started.
    pub fn handle_event(&self, event: &WatchEvent) -> Option<PollerHandle> {
        let name = &event.object.key.id;
        if event.event_type == WatchEventType::Deleted {
            if let Some(handle) = self.handle(name) {
                debug!(lock = %name, "lock deleted, dropping poller");
                self.clear_poller(name, handle);
            }
            return None;
        }

        let options: LockOptions = match event.object.decode_options() {
            Ok(options) => options,
            Err(e) => {
                debug!(lock = %name, error = %e, "lock options not decodable, ignoring");
                return None;
            }
        };
        let details = options.locked_resource_details?;
        self.start_poller(name, details)
    }

    /// Starts polling for `name` unless a poll task already exists for it.
    pub fn start_poller(&self, name: &str, details: LockedResourceDetails) -> Option<PollerHandle> {
        let mut entries = self.inner.entries();
        if entries.contains_key(name) {
            return None;
        }

        let handle = PollerHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(poll_until_resolved(
            Arc::clone(&self.inner),
            name.to_string(),
            handle,
            details.clone(),
        ));
        info!(
            lock = %name,
            operation = %details.operation_key(),
            interval = ?self.inner.config.poll_interval,
            "started unlock poller"
        );
        entries.insert(
            name.to_string(),
            PollerEntry {
                handle,
                details,
                task: task.abort_handle(),
            },
        );
        self.inner.metrics.set_active_pollers(entries.len());
        Some(handle)
    }

    /// Cancels the poll task for `name` and removes its entry.
    ///
    /// Returns `false` if no entry exists or it belongs to a different task.
    pub fn clear_poller(&self, name: &str, handle: PollerHandle) -> bool {
        let mut entries = self.inner.entries();
        match entries.get(name) {
            Some(entry) if entry.handle == handle => {}
            _ => return false,
        }
        if let Some(entry) = entries.remove(name) {
            entry.task.abort();
        }
        self.inner.metrics.set_active_pollers(entries.len());
        true
    }

    /// Returns the handle of the poll task for `name`, if any.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<PollerHandle> {
        self.inner.entries().get(name).map(|e| e.handle)
    }

    /// Returns the operation being polled for `name`, if any.
    #[must_use]
    pub fn polled_operation(&self, name: &str) -> Option<LockedResourceDetails> {
        self.inner.entries().get(name).map(|e| e.details.clone())
    }

    /// Returns the lock names with a live poll task, sorted.
    #[must_use]
    pub fn active_pollers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancels every poll task.
    pub fn shutdown(&self) {
        let mut entries = self.inner.entries();
        let count = entries.len();
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
        self.inner.metrics.set_active_pollers(0);
        if count > 0 {
            info!(cancelled = count, "unlock poller shut down");
        }
    }

    /// Watches lock resources until `shutdown` is cancelled, then cancels
    /// every poll task.
    pub async fn run(self, watch: WatchConfig, shutdown: CancellationToken) {
        run_watch(
            Arc::clone(&self.inner.store),
            Self::watch_request(),
            Arc::new(self.clone()),
            watch,
            shutdown,
            self.inner.metrics.clone(),
        )
        .await;
        self.shutdown();
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> WatchEventHandler for UnlockResourcePoller<S> {
    async fn on_event(&self, event: WatchEvent) {
        self.handle_event(&event);
    }
}

impl<S: ResourceStore + ?Sized> std::fmt::Debug for UnlockResourcePoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockResourcePoller")
            .field("config", &self.inner.config)
            .field("active", &self.active_pollers())
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore + ?Sized> Inner<S> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, PollerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the entry for `name` if it still belongs to `handle`.
    fn finish(&self, name: &str, handle: PollerHandle) {
        let mut entries = self.entries();
        if entries.get(name).is_some_and(|e| e.handle == handle) {
            entries.remove(name);
        }
        self.metrics.set_active_pollers(entries.len());
    }

    async fn check(&self, details: &LockedResourceDetails) -> PollResult {
        let key = details.operation_key();
        match self.store.get_resource(&key).await {
            Ok(operation) => {
                let state = operation.lifecycle_state();
                match state {
                    Some(state) if self.config.terminal_states.contains(&state) => {
                        debug!(
                            operation = %key,
                            state = %state,
                            "operation reached terminal state"
                        );
                        PollResult::Resolved("terminal")
                    }
                    _ => PollResult::Pending,
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(operation = %key, "operation resource gone");
                PollResult::Resolved("operation_missing")
            }
            Err(e) => {
                debug!(operation = %key, error = %e, "poll failed, will retry");
                PollResult::Pending
            }
        }
    }

    fn retarget(&self, name: &str, handle: PollerHandle, details: LockedResourceDetails) {
        if let Some(entry) = self.entries().get_mut(name) {
            if entry.handle == handle {
                entry.details = details;
            }
        }
    }

    /// Deletes the lock and retires the entry if the lock still names the
    /// polled operation.
    ///
    /// A lock retaken for another operation is followed instead. A lock that no
    /// longer names any operation is left alone and the entry retired.
    async fn release_lock(
        &self,
        name: &str,
        handle: PollerHandle,
        details: &LockedResourceDetails,
        reason: &'static str,
    ) -> Release {
        let key = lock_key(name);
        match get_optional(self.store.as_ref(), &key).await {
            Ok(None) => {
                debug!(lock = %name, "lock already gone");
                self.finish(name, handle);
                self.metrics.record_poller_resolution("lock_missing");
                return Release::Done;
            }
            Ok(Some(lock)) => {
                let current = lock
                    .decode_options::<LockOptions>()
                    .ok()
                    .and_then(|o| o.locked_resource_details);
                match current {
                    Some(current) if &current == details => {}
                    Some(current) => {
                        self.metrics.record_poller_resolution("superseded");
                        return Release::Follow(current);
                    }
                    None => {
                        info!(lock = %name, "lock no longer names an operation, leaving it held");
                        self.finish(name, handle);
                        self.metrics.record_poller_resolution("superseded");
                        return Release::Done;
                    }
                }
            }
            Err(e) => {
                debug!(lock = %name, error = %e, "lock re-read failed, will retry");
                return Release::Retry;
            }
        }

        match self.store.delete_resource(&key).await {
            Ok(()) => info!(lock = %name, reason, "released lock of finished operation"),
            Err(e) if e.is_not_found() => debug!(lock = %name, "lock already deleted"),
            Err(e) => warn!(lock = %name, error = %e, "failed to delete lock"),
        }
        self.finish(name, handle);
        self.metrics.record_poller_resolution(reason);
        Release::Done
    }
}

async fn poll_until_resolved<S: ResourceStore + ?Sized>(
    inner: Arc<Inner<S>>,
    name: String,
    handle: PollerHandle,
    mut details: LockedResourceDetails,
) {
    let interval = inner.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let PollResult::Resolved(reason) = inner.check(&details).await else {
            continue;
        };
        match inner.release_lock(&name, handle, &details, reason).await {
            Release::Done => return,
            Release::Retry => {}
            Release::Follow(next) => {
                info!(
                    lock = %name,
                    operation = %next.operation_key(),
                    "lock taken by another operation, following it"
                );
                inner.retarget(&name, handle, next.clone());
                details = next;
            }
        }
    }
}
