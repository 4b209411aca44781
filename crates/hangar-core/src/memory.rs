//! In-memory resource store.
//!
//! Implements the full [`ResourceStore`] contract: numeric versions exposed as
//! strings, conditional writes, and label-filtered watch streams. Documents are
//! held in their wire form so every read and write goes through the codec,
//! exactly as a remote store client would.
//!
//! Thread-safe via `RwLock`. Single-process only; suitable for tests and for
//! embedding the coordination core without a remote store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resource::{
    NewResource, Resource, ResourceKey, ResourcePatch, WatchEvent, WatchEventType,
};
use crate::selector::LabelSelector;
use crate::store::{ResourceStore, WatchRequest, WatchStream};
use crate::wire::{self, WireResource};

/// Buffered events per watcher before it is reported as lagging.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Signal {
    Event(WatchEvent),
    /// Terminates every open watch stream.
    Disconnect,
}

#[derive(Debug)]
struct Inner {
    objects: HashMap<ResourceKey, WireResource>,
    /// Store-wide counter, like a cluster resource version.
    last_version: u64,
}

/// In-memory resource store for tests and single-process embedding.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<Signal>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("lock poisoned")
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                objects: HashMap::new(),
                last_version: 0,
            })),
            events,
        }
    }

    /// Lists resources of a kind matching the selector, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored document cannot be decoded.
    pub fn list_resources(
        &self,
        group: &str,
        resource_type: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut resources = inner
            .objects
            .values()
            .filter(|w| w.group == group && w.resource_type == resource_type)
            .filter(|w| selector.matches(&w.metadata.labels))
            .cloned()
            .map(wire::decode)
            .collect::<Result<Vec<_>>>()?;
        drop(inner);
        resources.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        Ok(resources)
    }

    /// Returns the stored wire document for a key, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn raw(&self, key: &ResourceKey) -> Result<Option<WireResource>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .objects
            .get(key)
            .cloned())
    }

    /// Ends every open watch stream, as a server-side disconnect would.
    pub fn disconnect_watchers(&self) {
        let _ = self.events.send(Signal::Disconnect);
    }

    /// Returns the number of open watch streams.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn next_version(inner: &mut Inner) -> String {
        inner.last_version += 1;
        inner.last_version.to_string()
    }

    fn publish(&self, event_type: WatchEventType, object: Resource) {
        // No receivers is not an error.
        let _ = self
            .events
            .send(Signal::Event(WatchEvent { event_type, object }));
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Resource> {
        let document = self
            .inner
            .read()
            .map_err(poison_err)?
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))?;
        wire::decode(document)
    }

    async fn create_resource(&self, resource: NewResource) -> Result<Resource> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.objects.contains_key(&resource.key) {
            return Err(Error::conflict(&resource.key, "already exists"));
        }

        let created = Resource {
            key: resource.key,
            resource_version: Self::next_version(&mut inner),
            labels: resource.labels,
            annotations: resource.annotations,
            options: resource.options,
            status: resource.status,
        };
        let document = wire::encode(&created)?;
        inner.objects.insert(created.key.clone(), document);

        // Publish while holding the write lock so watchers registering
        // concurrently see either the snapshot or the event, never neither.
        self.publish(WatchEventType::Added, created.clone());
        drop(inner);

        debug!(resource = %created.key, version = %created.resource_version, "created resource");
        Ok(created)
    }

    async fn update_resource(&self, key: &ResourceKey, patch: ResourcePatch) -> Result<Resource> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let current = inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))?;

        if let Some(expected) = &patch.expected_version {
            if *expected != current.metadata.resource_version {
                return Err(Error::conflict(
                    key,
                    format!(
                        "expected version {expected}, found {}",
                        current.metadata.resource_version
                    ),
                ));
            }
        }

        let mut updated = wire::decode(current)?;
        patch.apply_to(&mut updated);
        updated.resource_version = Self::next_version(&mut inner);
        let document = wire::encode(&updated)?;
        inner.objects.insert(key.clone(), document);

        self.publish(WatchEventType::Modified, updated.clone());
        drop(inner);

        debug!(resource = %key, version = %updated.resource_version, "updated resource");
        Ok(updated)
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let removed = inner
            .objects
            .remove(key)
            .ok_or_else(|| Error::not_found(key))?;
        let mut object = wire::decode(removed)?;
        object.resource_version = Self::next_version(&mut inner);

        self.publish(WatchEventType::Deleted, object);
        drop(inner);

        debug!(resource = %key, "deleted resource");
        Ok(())
    }

    async fn register_watcher(&self, request: WatchRequest) -> Result<WatchStream> {
        let inner = self.inner.read().map_err(poison_err)?;
        let receiver = self.events.subscribe();
        let initial = inner
            .objects
            .values()
            .filter(|w| request.covers(&w.key()))
            .filter(|w| request.selector.matches(&w.metadata.labels))
            .cloned()
            .map(|w| {
                wire::decode(w).map(|object| WatchEvent {
                    event_type: WatchEventType::Added,
                    object,
                })
            })
            .collect::<Vec<_>>();
        drop(inner);

        debug!(
            group = %request.group,
            resource_type = %request.resource_type,
            selector = %request.selector,
            existing = initial.len(),
            "registered watcher"
        );

        let live = stream::unfold(
            (receiver, request),
            |(mut receiver, request)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(Signal::Event(event)) => {
                            if request.covers(&event.object.key)
                                && request.selector.matches(&event.object.labels)
                            {
                                return Some((Ok(event), (receiver, request)));
                            }
                        }
                        Ok(Signal::Disconnect) | Err(broadcast::error::RecvError::Closed) => {
                            return None;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err =
                                Error::unavailable(format!("watch lagged by {skipped} events"));
                            return Some((Err(err), (receiver, request)));
                        }
                    }
                }
            },
        );

        Ok(stream::iter(initial).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn key(id: &str) -> ResourceKey {
        ResourceKey::new("deployment.hangar.io", "directors", id)
    }

    #[tokio::test]
    async fn create_then_get_round_trips_through_wire_form() {
        let store = MemoryStore::new();
        let created = store
            .create_resource(
                NewResource::new(key("r1"), json!({"plan_id": "small"})).with_state("in_queue"),
            )
            .await
            .expect("create");
        assert_eq!(created.resource_version, "1");

        let fetched = store.get_resource(&key("r1")).await.expect("get");
        assert_eq!(fetched, created);

        let raw = store.raw(&key("r1")).expect("raw").expect("present");
        assert_eq!(raw.spec.options, "{\"plan_id\":\"small\"}");
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = MemoryStore::new();
        store
            .create_resource(NewResource::new(key("r1"), json!({})))
            .await
            .expect("create");
        let err = store
            .create_resource(NewResource::new(key("r1"), json!({})))
            .await
            .expect_err("duplicate");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_version() {
        let store = MemoryStore::new();
        let created = store
            .create_resource(NewResource::new(key("r1"), json!({})))
            .await
            .expect("create");

        let updated = store
            .update_resource(
                &key("r1"),
                ResourcePatch::new()
                    .expect_version(&created.resource_version)
                    .set_annotation("owner", "a"),
            )
            .await
            .expect("first update");
        assert_ne!(updated.resource_version, created.resource_version);

        let err = store
            .update_resource(
                &key("r1"),
                ResourcePatch::new()
                    .expect_version(&created.resource_version)
                    .set_annotation("owner", "b"),
            )
            .await
            .expect_err("stale version");
        assert!(err.is_conflict());

        let err = store
            .update_resource(&key("missing"), ResourcePatch::new())
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete_resource(&key("r1")).await.expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn watch_replays_existing_then_streams_filtered_changes() {
        let store = MemoryStore::new();
        store
            .create_resource(NewResource::new(key("queued"), json!({})).with_state("in_queue"))
            .await
            .expect("create");
        store
            .create_resource(NewResource::new(key("done"), json!({})).with_state("succeeded"))
            .await
            .expect("create");

        let request = WatchRequest::new("deployment.hangar.io", "directors")
            .with_selector("state in (in_queue,update)".parse().expect("selector"));
        let mut watch = store.register_watcher(request).await.expect("watch");

        let first = watch.next().await.expect("event").expect("ok");
        assert_eq!(first.event_type, WatchEventType::Added);
        assert_eq!(first.object.key.id, "queued");

        // Different kind: filtered out.
        store
            .create_resource(
                NewResource::new(ResourceKey::new("other", "things", "x"), json!({}))
                    .with_state("in_queue"),
            )
            .await
            .expect("create other");
        store
            .update_resource(
                &key("done"),
                ResourcePatch::new().with_status(crate::ResourceStatus::with_state("update")),
            )
            .await
            .expect("update");

        let next = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("no timeout")
            .expect("event")
            .expect("ok");
        assert_eq!(next.event_type, WatchEventType::Modified);
        assert_eq!(next.object.key.id, "done");
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let store = MemoryStore::new();
        let mut watch = store
            .register_watcher(WatchRequest::new("g", "t"))
            .await
            .expect("watch");
        assert_eq!(store.watcher_count(), 1);
        store.disconnect_watchers();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_selector() {
        let store = MemoryStore::new();
        for (id, state) in [("b", "LOCKED"), ("a", "LOCKED"), ("c", "UNLOCKED")] {
            store
                .create_resource(NewResource::new(key(id), json!({})).with_state(state))
                .await
                .expect("create");
        }
        let locked = store
            .list_resources(
                "deployment.hangar.io",
                "directors",
                &"state=LOCKED".parse().expect("selector"),
            )
            .expect("list");
        let ids: Vec<_> = locked.iter().map(|r| r.key.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }
}
