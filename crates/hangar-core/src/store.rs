//! Resource store contract.
//!
//! Every coordination protocol in Hangar is built on this trait alone:
//! versioned reads, conditional writes, and a filtered watch stream. There is
//! no other channel between processes.
//!
//! ## Contract
//!
//! - `update_resource` with an expected version fails with
//!   [`Error::Conflict`](crate::Error::Conflict) on mismatch and
//!   [`Error::NotFound`](crate::Error::NotFound) if the resource vanished.
//! - `create_resource` fails with `Conflict` if the resource already exists.
//! - `delete_resource` fails with `NotFound` if the resource is absent.
//! - Watch streams deliver events at least once. A watch starts with an
//!   `ADDED` event for every matching resource that already exists.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::resource::{NewResource, Resource, ResourceKey, ResourcePatch, WatchEvent};
use crate::selector::LabelSelector;

/// Stream of watch events; an `Err` item reports a broken stream.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Parameters for [`ResourceStore::register_watcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    /// API group to watch.
    pub group: String,
    /// Resource type to watch.
    pub resource_type: String,
    /// Server-side label filter.
    pub selector: LabelSelector,
}

impl WatchRequest {
    /// Watches every resource of a kind.
    #[must_use]
    pub fn new(group: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource_type: resource_type.into(),
            selector: LabelSelector::everything(),
        }
    }

    /// Restricts the watch to resources matching the selector.
    #[must_use]
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Returns true if the key belongs to the watched kind.
    #[must_use]
    pub fn covers(&self, key: &ResourceKey) -> bool {
        key.is_kind(&self.group, &self.resource_type)
    }
}

/// Client for the shared declarative resource store.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Reads a resource.
    ///
    /// Returns `Error::NotFound` if absent.
    async fn get_resource(&self, key: &ResourceKey) -> Result<Resource>;

    /// Creates a resource.
    ///
    /// Returns `Error::Conflict` if a resource with the same key exists.
    async fn create_resource(&self, resource: NewResource) -> Result<Resource>;

    /// Applies a patch, conditional on `patch.expected_version` when set.
    async fn update_resource(&self, key: &ResourceKey, patch: ResourcePatch) -> Result<Resource>;

    /// Deletes a resource.
    ///
    /// Returns `Error::NotFound` if absent.
    async fn delete_resource(&self, key: &ResourceKey) -> Result<()>;

    /// Opens a filtered watch stream.
    async fn register_watcher(&self, request: WatchRequest) -> Result<WatchStream>;
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Resource> {
        (**self).get_resource(key).await
    }

    async fn create_resource(&self, resource: NewResource) -> Result<Resource> {
        (**self).create_resource(resource).await
    }

    async fn update_resource(&self, key: &ResourceKey, patch: ResourcePatch) -> Result<Resource> {
        (**self).update_resource(key, patch).await
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<()> {
        (**self).delete_resource(key).await
    }

    async fn register_watcher(&self, request: WatchRequest) -> Result<WatchStream> {
        (**self).register_watcher(request).await
    }
}

/// Reads a resource, mapping `NotFound` to `None`.
///
/// # Errors
///
/// Propagates every store error other than `NotFound`.
pub async fn get_optional<S: ResourceStore + ?Sized>(
    store: &S,
    key: &ResourceKey,
) -> Result<Option<Resource>> {
    match store.get_resource(key).await {
        Ok(resource) => Ok(Some(resource)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
