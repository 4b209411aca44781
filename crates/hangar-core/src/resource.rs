//! Resource schema shared by every coordination component.
//!
//! A [`Resource`] is the decoded, domain-facing view of a stored object.
//! JSON-in-string wire fields never appear here; see [`crate::wire`] for the
//! boundary where they are encoded and decoded.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Well-known label keys.
pub mod labels {
    /// Label mirroring `status.state`, used by server-side watch filters.
    pub const STATE: &str = "state";
}

/// Well-known annotation keys.
pub mod annotations {
    /// Identity of the controller process currently serving the resource.
    pub const LOCKED_BY_MANAGER: &str = "lockedByManager";
}

/// Identifies a resource by group, type, and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// API group (e.g. `deployment.hangar.io`).
    pub group: String,
    /// Resource type within the group (e.g. `directors`).
    pub resource_type: String,
    /// Resource name.
    pub id: String,
}

impl ResourceKey {
    /// Creates a resource key.
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        resource_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns true if this key belongs to the given group and type.
    #[must_use]
    pub fn is_kind(&self, group: &str, resource_type: &str) -> bool {
        self.group == group && self.resource_type == resource_type
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.resource_type, self.id)
    }
}

/// Lifecycle state of a reconciled resource.
///
/// States unknown to this crate round-trip through [`ResourceState::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Waiting to be created.
    InQueue,
    /// Waiting to be updated.
    Update,
    /// Waiting to be deleted.
    Delete,
    /// Waiting to be aborted.
    Abort,
    /// A handler accepted the request and is still working on it.
    InProgress,
    /// The last operation completed.
    Succeeded,
    /// The last create/update/abort failed.
    Failed,
    /// The last delete failed.
    DeleteFailed,
    /// The operation was aborted.
    Aborted,
    /// Any other state string.
    Other(String),
}

impl ResourceState {
    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InQueue => "in_queue",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Abort => "abort",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeleteFailed => "delete_failed",
            Self::Aborted => "aborted",
            Self::Other(s) => s,
        }
    }

    /// States that no longer trigger automatic processing.
    #[must_use]
    pub fn default_terminal() -> Vec<Self> {
        vec![
            Self::Succeeded,
            Self::Failed,
            Self::DeleteFailed,
            Self::Aborted,
        ]
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "in_queue" => Self::InQueue,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "abort" => Self::Abort,
            "in_progress" => Self::InProgress,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "delete_failed" => Self::DeleteFailed,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<&str> for ResourceState {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }
}

/// Decoded `status` block of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current state string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Last successful handler payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Last structured handler error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Name of the last operation dispatched against the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
}

impl ResourceStatus {
    /// Creates a status with only the state set.
    #[must_use]
    pub fn with_state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Self::default()
        }
    }
}

/// Decoded view of a stored resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Resource identity.
    pub key: ResourceKey,
    /// Opaque version token for conditional writes.
    pub resource_version: String,
    /// Labels (server-side filterable).
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Decoded `spec.options`.
    pub options: Value,
    /// Decoded `status`.
    pub status: ResourceStatus,
}

impl Resource {
    /// Returns `status.state`, if set.
    #[must_use]
    pub fn status_state(&self) -> Option<&str> {
        self.status.state.as_deref()
    }

    /// Returns the typed lifecycle state, if set.
    #[must_use]
    pub fn lifecycle_state(&self) -> Option<ResourceState> {
        self.status_state().map(ResourceState::from)
    }

    /// Returns the `state` label, if set.
    #[must_use]
    pub fn state_label(&self) -> Option<&str> {
        self.labels.get(labels::STATE).map(String::as_str)
    }

    /// Returns the current claim owner, treating an empty annotation as unclaimed.
    #[must_use]
    pub fn claimed_by(&self) -> Option<&str> {
        self.annotations
            .get(annotations::LOCKED_BY_MANAGER)
            .map(String::as_str)
            .filter(|owner| !owner.is_empty())
    }

    /// Decodes `spec.options` into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the options do not match `T`.
    pub fn decode_options<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.options.clone()).map_err(|e| Error::Serialization {
            message: format!("decode options of {}: {e}", self.key),
        })
    }
}

/// A resource to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    /// Resource identity.
    pub key: ResourceKey,
    /// Initial labels.
    pub labels: BTreeMap<String, String>,
    /// Initial annotations.
    pub annotations: BTreeMap<String, String>,
    /// Initial `spec.options`.
    pub options: Value,
    /// Initial status.
    pub status: ResourceStatus,
}

impl NewResource {
    /// Creates a new resource description with empty metadata.
    #[must_use]
    pub fn new(key: ResourceKey, options: Value) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            options,
            status: ResourceStatus::default(),
        }
    }

    /// Sets `status.state` and mirrors it into the `state` label.
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.labels.insert(labels::STATE.to_string(), state.clone());
        self.status.state = Some(state);
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// A partial update applied by [`crate::store::ResourceStore::update_resource`].
///
/// Map entries with `None` values remove the key. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    /// Version the caller expects; `None` writes unconditionally.
    pub expected_version: Option<String>,
    /// Label upserts and removals.
    pub labels: BTreeMap<String, Option<String>>,
    /// Annotation upserts and removals.
    pub annotations: BTreeMap<String, Option<String>>,
    /// Replacement `spec.options`.
    pub options: Option<Value>,
    /// Replacement status.
    pub status: Option<ResourceStatus>,
}

impl ResourcePatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the patch conditional on the given version.
    #[must_use]
    pub fn expect_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    /// Makes the patch conditional when a version is given.
    #[must_use]
    pub fn expect_version_opt(mut self, version: Option<String>) -> Self {
        self.expected_version = version;
        self
    }

    /// Upserts a label.
    #[must_use]
    pub fn set_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), Some(value.into()));
        self
    }

    /// Upserts an annotation.
    #[must_use]
    pub fn set_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), Some(value.into()));
        self
    }

    /// Removes an annotation.
    #[must_use]
    pub fn remove_annotation(mut self, key: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), None);
        self
    }

    /// Replaces `spec.options`.
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Replaces the status and mirrors its state into the `state` label.
    #[must_use]
    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        if let Some(state) = &status.state {
            self.labels
                .insert(labels::STATE.to_string(), Some(state.clone()));
        }
        self.status = Some(status);
        self
    }

    /// Applies this patch's metadata and body changes to a resource in place.
    ///
    /// Version checks are the store's responsibility.
    pub fn apply_to(self, resource: &mut Resource) {
        apply_map(&mut resource.labels, self.labels);
        apply_map(&mut resource.annotations, self.annotations);
        if let Some(options) = self.options {
            resource.options = options;
        }
        if let Some(status) = self.status {
            resource.status = status;
        }
    }
}

fn apply_map(target: &mut BTreeMap<String, String>, changes: BTreeMap<String, Option<String>>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                target.insert(key, value);
            }
            None => {
                target.remove(&key);
            }
        }
    }
}

/// Kind of change delivered by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    /// The resource appeared (or was present when the watch started).
    Added,
    /// The resource changed.
    Modified,
    /// The resource was removed.
    Deleted,
}

/// A single change delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    /// Kind of change.
    pub event_type: WatchEventType,
    /// The resource as of this change.
    pub object: Resource,
}
