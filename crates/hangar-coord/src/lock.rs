//! TTL-bounded deployment locks.
//!
//! A deployment lock is a resource of its own (`lock.hangar.io/deploymentlocks`)
//! named after the deployment it guards. Higher-level operations call
//! [`DeploymentLockManager::lock`] before touching a deployment and
//! [`DeploymentLockManager::unlock`] afterwards; the
//! [`UnlockResourcePoller`](crate::poller::UnlockResourcePoller) releases locks
//! whose owner never came back.
//!
//! ## State transitions
//!
//! - `LOCKED` is only entered from absent, `UNLOCKED`, or an expired `LOCKED`.
//! - Every entry into `LOCKED` is a create or a conditional patch, so of two
//!   racing callers exactly one succeeds and the other sees
//!   [`Error::AlreadyLocked`].
//! - `UNLOCKED` is idempotent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hangar_core::observability::lock_span;
use hangar_core::{
    Error, LockConfig, NewResource, Resource, ResourceKey, ResourcePatch, ResourceStatus,
    ResourceStore, Result, get_optional,
};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, warn};

use crate::metrics::CoordMetrics;

/// API group of deployment lock resources.
pub const LOCK_GROUP: &str = "lock.hangar.io";

/// Resource type of deployment lock resources.
pub const DEPLOYMENT_LOCKS: &str = "deploymentlocks";

/// Returns the resource key of the lock guarding `name`.
#[must_use]
pub fn lock_key(name: &str) -> ResourceKey {
    ResourceKey::new(LOCK_GROUP, DEPLOYMENT_LOCKS, name)
}

/// Kind of lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockType {
    /// Shared lock; never blocks other lockers.
    Read,
    /// Exclusive lock.
    Write,
}

/// Lock state as stored in `labels.state` and `status.state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// The lock is held.
    Locked,
    /// The lock was released.
    Unlocked,
    /// A state this crate does not write; never treated as held.
    Other(String),
}

impl LockState {
    /// Returns the stored representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Locked => "LOCKED",
            Self::Unlocked => "UNLOCKED",
            Self::Other(value) => value,
        }
    }

    /// Parses a stored state string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "LOCKED" => Self::Locked,
            "UNLOCKED" => Self::Unlocked,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation a lock was taken for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedResourceDetails {
    /// Group of the operation resource.
    pub resource_group: String,
    /// Type of the operation resource.
    pub resource_type: String,
    /// Id of the operation resource.
    pub resource_id: String,
    /// Operation name (e.g. `create`, `backup`).
    pub operation: String,
}

impl LockedResourceDetails {
    /// Creates lock details.
    #[must_use]
    pub fn new(
        resource_group: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            resource_group: resource_group.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            operation: operation.into(),
        }
    }

    /// Returns the key of the referenced operation resource.
    #[must_use]
    pub fn operation_key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_group, &self.resource_type, &self.resource_id)
    }
}

/// Decoded `spec.options` of a lock resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOptions {
    /// When the lock was taken.
    pub lock_time: DateTime<Utc>,
    /// Lock lifetime in milliseconds.
    #[serde(rename = "lockTTL", default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl: Option<u64>,
    /// Lock kind.
    pub lock_type: LockType,
    /// The operation holding the lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_resource_details: Option<LockedResourceDetails>,
}

impl LockOptions {
    /// Creates write-lock options stamped with `lock_time`.
    #[must_use]
    pub fn write(lock_time: DateTime<Utc>) -> Self {
        Self {
            lock_time,
            lock_ttl: None,
            lock_type: LockType::Write,
            locked_resource_details: None,
        }
    }

    /// Creates read-lock options stamped with `lock_time`.
    #[must_use]
    pub fn read(lock_time: DateTime<Utc>) -> Self {
        Self {
            lock_type: LockType::Read,
            ..Self::write(lock_time)
        }
    }

    /// Sets the lock lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the operation holding the lock.
    #[must_use]
    pub fn with_details(mut self, details: LockedResourceDetails) -> Self {
        self.locked_resource_details = Some(details);
        self
    }

    /// Effective lifetime: `lockTTL` if set, otherwise `default_ttl`.
    #[must_use]
    pub fn ttl(&self, default_ttl: Option<Duration>) -> Option<Duration> {
        self.lock_ttl.map(Duration::from_millis).or(default_ttl)
    }

    /// Returns true if the lock's lifetime has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, default_ttl: Option<Duration>) -> bool {
        let Some(ttl) = self.ttl(default_ttl) else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.lock_time) >= ttl,
            Err(_) => false,
        }
    }

    fn operation(&self) -> String {
        self.locked_resource_details
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |d| d.operation.clone())
    }
}

/// Result of [`DeploymentLockManager::check_write_lock_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteLockStatus {
    /// True if an unexpired write lock is held.
    pub is_write_locked: bool,
    /// The held lock's options, present only when write-locked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_details: Option<LockOptions>,
}

impl WriteLockStatus {
    fn unlocked() -> Self {
        Self {
            is_write_locked: false,
            lock_details: None,
        }
    }
}

/// A decoded lock resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Deployment name.
    pub name: String,
    /// Stored state; `None` if the resource carries none.
    pub state: Option<LockState>,
    /// Decoded options.
    pub options: LockOptions,
    /// Version usable as the `lock_id` of [`DeploymentLockManager::unlock`].
    pub resource_version: String,
}

impl LockInfo {
    fn from_resource(resource: &Resource) -> Result<Self> {
        let state = resource
            .status_state()
            .or_else(|| resource.state_label())
            .map(LockState::parse);
        Ok(Self {
            name: resource.key.id.clone(),
            state,
            options: resource.decode_options()?,
            resource_version: resource.resource_version.clone(),
        })
    }

    /// Returns true if this is an unexpired write lock in a locked (or unset) state.
    #[must_use]
    pub fn is_write_locked(&self, now: DateTime<Utc>, default_ttl: Option<Duration>) -> bool {
        self.options.lock_type == LockType::Write
            && matches!(self.state, None | Some(LockState::Locked))
            && !self.options.is_expired(now, default_ttl)
    }
}

/// Acquires, releases, and queries deployment locks.
pub struct DeploymentLockManager<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    config: LockConfig,
    metrics: CoordMetrics,
}

impl<S: ResourceStore + ?Sized> DeploymentLockManager<S> {
    /// Creates a lock manager.
    pub fn new(store: Arc<S>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            metrics: CoordMetrics::new(),
        }
    }

    /// Returns the lock settings.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Reads and decodes the lock for `name`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `NotFound`, or a serialization error if
    /// the stored options are malformed.
    pub async fn get_lock(&self, name: &str) -> Result<Option<LockInfo>> {
        get_optional(self.store.as_ref(), &lock_key(name))
            .await?
            .as_ref()
            .map(LockInfo::from_resource)
            .transpose()
    }

    /// Reports whether `name` is currently write-locked.
    ///
    /// An absent lock, an `UNLOCKED` state, a read lock, and an expired TTL all
    /// report not locked.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `NotFound`.
    pub async fn check_write_lock_status(&self, name: &str) -> Result<WriteLockStatus> {
        let Some(lock) = self.get_lock(name).await? else {
            return Ok(WriteLockStatus::unlocked());
        };
        if lock.is_write_locked(Utc::now(), self.config.default_ttl) {
            Ok(WriteLockStatus {
                is_write_locked: true,
                lock_details: Some(lock.options),
            })
        } else {
            Ok(WriteLockStatus::unlocked())
        }
    }

    /// Takes the lock for `name` and returns the lock resource's version.
    ///
    /// A held, unexpired write lock for the same operation is refreshed with
    /// the new options. A missing `lockTTL` is filled from the configured
    /// default so every process evaluates the same expiry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyLocked`] if another operation holds the lock or
    /// won a concurrent race for it, and store errors otherwise.
    pub async fn lock(&self, name: &str, options: LockOptions) -> Result<String> {
        let result = self
            .lock_inner(name, options)
            .instrument(lock_span("lock", name))
            .await;
        let label = match &result {
            Ok(_) => "acquired",
            Err(e) if e.is_already_locked() => "already_locked",
            Err(_) => "error",
        };
        self.metrics.record_lock(label);
        result
    }

    async fn lock_inner(&self, name: &str, mut options: LockOptions) -> Result<String> {
        if options.lock_ttl.is_none() {
            if let Some(ttl) = self.config.default_ttl {
                options = options.with_ttl(ttl);
            }
        }
        let key = lock_key(name);

        let Some(existing) = get_optional(self.store.as_ref(), &key).await? else {
            return self.create_lock(name, &options).await;
        };
        let current = LockInfo::from_resource(&existing)?;

        if current.is_write_locked(Utc::now(), self.config.default_ttl)
            && current.options.locked_resource_details != options.locked_resource_details
        {
            info!(holder = %current.options.operation(), "deployment already locked");
            return Err(already_locked(name, &current.options));
        }

        let patch = ResourcePatch::new()
            .expect_version(&existing.resource_version)
            .with_options(serde_json::to_value(&options)?)
            .with_status(ResourceStatus::with_state(LockState::Locked.as_str()));
        match self.store.update_resource(&key, patch).await {
            Ok(updated) => {
                info!(version = %updated.resource_version, "lock taken over existing resource");
                Ok(updated.resource_version)
            }
            Err(e) if e.is_conflict() => {
                debug!("lost lock race on conditional patch");
                Err(self.lost_race(name, &options).await)
            }
            Err(e) if e.is_not_found() => self.create_lock(name, &options).await,
            Err(e) => Err(e),
        }
    }

    async fn create_lock(&self, name: &str, options: &LockOptions) -> Result<String> {
        let resource = NewResource::new(lock_key(name), serde_json::to_value(options)?)
            .with_state(LockState::Locked.as_str());
        match self.store.create_resource(resource).await {
            Ok(created) => {
                info!(version = %created.resource_version, "lock created");
                Ok(created.resource_version)
            }
            Err(e) if e.is_conflict() => {
                debug!("lost lock race on create");
                Err(self.lost_race(name, options).await)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds the `AlreadyLocked` error for a lost race, naming the winner when
    /// it can be read back.
    async fn lost_race(&self, name: &str, requested: &LockOptions) -> Error {
        match self.get_lock(name).await {
            Ok(Some(winner)) => already_locked(name, &winner.options),
            Ok(None) | Err(_) => already_locked(name, requested),
        }
    }

    /// Releases the lock for `name`.
    ///
    /// `lock_id`, when given, is the version returned by [`Self::lock`]; the
    /// release is then conditional on it. `NotFound` and `Conflict` both mean
    /// the lock is gone or has moved on, and count as success without a retry.
    /// Other errors are retried `max_retries` times with a fixed delay; both
    /// default to the configured values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] once the retry budget is exhausted.
    pub async fn unlock(
        &self,
        name: &str,
        lock_id: Option<&str>,
        max_retries: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<()> {
        let max_retries = max_retries.unwrap_or(self.config.unlock_max_retries);
        let retry_delay = retry_delay.unwrap_or(self.config.unlock_retry_delay);
        self.unlock_inner(name, lock_id, max_retries, retry_delay)
            .instrument(lock_span("unlock", name))
            .await
    }

    async fn unlock_inner(
        &self,
        name: &str,
        lock_id: Option<&str>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<()> {
        let key = lock_key(name);
        let mut attempt = 0;
        loop {
            let patch = ResourcePatch::new()
                .expect_version_opt(lock_id.map(str::to_string))
                .with_status(ResourceStatus::with_state(LockState::Unlocked.as_str()));
            match self.store.update_resource(&key, patch).await {
                Ok(updated) => {
                    self.metrics.record_unlock_attempt("unlocked");
                    info!(version = %updated.resource_version, "lock released");
                    return Ok(());
                }
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    self.metrics.record_unlock_attempt("already_resolved");
                    debug!(error = %e, "lock already released or moved on");
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.record_unlock_attempt("error");
                    if attempt >= max_retries {
                        warn!(
                            error = %e,
                            retries = max_retries,
                            "unlock retries exhausted, lock left for the poller"
                        );
                        return Err(Error::Timeout {
                            operation: "unlock",
                            resource: key.to_string(),
                            retries: max_retries,
                        });
                    }
                    attempt += 1;
                    warn!(error = %e, attempt, max_retries, "unlock failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    /// Deletes the lock resource for `name` outright.
    ///
    /// Returns `false` if there was no lock to delete.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `NotFound`.
    pub async fn force_unlock(&self, name: &str) -> Result<bool> {
        match self.store.delete_resource(&lock_key(name)).await {
            Ok(()) => {
                warn!(deployment = %name, "lock force-deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<S: ResourceStore + ?Sized> fmt::Debug for DeploymentLockManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentLockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn already_locked(name: &str, holder: &LockOptions) -> Error {
    Error::AlreadyLocked {
        name: name.to_string(),
        lock_time: holder.lock_time,
        operation: holder.operation(),
    }
}
