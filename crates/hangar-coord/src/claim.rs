//! Processing claims on watched resources.
//!
//! A claim is the `lockedByManager` annotation, written with a conditional
//! patch against the version the caller observed. The store's version check is
//! the only arbiter: of several processes racing on the same delivery exactly
//! one write is accepted and the rest see a conflict.

use hangar_core::resource::annotations::LOCKED_BY_MANAGER;
use hangar_core::{
    OwnerId, Resource, ResourceKey, ResourcePatch, ResourceStatus, ResourceStore, Result,
};
use tracing::{debug, warn};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This process now holds the claim; carries the claimed resource.
    Claimed(Resource),
    /// The resource already carries this process's identity.
    AlreadyOwned,
    /// Another process holds the claim.
    HeldBy(String),
    /// A concurrent writer changed the resource first.
    Lost,
    /// The resource was deleted concurrently.
    Vanished,
}

impl ClaimOutcome {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed(_) => "claimed",
            Self::AlreadyOwned => "already_owned",
            Self::HeldBy(_) => "held_elsewhere",
            Self::Lost => "lost",
            Self::Vanished => "vanished",
        }
    }
}

/// Result of a claim release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The annotation was removed by this call.
    Released,
    /// Nothing to release: the resource is gone, unclaimed, or claimed by someone else.
    AlreadyResolved,
}

/// Attempts to claim `resource` for `owner` using its observed version.
///
/// # Errors
///
/// Returns store errors other than `Conflict` and `NotFound`, which are
/// reported as [`ClaimOutcome::Lost`] and [`ClaimOutcome::Vanished`].
pub async fn try_claim<S: ResourceStore + ?Sized>(
    store: &S,
    resource: &Resource,
    owner: &OwnerId,
) -> Result<ClaimOutcome> {
    match resource.claimed_by() {
        Some(current) if current == owner.as_str() => return Ok(ClaimOutcome::AlreadyOwned),
        Some(current) => return Ok(ClaimOutcome::HeldBy(current.to_string())),
        None => {}
    }

    let patch = ResourcePatch::new()
        .expect_version(&resource.resource_version)
        .set_annotation(LOCKED_BY_MANAGER, owner.as_str());

    match store.update_resource(&resource.key, patch).await {
        Ok(claimed) => {
            debug!(
                resource = %resource.key,
                owner = %owner,
                version = %claimed.resource_version,
                "claimed resource"
            );
            Ok(ClaimOutcome::Claimed(claimed))
        }
        Err(e) if e.is_conflict() => {
            debug!(resource = %resource.key, owner = %owner, "claim lost to concurrent writer");
            Ok(ClaimOutcome::Lost)
        }
        Err(e) if e.is_not_found() => {
            debug!(resource = %resource.key, "resource vanished before claim");
            Ok(ClaimOutcome::Vanished)
        }
        Err(e) => Err(e),
    }
}

/// Writes `status` to a resource this process has claimed.
///
/// Re-reads and retries on version conflicts up to `attempts` times, since
/// outside writers may touch labels or annotations while the handler runs.
/// Returns `Ok(None)` when the resource vanished or the claim was taken away.
///
/// # Errors
///
/// Returns the last store error when every attempt failed.
pub async fn write_status<S: ResourceStore + ?Sized>(
    store: &S,
    key: &ResourceKey,
    owner: &OwnerId,
    status: ResourceStatus,
    attempts: u32,
) -> Result<Option<Resource>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = match store.get_resource(key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if current.claimed_by() != Some(owner.as_str()) {
            warn!(
                resource = %key,
                owner = %owner,
                holder = ?current.claimed_by(),
                "claim no longer held, skipping status write"
            );
            return Ok(None);
        }

        let patch = ResourcePatch::new()
            .expect_version(&current.resource_version)
            .with_status(status.clone());
        match store.update_resource(key, patch).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(resource = %key, attempt, "status write raced, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Clears this process's claim on a resource.
///
/// `NotFound` and a claim held by someone else both count as already resolved.
/// A conflict re-reads the resource and retries up to `attempts` times; if the
/// race persists the claim is left for the next writer and reported resolved.
///
/// # Errors
///
/// Returns store errors other than `NotFound` and `Conflict`.
pub async fn release_claim<S: ResourceStore + ?Sized>(
    store: &S,
    key: &ResourceKey,
    owner: &OwnerId,
    attempts: u32,
) -> Result<ReleaseOutcome> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = match store.get_resource(key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(ReleaseOutcome::AlreadyResolved),
            Err(e) => return Err(e),
        };
        if current.claimed_by() != Some(owner.as_str()) {
            return Ok(ReleaseOutcome::AlreadyResolved);
        }

        let patch = ResourcePatch::new()
            .expect_version(&current.resource_version)
            .remove_annotation(LOCKED_BY_MANAGER);
        match store.update_resource(key, patch).await {
            Ok(_) => {
                debug!(resource = %key, owner = %owner, "released claim");
                return Ok(ReleaseOutcome::Released);
            }
            Err(e) if e.is_not_found() => return Ok(ReleaseOutcome::AlreadyResolved),
            Err(e) if e.is_conflict() => {
                if attempt >= attempts {
                    warn!(
                        resource = %key,
                        owner = %owner,
                        attempts,
                        "claim release kept racing, leaving it to the next writer"
                    );
                    return Ok(ReleaseOutcome::AlreadyResolved);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::{MemoryStore, NewResource};
    use serde_json::json;

    fn key() -> ResourceKey {
        ResourceKey::new("deployment.hangar.io", "directors", "r1")
    }

    async fn seeded() -> (MemoryStore, Resource) {
        let store = MemoryStore::new();
        let resource = store
            .create_resource(NewResource::new(key(), json!({})).with_state("in_queue"))
            .await
            .expect("create");
        (store, resource)
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).expect("owner")
    }

    #[tokio::test]
    async fn claim_then_release() {
        let (store, resource) = seeded().await;
        let outcome = try_claim(&store, &resource, &owner("a")).await.expect("claim");
        let ClaimOutcome::Claimed(claimed) = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(claimed.claimed_by(), Some("a"));

        let released = release_claim(&store, &key(), &owner("a"), 3)
            .await
            .expect("release");
        assert_eq!(released, ReleaseOutcome::Released);
        let current = store.get_resource(&key()).await.expect("get");
        assert_eq!(current.claimed_by(), None);
    }

    #[tokio::test]
    async fn second_claim_on_same_version_is_lost() {
        let (store, resource) = seeded().await;
        assert!(matches!(
            try_claim(&store, &resource, &owner("a")).await.expect("a"),
            ClaimOutcome::Claimed(_)
        ));
        // `resource` is the stale delivery both processes observed.
        assert_eq!(
            try_claim(&store, &resource, &owner("b")).await.expect("b"),
            ClaimOutcome::Lost
        );
    }

    #[tokio::test]
    async fn claim_annotation_short_circuits() {
        let (store, resource) = seeded().await;
        let ClaimOutcome::Claimed(claimed) =
            try_claim(&store, &resource, &owner("a")).await.expect("a")
        else {
            panic!("expected claim");
        };
        assert_eq!(
            try_claim(&store, &claimed, &owner("a")).await.expect("a again"),
            ClaimOutcome::AlreadyOwned
        );
        assert_eq!(
            try_claim(&store, &claimed, &owner("b")).await.expect("b"),
            ClaimOutcome::HeldBy("a".into())
        );
    }

    #[tokio::test]
    async fn claim_on_deleted_resource_vanishes() {
        let (store, resource) = seeded().await;
        store.delete_resource(&key()).await.expect("delete");
        assert_eq!(
            try_claim(&store, &resource, &owner("a")).await.expect("claim"),
            ClaimOutcome::Vanished
        );
        assert_eq!(
            release_claim(&store, &key(), &owner("a"), 3)
                .await
                .expect("release"),
            ReleaseOutcome::AlreadyResolved
        );
    }

    #[tokio::test]
    async fn status_write_requires_claim() {
        let (store, resource) = seeded().await;
        let skipped = write_status(
            &store,
            &key(),
            &owner("a"),
            ResourceStatus::with_state("succeeded"),
            3,
        )
        .await
        .expect("write");
        assert!(skipped.is_none());

        try_claim(&store, &resource, &owner("a")).await.expect("claim");
        let written = write_status(
            &store,
            &key(),
            &owner("a"),
            ResourceStatus::with_state("succeeded"),
            3,
        )
        .await
        .expect("write")
        .expect("written");
        assert_eq!(written.state_label(), Some("succeeded"));
        assert_eq!(written.claimed_by(), Some("a"));
    }

    #[tokio::test]
    async fn release_leaves_foreign_claim_alone() {
        let (store, resource) = seeded().await;
        try_claim(&store, &resource, &owner("a")).await.expect("claim");
        assert_eq!(
            release_claim(&store, &key(), &owner("b"), 3)
                .await
                .expect("release"),
            ReleaseOutcome::AlreadyResolved
        );
        let current = store.get_resource(&key()).await.expect("get");
        assert_eq!(current.claimed_by(), Some("a"));
    }
}
