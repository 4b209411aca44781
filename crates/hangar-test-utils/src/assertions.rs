//! Assertion helpers for coordination tests.

use hangar_core::{Error, Resource};

/// Asserts that the resource carries no claim annotation.
///
/// # Panics
///
/// Panics if the resource is claimed.
pub fn assert_unclaimed(resource: &Resource) {
    assert_eq!(
        resource.claimed_by(),
        None,
        "expected {} to be unclaimed",
        resource.key
    );
}

/// Asserts that `status.state` and the `state` label both equal `state`.
///
/// # Panics
///
/// Panics if either differs.
pub fn assert_state(resource: &Resource, state: &str) {
    assert_eq!(
        resource.status_state(),
        Some(state),
        "status.state of {}",
        resource.key
    );
    assert_eq!(
        resource.state_label(),
        Some(state),
        "state label of {}",
        resource.key
    );
}

/// Asserts that `err` is `AlreadyLocked` for `name` and its message names it.
///
/// # Panics
///
/// Panics if the error is of another kind or names another deployment.
pub fn assert_already_locked(err: &Error, name: &str) {
    match err {
        Error::AlreadyLocked { name: locked, .. } => assert_eq!(locked, name),
        other => panic!("expected AlreadyLocked, got {other:?}"),
    }
    assert!(
        err.to_string().contains(&format!("`{name}`")),
        "message should name {name}: {err}"
    );
}
