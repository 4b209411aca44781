//! Error types and result aliases for Hangar.
//!
//! Store failures are classified so coordination code can decide which ones
//! are benign. `NotFound` usually means "nothing to do", `Conflict` means a
//! conditional write lost a race, and `Unavailable` is backend trouble worth
//! retrying.

use std::fmt;

use chrono::{DateTime, Utc};

/// The result type used throughout Hangar.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Hangar operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// Display form of the missing resource key.
        resource: String,
    },

    /// A conditional write was rejected because the version did not match.
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Display form of the contended resource key.
        resource: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A deployment is already locked by another operation.
    #[error(
        "Service Instance `{name}` **Locked** at `{}` for `{operation}`",
        .lock_time.to_rfc3339()
    )]
    AlreadyLocked {
        /// The locked deployment name.
        name: String,
        /// When the existing lock was taken.
        lock_time: DateTime<Utc>,
        /// The operation holding the existing lock.
        operation: String,
    },

    /// The store backend is unavailable or returned a transient failure.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bounded retry budget was exhausted.
    #[error("timed out {operation} on {resource} after {retries} retries")]
    Timeout {
        /// The operation that gave up.
        operation: &'static str,
        /// Display form of the resource key.
        resource: String,
        /// Number of retries attempted.
        retries: u32,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a not-found error for the given resource.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
        }
    }

    /// Creates a version conflict error for the given resource.
    #[must_use]
    pub fn conflict(resource: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    /// Creates a new unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new unavailable error with a source cause.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the resource was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a conditional write lost a race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the error is the structured "already locked" rejection.
    #[must_use]
    pub const fn is_already_locked(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
