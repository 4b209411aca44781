//! Process identity used as the claim owner.
//!
//! The identity is explicit configuration rather than something derived from
//! the network, so claim correctness never depends on topology.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identity of a coordinating process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner id after validating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or contains whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("owner id cannot be empty".into()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "owner id cannot contain whitespace: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Generates a unique owner id for this process.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("hangar-{}", Ulid::new().to_string().to_lowercase()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
