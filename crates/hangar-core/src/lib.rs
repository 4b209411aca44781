//! # hangar-core
//!
//! Shared primitives for the Hangar control plane coordination substrate.
//!
//! - **Resource schema**: decoded resources, patches, watch events
//! - **Wire codec**: the only place JSON-in-string fields are encoded/decoded
//! - **Store contract**: [`ResourceStore`] with conditional writes and watches
//! - **Memory store**: full in-process implementation of the contract
//! - **Configuration, identity, observability**
//!
//! ## Example
//!
//! ```rust
//! use hangar_core::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<()> {
//! let store = MemoryStore::new();
//! let key = ResourceKey::new("deployment.hangar.io", "directors", "r1");
//! let created = store
//!     .create_resource(
//!         NewResource::new(key.clone(), json!({"plan_id": "small"})).with_state("in_queue"),
//!     )
//!     .await?;
//!
//! // Conditional write against the version we read.
//! store
//!     .update_resource(&key, ResourcePatch::new().expect_version(created.resource_version))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod identity;
pub mod memory;
pub mod observability;
pub mod resource;
pub mod selector;
pub mod store;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::identity::OwnerId;
    pub use crate::memory::MemoryStore;
    pub use crate::resource::{
        NewResource, Resource, ResourceKey, ResourcePatch, ResourceState, ResourceStatus,
        WatchEvent, WatchEventType,
    };
    pub use crate::selector::LabelSelector;
    pub use crate::store::{ResourceStore, WatchRequest, WatchStream};
}

pub use config::{ControllerConfig, CoordinationConfig, LockConfig, PollerConfig, WatchConfig};
pub use error::{Error, Result};
pub use identity::OwnerId;
pub use memory::MemoryStore;
pub use observability::{LogFormat, init_logging};
pub use resource::{
    NewResource, Resource, ResourceKey, ResourcePatch, ResourceState, ResourceStatus, WatchEvent,
    WatchEventType,
};
pub use selector::LabelSelector;
pub use store::{ResourceStore, WatchRequest, WatchStream, get_optional};
