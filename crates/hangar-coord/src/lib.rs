//! # hangar-coord
//!
//! Coordination protocols built on the [`hangar_core::ResourceStore`] contract.
//!
//! - **Reconciliation controller**: watches a resource kind, claims each
//!   actionable event with a conditional write, dispatches to a handler,
//!   records status, and releases the claim.
//! - **Deployment lock manager**: TTL-bounded advisory locks serializing whole
//!   operations against a deployment.
//! - **Unlock poller**: releases locks once the operation holding them has
//!   finished, covering owners that crashed before calling `unlock()`.
//!
//! Processes never talk to each other. Mutual exclusion comes entirely from
//! the store's version checks; every in-process map here is an advisory cache.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use hangar_coord::lock::{DeploymentLockManager, LockOptions, LockedResourceDetails};
//! use hangar_core::{LockConfig, MemoryStore};
//!
//! # async fn demo() -> hangar_core::Result<()> {
//! let locks = DeploymentLockManager::new(Arc::new(MemoryStore::new()), LockConfig::default());
//! let details = LockedResourceDetails::new("backup.hangar.io", "backups", "b1", "backup");
//! let lock_id = locks
//!     .lock("i1", LockOptions::write(Utc::now()).with_details(details))
//!     .await?;
//!
//! assert!(locks.check_write_lock_status("i1").await?.is_write_locked);
//! locks.unlock("i1", Some(&lock_id), None, None).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod claim;
pub mod controller;
pub mod handler;
pub mod lock;
pub mod metrics;
pub mod poller;
pub mod watch;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::controller::{EventOutcome, ReconcileController};
    pub use crate::handler::{
        HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry, Operation,
        ResourceHandler,
    };
    pub use crate::lock::{
        DeploymentLockManager, LockOptions, LockType, LockedResourceDetails, WriteLockStatus,
    };
    pub use crate::poller::UnlockResourcePoller;
}

pub use claim::{ClaimOutcome, ReleaseOutcome, release_claim, try_claim, write_status};
pub use controller::{EventOutcome, ReconcileController};
pub use handler::{
    HandlerContext, HandlerError, HandlerFactory, HandlerOutcome, HandlerRegistry, Operation,
    ResourceHandler,
};
pub use lock::{
    DEPLOYMENT_LOCKS, DeploymentLockManager, LOCK_GROUP, LockInfo, LockOptions, LockState,
    LockType, LockedResourceDetails, WriteLockStatus, lock_key,
};
pub use metrics::CoordMetrics;
pub use poller::{PollerHandle, UnlockResourcePoller};
pub use watch::{WatchEventHandler, run_watch};
