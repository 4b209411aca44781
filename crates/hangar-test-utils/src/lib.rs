//! Shared test utilities for Hangar integration tests.
//!
//! This crate provides:
//! - [`RecordingStore`]: memory store with operation recording and fault injection
//! - [`RecordingHandler`]: resource handler that counts invocations
//! - [`TestContext`] and factory functions for resources and lock options
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use hangar_test_utils::{TestContext, assert_unclaimed, director_key};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     ctx.seed_director("r1", "in_queue").await;
//!     // ... run controller ...
//!     assert_unclaimed(&ctx.get(&director_key("r1")).await);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod handler;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use handler::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hangar_coord=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
