//! Shared test utilities for shipyard integration tests.
//!
//! This crate provides:
//! - [`TestHarness`]: A controller wired to in-memory collaborators
//! - [`EventFactory`]: Builders for incoming lifecycle events
//! - Shipyard fixtures such as [`DELIVERY_SHIPYARD`]
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use shipyard_test_utils::{TestHarness, assert_state};
//!
//! #[tokio::test]
//! async fn delivery_starts() {
//!     let harness = TestHarness::new().await;
//!     let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-1");
//!     harness.send(trigger).await;
//!     // ... assert on harness.outbox ...
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
pub mod harness;

pub use assertions::*;
pub use fixtures::*;
pub use harness::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("shipyard_controller=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
