//! # shipyard-core
//!
//! Core abstractions shared by the shipyard delivery orchestrator.
//!
//! This crate provides the primitives every other shipyard component builds on:
//!
//! - **Keyed Locks**: Injectable per-key mutual exclusion for read-modify-write sections
//! - **Identifiers**: Strongly-typed sequence execution IDs and correlation-id sources
//! - **Clocks**: A wall-clock abstraction that tests can drive manually
//! - **Storage Keys**: Lossless escaping for map keys derived from event types
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use shipyard_core::prelude::*;
//!
//! let key = LockKey::project("sockshop");
//! assert_eq!(key.as_str(), "sockshop");
//!
//! let encoded = encode_key("sh.keptn.event.deployment.finished");
//! assert_eq!(decode_key(&encoded), "sh.keptn.event.deployment.finished");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod escape;
pub mod id;
pub mod lock;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::escape::{decode_key, encode_key};
    pub use crate::id::{IdSource, SequenceExecutionId, SequentialIdSource, UuidIdSource};
    pub use crate::lock::{KeyedLockTable, LockGuard, LockKey, LockProvider};
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use escape::{decode_key, encode_key};
pub use id::{IdSource, SequenceExecutionId, SequentialIdSource, UuidIdSource};
pub use lock::{KeyedLockTable, LockGuard, LockKey, LockProvider};
pub use observability::{LogFormat, init_logging};
