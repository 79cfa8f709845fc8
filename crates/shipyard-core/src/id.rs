//! Identifiers and id sources.
//!
//! Two kinds of identifiers exist in shipyard:
//!
//! - **Sequence execution IDs**: internal document identifiers. These are ULIDs,
//!   so they sort by creation time and need no coordination.
//! - **Correlation and event IDs**: the `shkeptncontext` of a run and the `id` of
//!   every outgoing event. These are minted through an injected [`IdSource`]
//!   (UUID v4 in production) so tests can make them deterministic.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a sequence execution document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceExecutionId(Ulid);

impl SequenceExecutionId {
    /// Generates a new unique sequence execution ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for SequenceExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SequenceExecutionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid sequence execution ID '{s}': {e}"),
            })
    }
}

/// Mints correlation ids and outgoing event ids.
pub trait IdSource: Send + Sync + fmt::Debug {
    /// Returns a fresh, globally unique id.
    fn mint(&self) -> String;
}

/// Id source producing random UUID v4 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn mint(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Id source producing `{prefix}-{n}` with a monotonically increasing counter.
#[derive(Debug)]
pub struct SequentialIdSource {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdSource {
    /// Creates a source whose first id is `{prefix}-1`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdSource for SequentialIdSource {
    fn mint(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
