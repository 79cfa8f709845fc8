//! Document store abstraction and the repositories built on it.
//!
//! The controller persists everything as JSON documents in named collections:
//!
//! | Collection | Contents |
//! |------------|----------|
//! | `<project>-sequenceExecution` | sequence executions |
//! | `<project>-triggeredEvents` | triggered lifecycle events |
//! | `<project>-startedEvents` | started lifecycle events |
//! | `<project>-finishedEvents` | finished lifecycle events |
//! | `sequenceQueue` | events deferred while paused |
//! | `sequencePauseState` | pause markers |
//! | `keptnProjectsMV` | the materialized project view |
//!
//! ## Design Principles
//!
//! - **Narrow writes**: appends and field updates never rewrite whole
//!   documents, so concurrent handlers cannot lose each other's updates.
//! - **Guards instead of locks**: every targeted write can carry a [`Filter`]
//!   the document must still match; a mismatch is a normal result, not an
//!   error.
//! - **Atomic batches**: control commands apply all their writes through
//!   [`DocumentStore::apply_batch`] or none of them.

pub mod connection;
pub mod events;
pub mod memory;
pub mod project;
pub mod queue;
pub mod sequence_execution;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use connection::ConnectionManager;
pub use events::ProjectEventRepo;
pub use memory::MemoryDocumentStore;
pub use project::ProjectRepo;
pub use queue::{EventQueueRepo, PauseState, QueueItem};
pub use sequence_execution::{SequenceExecutionRepo, UpsertOptions};

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The document was written.
    Applied,
    /// A document with that id, or matching the uniqueness filter, exists.
    AlreadyExists,
}

/// Outcome of a targeted update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    /// The update was applied; carries the document after the update.
    Updated(Value),
    /// No document with that id exists.
    NotFound,
    /// The document exists but no longer matches the guard.
    GuardMismatch,
}

impl UpdateResult {
    /// Returns true if the update was applied.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Outcome of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation was applied.
    Applied,
    /// Nothing was applied because operation `index` could not be.
    Rejected {
        /// Position of the failing operation.
        index: usize,
        /// Why it failed.
        reason: String,
    },
}

/// One condition on a dot-separated document path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value; a missing field equals `null`.
    Eq(String, Value),
    /// Field is less than or equal to the value (numbers or strings).
    Lte(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
}

/// Conjunction of conditions. The empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Filter matching every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(path.into(), value.into()));
        self
    }

    /// Adds a less-or-equal condition.
    #[must_use]
    pub fn lte(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lte(path.into(), value.into()));
        self
    }

    /// Adds a membership condition.
    #[must_use]
    pub fn is_in<V: Into<Value>>(
        mut self,
        path: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::In(
            path.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// The conditions of this filter.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns true if `doc` satisfies every condition.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(path, expected) => field(doc, path).unwrap_or(&Value::Null) == expected,
            Condition::Lte(path, bound) => {
                field(doc, path).is_some_and(|actual| less_or_equal(actual, bound))
            }
            Condition::In(path, options) => {
                let actual = field(doc, path).unwrap_or(&Value::Null);
                options.iter().any(|o| o == actual)
            }
        })
    }
}

/// Resolves a dot-separated path.
#[must_use]
pub fn field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn less_or_equal(actual: &Value, bound: &Value) -> bool {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        },
        (Value::String(a), Value::String(b)) => a <= b,
        _ => false,
    }
}

/// One write of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a new document; rejected if it exists or `unique` matches.
    Insert {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Document body.
        document: Value,
        /// Optional uniqueness filter.
        unique: Option<Filter>,
    },
    /// Insert or replace a document.
    Upsert {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Document body.
        document: Value,
    },
    /// Append to an array field; rejected if missing or the guard fails.
    Push {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Condition the document must match.
        guard: Filter,
        /// Dot-separated path of the array.
        path: String,
        /// Element to append.
        value: Value,
    },
    /// Set fields; rejected if missing or the guard fails.
    Set {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Condition the document must match.
        guard: Filter,
        /// Dot-separated paths and their new values.
        fields: Vec<(String, Value)>,
    },
    /// Delete a document if present.
    Delete {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Delete every matching document.
    DeleteMany {
        /// Target collection.
        collection: String,
        /// Documents to delete.
        filter: Filter,
    },
    /// Remove a collection and its documents.
    DropCollection {
        /// Target collection.
        collection: String,
    },
}

/// Storage abstraction for controller state.
///
/// ## Thread Safety
///
/// All methods take `&self` and may be called concurrently from many
/// handlers. Single-document operations are atomic.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Checks the connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] when the backend is not reachable.
    async fn ping(&self) -> Result<()>;

    /// (Re-)establishes the connection.
    async fn connect(&self) -> Result<()>;

    /// Reads one document.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Reads every matching document in insertion order.
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Inserts a new document unless the id exists or a document matches
    /// `unique`. The check and the write are one atomic step.
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        unique: Option<&Filter>,
    ) -> Result<WriteResult>;

    /// Inserts or replaces a document.
    async fn upsert(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Appends `value` to the array at `path` if the document matches `guard`.
    async fn push(
        &self,
        collection: &str,
        id: &str,
        guard: &Filter,
        path: &str,
        value: Value,
    ) -> Result<UpdateResult>;

    /// Sets the given fields if the document matches `guard`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        guard: &Filter,
        fields: Vec<(String, Value)>,
    ) -> Result<UpdateResult>;

    /// Deletes a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Deletes every matching document. Returns how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize>;

    /// Removes a collection.
    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Names of all non-empty collections.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Applies every operation or none.
    async fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<BatchOutcome>;
}
