//! In-memory document store for testing and single-process deployments.
//!
//! ## Limitations
//!
//! - **No durability**: all state is lost when the process exits
//! - **Single-process only**: state is not shared across processes
//!
//! Connectivity can be switched off with [`MemoryDocumentStore::set_available`]
//! to exercise reconnect handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BatchOutcome, DocumentStore, Filter, UpdateResult, WriteOp, WriteResult};
use crate::error::{Error, Result};

type Collection = Vec<(String, Value)>;
type Collections = HashMap<String, Collection>;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory document store.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    collections: RwLock<Collections>,
    available: AtomicBool,
    connected: AtomicBool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// Creates an empty, connected store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates the backend going away (`false`) or coming back (`true`).
    ///
    /// Going away also drops the current connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Drops the connection while leaving the backend reachable.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Number of documents in `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().map_err(poison_err)?;
        Ok(collections.get(collection).map_or(0, Vec::len))
    }

    fn check_connected(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable {
                message: "not connected".into(),
            })
        }
    }
}

fn find_index(collection: &Collection, id: &str) -> Option<usize> {
    collection.iter().position(|(doc_id, _)| doc_id == id)
}

/// Sets `value` at a dot-separated path, creating intermediate objects.
fn set_path(doc: &mut Value, path: &str, value: Value) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    let (parents, last) = path.rsplit_once('.').unwrap_or(("", path));
    let parent = descend(doc, parents, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(format!("'{path}' crosses a non-object field")),
    }
}

/// Appends to the array at a dot-separated path, creating it if missing.
fn push_path(doc: &mut Value, path: &str, value: Value) -> std::result::Result<(), String> {
    let target = descend(doc, path, path)?;
    let replace = match target {
        Value::Array(items) => {
            items.push(value);
            return Ok(());
        }
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if replace {
        *target = Value::Array(vec![value]);
        Ok(())
    } else {
        Err(format!("'{path}' is not an array"))
    }
}

/// Walks `segments` from `doc`, creating missing objects on the way.
fn descend<'a>(
    doc: &'a mut Value,
    segments: &str,
    path: &str,
) -> std::result::Result<&'a mut Value, String> {
    let mut current = doc;
    if segments.is_empty() {
        return Ok(current);
    }
    for segment in segments.split('.') {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return Err(format!("'{path}' crosses a non-object field")),
        };
    }
    Ok(current)
}

enum Targeted {
    Updated(Value),
    NotFound,
    GuardMismatch,
}

fn modify(
    collections: &mut Collections,
    collection: &str,
    id: &str,
    guard: &Filter,
    apply: impl FnOnce(&mut Value) -> std::result::Result<(), String>,
) -> std::result::Result<Targeted, String> {
    let Some(docs) = collections.get_mut(collection) else {
        return Ok(Targeted::NotFound);
    };
    let Some(index) = find_index(docs, id) else {
        return Ok(Targeted::NotFound);
    };
    let doc = &mut docs[index].1;
    if !guard.matches(doc) {
        return Ok(Targeted::GuardMismatch);
    }
    let mut updated = doc.clone();
    apply(&mut updated)?;
    *doc = updated.clone();
    Ok(Targeted::Updated(updated))
}

fn insert_into(
    collections: &mut Collections,
    collection: &str,
    id: &str,
    document: Value,
    unique: Option<&Filter>,
) -> WriteResult {
    let docs = collections.entry(collection.to_string()).or_default();
    let duplicate = find_index(docs, id).is_some()
        || unique.is_some_and(|filter| docs.iter().any(|(_, doc)| filter.matches(doc)));
    if duplicate {
        return WriteResult::AlreadyExists;
    }
    docs.push((id.to_string(), document));
    WriteResult::Applied
}

fn upsert_into(collections: &mut Collections, collection: &str, id: &str, document: Value) {
    let docs = collections.entry(collection.to_string()).or_default();
    match find_index(docs, id) {
        Some(index) => docs[index].1 = document,
        None => docs.push((id.to_string(), document)),
    }
}

fn delete_from(collections: &mut Collections, collection: &str, id: &str) -> bool {
    let Some(docs) = collections.get_mut(collection) else {
        return false;
    };
    let Some(index) = find_index(docs, id) else {
        return false;
    };
    docs.remove(index);
    if docs.is_empty() {
        collections.remove(collection);
    }
    true
}

fn delete_matching(collections: &mut Collections, collection: &str, filter: &Filter) -> usize {
    let Some(docs) = collections.get_mut(collection) else {
        return 0;
    };
    let before = docs.len();
    docs.retain(|(_, doc)| !filter.matches(doc));
    let removed = before - docs.len();
    if docs.is_empty() {
        collections.remove(collection);
    }
    removed
}

/// Applies one batch operation; `Err` carries the rejection reason.
fn apply_op(collections: &mut Collections, op: WriteOp) -> std::result::Result<(), String> {
    match op {
        WriteOp::Insert {
            collection,
            id,
            document,
            unique,
        } => match insert_into(collections, &collection, &id, document, unique.as_ref()) {
            WriteResult::Applied => Ok(()),
            WriteResult::AlreadyExists => Err(format!("{collection}/{id} already exists")),
        },
        WriteOp::Upsert {
            collection,
            id,
            document,
        } => {
            upsert_into(collections, &collection, &id, document);
            Ok(())
        }
        WriteOp::Push {
            collection,
            id,
            guard,
            path,
            value,
        } => targeted_outcome(
            &collection,
            &id,
            modify(collections, &collection, &id, &guard, |doc| {
                push_path(doc, &path, value)
            })?,
        ),
        WriteOp::Set {
            collection,
            id,
            guard,
            fields,
        } => targeted_outcome(
            &collection,
            &id,
            modify(collections, &collection, &id, &guard, |doc| {
                fields
                    .into_iter()
                    .try_for_each(|(path, value)| set_path(doc, &path, value))
            })?,
        ),
        WriteOp::Delete { collection, id } => {
            delete_from(collections, &collection, &id);
            Ok(())
        }
        WriteOp::DeleteMany { collection, filter } => {
            delete_matching(collections, &collection, &filter);
            Ok(())
        }
        WriteOp::DropCollection { collection } => {
            collections.remove(&collection);
            Ok(())
        }
    }
}

fn targeted_outcome(
    collection: &str,
    id: &str,
    outcome: Targeted,
) -> std::result::Result<(), String> {
    match outcome {
        Targeted::Updated(_) => Ok(()),
        Targeted::NotFound => Err(format!("{collection}/{id} not found")),
        Targeted::GuardMismatch => Err(format!("{collection}/{id} no longer matches guard")),
    }
}

fn into_update_result(outcome: Targeted) -> UpdateResult {
    match outcome {
        Targeted::Updated(doc) => UpdateResult::Updated(doc),
        Targeted::NotFound => UpdateResult::NotFound,
        Targeted::GuardMismatch => UpdateResult::GuardMismatch,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ping(&self) -> Result<()> {
        self.check_connected()
    }

    async fn connect(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Error::StoreUnavailable {
                message: "backend unreachable".into(),
            })
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check_connected()?;
        let collections = self.collections.read().map_err(poison_err)?;
        Ok(collections.get(collection).and_then(|docs| {
            find_index(docs, id).map(|index| docs[index].1.clone())
        }))
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        self.check_connected()?;
        let collections = self.collections.read().map_err(poison_err)?;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| filter.matches(doc))
                    .map(|(_, doc)| doc.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        unique: Option<&Filter>,
    ) -> Result<WriteResult> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        Ok(insert_into(&mut collections, collection, id, document, unique))
    }

    async fn upsert(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        upsert_into(&mut collections, collection, id, document);
        Ok(())
    }

    async fn push(
        &self,
        collection: &str,
        id: &str,
        guard: &Filter,
        path: &str,
        value: Value,
    ) -> Result<UpdateResult> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        modify(&mut collections, collection, id, guard, |doc| {
            push_path(doc, path, value)
        })
        .map(into_update_result)
        .map_err(Error::storage)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        guard: &Filter,
        fields: Vec<(String, Value)>,
    ) -> Result<UpdateResult> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        modify(&mut collections, collection, id, guard, |doc| {
            fields
                .into_iter()
                .try_for_each(|(path, value)| set_path(doc, &path, value))
        })
        .map(into_update_result)
        .map_err(Error::storage)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        Ok(delete_from(&mut collections, collection, id))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        Ok(delete_matching(&mut collections, collection, filter))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        collections.remove(collection);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.check_connected()?;
        let collections = self.collections.read().map_err(poison_err)?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<BatchOutcome> {
        self.check_connected()?;
        let mut collections = self.collections.write().map_err(poison_err)?;
        let mut staged = collections.clone();
        for (index, op) in ops.into_iter().enumerate() {
            if let Err(reason) = apply_op(&mut staged, op) {
                return Ok(BatchOutcome::Rejected { index, reason });
            }
        }
        *collections = staged;
        Ok(BatchOutcome::Applied)
    }
}
