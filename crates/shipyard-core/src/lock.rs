//! Keyed mutual exclusion for read-modify-write sections.
//!
//! Handlers for different events run concurrently. Whenever one of them reads a
//! shared document, changes it, and writes it back, it must hold the lock for
//! that document's key for the whole section. Keys are either a project name or
//! `project.stage.service`, so unrelated projects never contend.
//!
//! The [`LockProvider`] trait is the seam components depend on; the
//! [`KeyedLockTable`] implementation keeps one async mutex per key, created
//! lazily and dropped again once nobody holds or waits for it. The table itself
//! is an ordinary value handed to components, never a process-wide singleton.
//!
//! # Example
//!
//! ```rust
//! use shipyard_core::lock::{KeyedLockTable, LockKey, LockProvider};
//!
//! # async fn example() -> shipyard_core::Result<()> {
//! let locks = KeyedLockTable::new();
//! let guard = locks.lock(&LockKey::project("sockshop")).await?;
//! // ... read, modify and write the project document ...
//! guard.unlock();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Name of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Key guarding a whole project document.
    #[must_use]
    pub fn project(project: &str) -> Self {
        Self(project.to_string())
    }

    /// Key guarding a single service of a project stage.
    #[must_use]
    pub fn service(project: &str, stage: &str, service: &str) -> Self {
        Self(format!("{project}.{stage}.{service}"))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof that a key is locked. Dropping the guard unlocks the key.
pub struct LockGuard {
    key: LockKey,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Creates a guard that runs `release` exactly once when unlocked.
    #[must_use]
    pub fn new(key: LockKey, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            release: Some(Box::new(release)),
        }
    }

    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Releases the lock.
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Acquires named locks.
#[async_trait]
pub trait LockProvider: Send + Sync + fmt::Debug {
    /// Waits until `key` is free and locks it.
    async fn lock(&self, key: &LockKey) -> Result<LockGuard>;
}

#[derive(Debug, Default)]
struct LockTable {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn entry(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("lock table poisoned"))?;
        Ok(Arc::clone(entries.entry(key.to_string()).or_default()))
    }

    /// Drops the entry for `key` when the table holds the only reference.
    fn prune(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            entries.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// In-process lock table keyed by name.
///
/// The map of keys is guarded by one coarse mutex that is only held while an
/// entry is looked up or pruned; waiting for a key happens on that key's own
/// async mutex.
#[derive(Debug, Clone, Default)]
pub struct KeyedLockTable {
    table: Arc<LockTable>,
    acquire_timeout: Option<Duration>,
}

impl KeyedLockTable {
    /// Creates an empty lock table that waits indefinitely.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lock table that gives up after `timeout`.
    #[must_use]
    pub fn with_acquire_timeout(timeout: Duration) -> Self {
        Self {
            table: Arc::default(),
            acquire_timeout: Some(timeout),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl LockProvider for KeyedLockTable {
    async fn lock(&self, key: &LockKey) -> Result<LockGuard> {
        let mutex = self.table.entry(key.as_str())?;

        let guard = match self.acquire_timeout {
            Some(timeout) => {
                if let Ok(guard) = tokio::time::timeout(timeout, mutex.lock_owned()).await {
                    guard
                } else {
                    self.table.prune(key.as_str());
                    return Err(Error::LockUnavailable {
                        key: key.to_string(),
                        message: format!("not acquired within {timeout:?}"),
                    });
                }
            }
            None => mutex.lock_owned().await,
        };
        tracing::trace!(key = %key, "lock acquired");

        let table = Arc::clone(&self.table);
        let name = key.as_str().to_string();
        Ok(LockGuard::new(key.clone(), move || {
            drop(guard);
            table.prune(&name);
            tracing::trace!(key = %name, "lock released");
        }))
    }
}
