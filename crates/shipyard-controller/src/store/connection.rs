//! Store connection lifecycle.
//!
//! The [`ConnectionManager`] owns the shared [`DocumentStore`] handle and is
//! passed to every repository. Repositories call
//! [`ConnectionManager::store`] at the top of each operation, which pings the
//! backend and transparently reconnects if the connection was lost.
//!
//! Reconnection retries with exponential backoff and gives up once the
//! configured deadline passes, so operations fail with
//! [`Error::StoreUnavailable`] instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::store::DocumentStore;

/// Maximum backoff between reconnect attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Shared handle to the document store.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    store: Arc<dyn DocumentStore>,
    reconnect_timeout: Duration,
    backoff_base: Duration,
}

impl ConnectionManager {
    /// Creates a manager with explicit reconnect settings.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        reconnect_timeout: Duration,
        backoff_base: Duration,
    ) -> Self {
        Self {
            store,
            reconnect_timeout,
            backoff_base,
        }
    }

    /// Creates a manager using the reconnect settings of `config`.
    #[must_use]
    pub fn from_config(store: Arc<dyn DocumentStore>, config: &ControllerConfig) -> Self {
        Self::new(
            store,
            config.store_reconnect_timeout,
            config.store_reconnect_backoff,
        )
    }

    /// Returns the store once the connection is verified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the connection cannot be
    /// re-established within the reconnect deadline.
    pub async fn store(&self) -> Result<&dyn DocumentStore> {
        self.ensure_connected().await?;
        Ok(self.store.as_ref())
    }

    /// Pings the store and reconnects if needed.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::store`].
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.store.ping().await.is_ok() {
            return Ok(());
        }
        tracing::warn!(
            timeout = ?self.reconnect_timeout,
            "store connection lost, reconnecting"
        );

        match tokio::time::timeout(self.reconnect_timeout, self.reconnect()).await {
            Ok(()) => {
                tracing::info!("store connection re-established");
                Ok(())
            }
            Err(_) => Err(Error::StoreUnavailable {
                message: format!(
                    "could not reconnect within {}ms",
                    self.reconnect_timeout.as_millis()
                ),
            }),
        }
    }

    async fn reconnect(&self) {
        let mut backoff = self.backoff_base;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.connect().await {
                Ok(()) if self.store.ping().await.is_ok() => return,
                Ok(()) => tracing::debug!(attempt, "reconnected but ping failed"),
                Err(e) => tracing::debug!(attempt, error = %e, "reconnect attempt failed"),
            }
            tokio::time::sleep(backoff.min(BACKOFF_MAX)).await;
            backoff = backoff.saturating_mul(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    fn manager(store: &Arc<MemoryDocumentStore>, timeout_ms: u64) -> ConnectionManager {
        ConnectionManager::new(
            Arc::clone(store) as Arc<dyn DocumentStore>,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn reconnects_after_dropped_connection() {
        let store = Arc::new(MemoryDocumentStore::new());
        let conn = manager(&store, 500);

        store.disconnect();
        conn.ensure_connected().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_backend_fails_within_deadline() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_available(false);
        let conn = manager(&store, 50);

        let started = std::time::Instant::now();
        let err = conn.store().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn recovers_when_backend_returns() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_available(false);
        let conn = manager(&store, 2_000);

        let revive = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            revive.set_available(true);
        });

        conn.ensure_connected().await.unwrap();
    }
}
