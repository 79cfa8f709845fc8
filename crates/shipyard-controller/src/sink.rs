//! Publishing of outgoing events.
//!
//! The engine never talks to executors. It hands every event it produces to an
//! [`EventSink`]; the binary prints them, tests collect them in an
//! [`InMemoryOutbox`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::event::KeptnEvent;

/// Destination for outgoing events.
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Publishes one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be delivered.
    async fn publish(&self, event: &KeptnEvent) -> Result<()>;
}

/// Collects published events in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    events: Arc<Mutex<Vec<KeptnEvent>>>,
    refused: Arc<Mutex<Vec<String>>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publish order.
    #[must_use]
    pub fn events(&self) -> Vec<KeptnEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Types of everything published so far.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    /// Makes the next publish of `event_type` fail with a retryable error.
    pub fn fail_next(&self, event_type: impl Into<String>) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event_type.into());
    }

    /// Removes and returns everything published so far.
    pub fn drain(&self) -> Vec<KeptnEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl EventSink for InMemoryOutbox {
    async fn publish(&self, event: &KeptnEvent) -> Result<()> {
        {
            let mut refused = self
                .refused
                .lock()
                .map_err(|_| Error::storage("outbox poisoned"))?;
            if let Some(pos) = refused.iter().position(|t| *t == event.event_type) {
                refused.remove(pos);
                return Err(Error::storage(format!(
                    "outbox refused {}",
                    event.event_type
                )));
            }
        }
        self.events
            .lock()
            .map_err(|_| Error::storage("outbox poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Writes events as JSON lines.
pub struct JsonLinesSink<W> {
    writer: tokio::sync::Mutex<W>,
}

impl<W> JsonLinesSink<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

impl<W> std::fmt::Debug for JsonLinesSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W> EventSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn publish(&self, event: &KeptnEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::storage_with_source("failed to write event", e))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::storage_with_source("failed to flush event", e))
    }
}
