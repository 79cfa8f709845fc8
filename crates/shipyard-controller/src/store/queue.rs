//! Deferred events and pause markers.
//!
//! While a run (or one stage of it) is paused, the dispatcher parks incoming
//! events in `sequenceQueue` as [`QueueItem`]s. Pause markers live in
//! `sequencePauseState`; a marker with an empty stage covers the whole run.
//!
//! Control commands do not write here directly. They collect the
//! [`WriteOp`]s from [`EventQueueRepo::pause_op`],
//! [`EventQueueRepo::resume_ops`] and [`EventQueueRepo::purge_ops`] and apply
//! them in one batch together with the execution status updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionManager, Filter, WriteOp, WriteResult};
use crate::error::{Error, Result};
use crate::event::KeptnEvent;
use crate::scope::EventScope;
use crate::sequence::SequenceState;

/// Collection holding deferred events.
pub const QUEUE_COLLECTION: &str = "sequenceQueue";

/// Collection holding pause markers.
pub const PAUSE_COLLECTION: &str = "sequencePauseState";

/// An event parked while its run or stage is paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Scope of the parked event.
    pub scope: EventScope,
    /// Id of the parked event; unique within the queue.
    pub event_id: String,
    /// When the event becomes eligible for delivery.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// The parked envelope.
    pub event: KeptnEvent,
}

impl QueueItem {
    /// Parks `event` under `scope`, eligible from `timestamp` on.
    #[must_use]
    pub fn new(scope: EventScope, event: KeptnEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            scope,
            event_id: event.id.clone(),
            timestamp,
            event,
        }
    }
}

/// Pause marker for a run, or for one stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseState {
    /// Run the marker applies to.
    pub keptn_context: String,
    /// Stage the marker applies to; empty for the whole run.
    #[serde(default)]
    pub stage: String,
    /// `paused` or `started`.
    pub state: SequenceState,
}

impl PauseState {
    fn document_id(keptn_context: &str, stage: &str) -> String {
        format!("{keptn_context}:{stage}")
    }

    /// Returns true if this marker holds back events of `stage`.
    #[must_use]
    pub fn blocks(&self, stage: &str) -> bool {
        self.state == SequenceState::Paused && (self.stage.is_empty() || self.stage == stage)
    }
}

/// Repository for the event queue and pause markers.
#[derive(Debug, Clone)]
pub struct EventQueueRepo {
    conn: ConnectionManager,
}

impl EventQueueRepo {
    /// Creates a repository over `conn`.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Parks an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the event id is already queued.
    #[tracing::instrument(skip(self, item), fields(event_id = %item.event_id))]
    pub async fn queue_event(&self, item: &QueueItem) -> Result<()> {
        item.scope.validate_for_write()?;
        let document = serde_json::to_value(item)?;
        let store = self.conn.store().await?;
        match store
            .insert(QUEUE_COLLECTION, &item.event_id, document, None)
            .await?
        {
            WriteResult::Applied => Ok(()),
            WriteResult::AlreadyExists => {
                Err(Error::already_exists("queue item", item.event_id.clone()))
            }
        }
    }

    /// Items eligible at `now`, by timestamp then insertion order.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_queued_before(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let store = self.conn.store().await?;
        let filter = Filter::all().lte("timestamp", now.timestamp_millis());
        let mut items = store
            .find(QUEUE_COLLECTION, &filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value::<QueueItem>(doc).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|item| item.timestamp);
        Ok(items)
    }

    /// Removes a delivered item. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn delete_queued(&self, event_id: &str) -> Result<bool> {
        let store = self.conn.store().await?;
        store.delete(QUEUE_COLLECTION, event_id).await
    }

    /// Returns true if events of `stage` in run `keptn_context` are held back.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn is_paused(&self, keptn_context: &str, stage: &str) -> Result<bool> {
        Ok(self
            .pause_markers(keptn_context)
            .await?
            .iter()
            .any(|marker| marker.blocks(stage)))
    }

    /// All pause markers of a run.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn pause_markers(&self, keptn_context: &str) -> Result<Vec<PauseState>> {
        let store = self.conn.store().await?;
        let filter = Filter::all().eq("keptnContext", keptn_context);
        store
            .find(PAUSE_COLLECTION, &filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    /// Write that pauses a run, or one stage of it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the marker cannot be encoded.
    pub fn pause_op(keptn_context: &str, stage: Option<&str>) -> Result<WriteOp> {
        let stage = stage.unwrap_or_default();
        let marker = PauseState {
            keptn_context: keptn_context.to_string(),
            stage: stage.to_string(),
            state: SequenceState::Paused,
        };
        Ok(WriteOp::Upsert {
            collection: PAUSE_COLLECTION.to_string(),
            id: PauseState::document_id(keptn_context, stage),
            document: serde_json::to_value(marker)?,
        })
    }

    /// Writes that lift a pause.
    ///
    /// Without a stage every marker of the run is removed; with one, only
    /// that stage's marker.
    #[must_use]
    pub fn resume_ops(keptn_context: &str, stage: Option<&str>) -> Vec<WriteOp> {
        vec![WriteOp::DeleteMany {
            collection: PAUSE_COLLECTION.to_string(),
            filter: marker_filter(keptn_context, stage),
        }]
    }

    /// Writes that drop the pause markers and parked events of a run, or of
    /// one stage of it.
    #[must_use]
    pub fn purge_ops(keptn_context: &str, stage: Option<&str>) -> Vec<WriteOp> {
        let mut queued = Filter::all().eq("scope.keptnContext", keptn_context);
        if let Some(stage) = stage {
            queued = queued.eq("scope.stage", stage);
        }
        vec![
            WriteOp::DeleteMany {
                collection: PAUSE_COLLECTION.to_string(),
                filter: marker_filter(keptn_context, stage),
            },
            WriteOp::DeleteMany {
                collection: QUEUE_COLLECTION.to_string(),
                filter: queued,
            },
        ]
    }

    /// Writes that drop every parked event of `project` and the pause markers
    /// of `contexts`.
    #[must_use]
    pub fn purge_project_ops<'a>(
        project: &str,
        contexts: impl IntoIterator<Item = &'a str>,
    ) -> Vec<WriteOp> {
        let mut ops = vec![WriteOp::DeleteMany {
            collection: QUEUE_COLLECTION.to_string(),
            filter: Filter::all().eq("scope.project", project),
        }];
        ops.extend(contexts.into_iter().map(|context| WriteOp::DeleteMany {
            collection: PAUSE_COLLECTION.to_string(),
            filter: Filter::all().eq("keptnContext", context),
        }));
        ops
    }
}

fn marker_filter(keptn_context: &str, stage: Option<&str>) -> Filter {
    let filter = Filter::all().eq("keptnContext", keptn_context);
    match stage {
        Some(stage) => filter.eq("stage", stage),
        None => filter,
    }
}
