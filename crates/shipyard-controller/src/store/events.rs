//! Lifecycle event history per project.
//!
//! Every handled lifecycle event is stored in the collection for its kind
//! (`<project>-triggeredEvents`, `-startedEvents`, `-finishedEvents`). The
//! history is how a finished event is correlated with the triggered event
//! that caused it.

use super::{ConnectionManager, Filter};
use crate::error::{Error, Result};
use crate::event::{EventKind, EventType, KeptnEvent};

const KINDS: [EventKind; 3] = [EventKind::Triggered, EventKind::Started, EventKind::Finished];

/// Name of the collection holding `kind` events of `project`.
#[must_use]
pub fn collection(project: &str, kind: EventKind) -> String {
    format!("{project}-{kind}Events")
}

/// Query over one project's event history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Restrict to an event id.
    pub id: Option<String>,
    /// Restrict to an event type.
    pub event_type: Option<String>,
    /// Restrict to a run.
    pub keptn_context: Option<String>,
    /// Restrict to events caused by this event id.
    pub triggered_id: Option<String>,
}

impl EventQuery {
    fn filter(&self) -> Filter {
        let mut filter = Filter::all();
        if let Some(id) = &self.id {
            filter = filter.eq("id", id.as_str());
        }
        if let Some(event_type) = &self.event_type {
            filter = filter.eq("type", event_type.as_str());
        }
        if let Some(context) = &self.keptn_context {
            filter = filter.eq("shkeptncontext", context.as_str());
        }
        if let Some(triggered_id) = &self.triggered_id {
            filter = filter.eq("triggeredid", triggered_id.as_str());
        }
        filter
    }
}

/// Repository for the lifecycle event history.
#[derive(Debug, Clone)]
pub struct ProjectEventRepo {
    conn: ConnectionManager,
}

impl ProjectEventRepo {
    /// Creates a repository over `conn`.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Stores `event` in the collection for its kind. Redelivery overwrites.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] for types without a lifecycle kind, or a
    /// store error.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, id = %event.id))]
    pub async fn insert_event(&self, project: &str, event: &KeptnEvent) -> Result<()> {
        let kind = match event.parsed_type() {
            EventType::Task { kind, .. } | EventType::Sequence { kind, .. } => kind,
            EventType::Other(raw) => {
                return Err(Error::invalid_event(format!(
                    "'{raw}' is not a lifecycle event type"
                )));
            }
        };
        if project.trim().is_empty() {
            return Err(Error::invalid_scope("project must not be empty"));
        }
        let document = serde_json::to_value(event)?;
        let store = self.conn.store().await?;
        store
            .upsert(&collection(project, kind), &event.id, document)
            .await
    }

    /// Events of `kind` matching `query`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_events(
        &self,
        project: &str,
        kind: EventKind,
        query: &EventQuery,
    ) -> Result<Vec<KeptnEvent>> {
        let store = self.conn.store().await?;
        store
            .find(&collection(project, kind), &query.filter())
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    /// The triggered event `triggered_id` of run `keptn_context`, if stored.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_triggered_event(
        &self,
        project: &str,
        triggered_id: &str,
        keptn_context: &str,
    ) -> Result<Option<KeptnEvent>> {
        let query = EventQuery {
            id: Some(triggered_id.to_string()),
            keptn_context: Some(keptn_context.to_string()),
            ..EventQuery::default()
        };
        Ok(self
            .get_events(project, EventKind::Triggered, &query)
            .await?
            .into_iter()
            .next())
    }

    /// Drops the whole history of `project`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn delete_project_events(&self, project: &str) -> Result<()> {
        let store = self.conn.store().await?;
        for kind in KINDS {
            store.drop_collection(&collection(project, kind)).await?;
        }
        Ok(())
    }
}
