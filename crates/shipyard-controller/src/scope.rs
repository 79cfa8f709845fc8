//! Event scope: the join key between events, executions and queue items.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::KeptnEvent;

/// Where an event belongs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Project name.
    pub project: String,
    /// Stage name.
    #[serde(default)]
    pub stage: String,
    /// Service name.
    #[serde(default)]
    pub service: String,
    /// Run correlation id.
    pub keptn_context: String,
    /// Id of the causing event; for a sequence trigger, the trigger's own id.
    #[serde(default)]
    pub triggered_id: String,
    /// Event type that produced this scope.
    #[serde(default)]
    pub event_type: String,
    /// Git commit the run refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_id: Option<String>,
}

impl EventScope {
    /// Derives the scope of `event` from its envelope and payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the payload is malformed.
    pub fn from_event(event: &KeptnEvent) -> Result<Self> {
        let data = event.base_data()?;
        Ok(Self {
            project: data.project,
            stage: data.stage,
            service: data.service,
            keptn_context: event.keptn_context.clone(),
            triggered_id: event.triggered_id.clone(),
            event_type: event.event_type.clone(),
            git_commit_id: event.git_commit_id.clone(),
        })
    }

    /// Checks the fields every persisted record needs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidScope`] when project or context is empty.
    pub fn validate_for_write(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(Error::invalid_scope("project must not be empty"));
        }
        if self.keptn_context.trim().is_empty() {
            return Err(Error::invalid_scope("keptnContext must not be empty"));
        }
        Ok(())
    }
}
