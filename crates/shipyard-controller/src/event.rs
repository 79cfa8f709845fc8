//! Lifecycle event envelope and payload types.
//!
//! Events follow CloudEvents 1.0 in JSON form with two correlation
//! extensions: `shkeptncontext` (the run id) and `triggeredid` (the event that
//! caused this one). Event types follow one of two grammars:
//!
//! - `sh.keptn.event.<task>.<kind>` for task events
//! - `sh.keptn.event.<stage>.<sequence>.<kind>` for sequence events
//!
//! where `<kind>` is `triggered`, `started` or `finished`.
//!
//! Payloads are decoded in two layers. [`EventData`] carries the fields every
//! event shares and is what scope-level logic works with; [`TaskEventData`]
//! adds task-specific variants for the few places that need more.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Prefix shared by all lifecycle event types.
pub const EVENT_TYPE_PREFIX: &str = "sh.keptn.event.";

/// CloudEvents spec version written on outgoing events.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of event payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Task name whose triggered events carry the artifact to deploy.
pub const DEPLOYMENT_TASK: &str = "deployment";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

/// A lifecycle event as received and emitted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeptnEvent {
    /// Unique event id.
    pub id: String,
    /// Dot-separated event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer of the event.
    pub source: String,
    /// CloudEvents spec version.
    #[serde(rename = "specversion", default = "default_spec_version")]
    pub spec_version: String,
    /// Time the event was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Content type of `data`.
    #[serde(rename = "datacontenttype", default = "default_content_type")]
    pub data_content_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Run correlation id.
    #[serde(
        rename = "shkeptncontext",
        alias = "keptncontext",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub keptn_context: String,
    /// Id of the event that caused this one.
    #[serde(rename = "triggeredid", default, skip_serializing_if = "String::is_empty")]
    pub triggered_id: String,
    /// Git commit the run refers to.
    #[serde(rename = "gitcommitid", default, skip_serializing_if = "Option::is_none")]
    pub git_commit_id: Option<String>,
}

impl KeptnEvent {
    /// Creates an event without correlation ids.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            spec_version: default_spec_version(),
            time: None,
            data_content_type: default_content_type(),
            data,
            keptn_context: String::new(),
            triggered_id: String::new(),
            git_commit_id: None,
        }
    }

    /// Sets the run correlation id.
    #[must_use]
    pub fn with_context(mut self, keptn_context: impl Into<String>) -> Self {
        self.keptn_context = keptn_context.into();
        self
    }

    /// Sets the causing event id.
    #[must_use]
    pub fn with_triggered_id(mut self, triggered_id: impl Into<String>) -> Self {
        self.triggered_id = triggered_id.into();
        self
    }

    /// Sets the event time.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the git commit id.
    #[must_use]
    pub fn with_git_commit_id(mut self, git_commit_id: Option<String>) -> Self {
        self.git_commit_id = git_commit_id;
        self
    }

    /// Parses the event type.
    #[must_use]
    pub fn parsed_type(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    /// Decodes the payload into `T`. A missing payload decodes as `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the payload does not match `T`.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = if self.data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.data.clone()
        };
        serde_json::from_value(data).map_err(|e| {
            Error::invalid_event(format!(
                "payload of {} event {} is malformed: {e}",
                self.event_type, self.id
            ))
        })
    }

    /// Decodes the fields every payload shares.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the payload is malformed.
    pub fn base_data(&self) -> Result<EventData> {
        self.decode_data()
    }
}

/// Phase of a task or sequence reported by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Work was requested.
    Triggered,
    /// Work was picked up.
    Started,
    /// Work completed.
    Finished,
}

impl EventKind {
    /// Suffix used in event types.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Started => "started",
            Self::Finished => "finished",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(Self::Triggered),
            "started" => Some(Self::Started),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// `sh.keptn.event.<task>.<kind>`
    Task {
        /// Task name.
        task: String,
        /// Phase.
        kind: EventKind,
    },
    /// `sh.keptn.event.<stage>.<sequence>.<kind>`
    Sequence {
        /// Stage name.
        stage: String,
        /// Sequence name.
        sequence: String,
        /// Phase.
        kind: EventKind,
    },
    /// Anything else; not handled by the engine.
    Other(String),
}

impl EventType {
    /// Parses an event type string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let Some(rest) = raw.strip_prefix(EVENT_TYPE_PREFIX) else {
            return Self::Other(raw.to_string());
        };
        let segments: Vec<&str> = rest.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Self::Other(raw.to_string());
        }
        let Some(kind) = segments.last().and_then(|s| EventKind::parse(s)) else {
            return Self::Other(raw.to_string());
        };
        match segments.as_slice() {
            [task, _] => Self::Task {
                task: (*task).to_string(),
                kind,
            },
            [stage, sequence, _] => Self::Sequence {
                stage: (*stage).to_string(),
                sequence: (*sequence).to_string(),
                kind,
            },
            _ => Self::Other(raw.to_string()),
        }
    }
}

/// Builds `sh.keptn.event.<task>.<kind>`.
#[must_use]
pub fn task_event_type(task: &str, kind: EventKind) -> String {
    format!("{EVENT_TYPE_PREFIX}{task}.{kind}")
}

/// Builds `sh.keptn.event.<stage>.<sequence>.<kind>`.
#[must_use]
pub fn sequence_event_type(stage: &str, sequence: &str, kind: EventKind) -> String {
    format!("{EVENT_TYPE_PREFIX}{stage}.{sequence}.{kind}")
}

/// Outcome reported by a finished task, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// The task passed.
    Pass,
    /// The task passed with warnings.
    Warning,
    /// The task failed.
    Fail,
}

impl ResultType {
    /// Wire name of the result.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warning => "warning",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status reported by a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    /// The executor ran to completion.
    Succeeded,
    /// The executor failed to run.
    Errored,
    /// Status could not be determined.
    Unknown,
    /// The run was aborted.
    Aborted,
}

impl StatusType {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload fields shared by every lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    /// Project name.
    #[serde(default)]
    pub project: String,
    /// Stage name.
    #[serde(default)]
    pub stage: String,
    /// Service name.
    #[serde(default)]
    pub service: String,
    /// Task result, on finished events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
    /// Task status, on finished events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusType>,
    /// Free-form message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// User labels carried through the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Configuration change requested by a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    /// Values to apply, usually containing `image`.
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,
}

/// Payload of `sh.keptn.event.deployment.triggered`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTriggeredData {
    /// Shared fields.
    #[serde(flatten)]
    pub base: EventData,
    /// Requested configuration change.
    #[serde(default)]
    pub configuration_change: ConfigurationChange,
}

impl DeploymentTriggeredData {
    /// The artifact to deploy, if present.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.configuration_change
            .values
            .get("image")
            .and_then(Value::as_str)
    }
}

/// Payload decoded according to the task the event belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEventData {
    /// A deployment request.
    Deployment(DeploymentTriggeredData),
    /// Any other payload.
    Generic(EventData),
}

impl TaskEventData {
    /// Decodes `event` into the variant its type calls for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the payload is malformed.
    pub fn decode(event: &KeptnEvent) -> Result<Self> {
        match event.parsed_type() {
            EventType::Task {
                task,
                kind: EventKind::Triggered,
            } if task == DEPLOYMENT_TASK => Ok(Self::Deployment(event.decode_data()?)),
            _ => Ok(Self::Generic(event.decode_data()?)),
        }
    }

    /// The shared payload fields.
    #[must_use]
    pub fn base(&self) -> &EventData {
        match self {
            Self::Deployment(data) => &data.base,
            Self::Generic(data) => data,
        }
    }
}
