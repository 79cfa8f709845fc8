//! Sequence executions and their state machine.
//!
//! A [`SequenceExecution`] is one run of a shipyard [`Sequence`] for a
//! project, stage, service and keptn context. It holds a snapshot of the
//! sequence, the tasks completed so far and the task currently in flight.
//!
//! ## State Machine
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              ▼                              │ next task
//! (new) ──► TRIGGERED ──started──► STARTED ───┤
//!              │  ▲                  │  ▲     │ last task / fail
//!         pause│  │resume       pause│  │resume
//!              ▼  │                  ▼  │     ▼
//!              PAUSED ◄──────────────┘  │   FINISHED
//!                 └─────────────────────┘
//!
//! any non-terminal ──abort──► ABORTED
//! any non-terminal ──timeout─► TIMEDOUT
//! ```
//!
//! ## Invariants
//!
//! - While triggered or started, exactly one current task exists and its
//!   index equals the number of previous tasks.
//! - `previous_tasks` and the current task's `events` only grow.
//! - Terminal states never change.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use shipyard_core::SequenceExecutionId;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventType, KeptnEvent, ResultType, StatusType};
use crate::scope::EventScope;
use crate::shipyard::{Sequence, Task};

/// Payload fields that describe the scope rather than the run's inputs.
const SCOPE_FIELDS: [&str; 3] = ["project", "stage", "service"];

/// Payload fields that describe a task outcome rather than its output.
const OUTCOME_FIELDS: [&str; 3] = ["result", "status", "message"];

/// State of a sequence execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    /// The current task was triggered and no executor has started it.
    Triggered,
    /// An executor started the current task.
    Started,
    /// Delivery of events is on hold.
    Paused,
    /// All tasks completed, or one failed.
    Finished,
    /// An external expiry check gave up on the run.
    TimedOut,
    /// The run was aborted.
    Aborted,
}

impl SequenceState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::TimedOut | Self::Aborted)
    }

    /// Returns true while the current task may still receive events.
    #[must_use]
    pub const fn accepts_task_events(&self) -> bool {
        matches!(self, Self::Triggered | Self::Started)
    }

    /// Returns true if the state machine allows `self -> target`.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Triggered => matches!(
                target,
                Self::Started | Self::Paused | Self::Finished | Self::TimedOut | Self::Aborted
            ),
            Self::Started => matches!(
                target,
                Self::Triggered | Self::Paused | Self::Finished | Self::TimedOut | Self::Aborted
            ),
            Self::Paused => matches!(
                target,
                Self::Triggered | Self::Started | Self::TimedOut | Self::Aborted
            ),
            Self::Finished | Self::TimedOut | Self::Aborted => false,
        }
    }

    /// Returns a lowercase label suitable for metrics, logs and storage.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::TimedOut => "timedout",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One started or finished report for the current task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Id of the reporting event.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Full event type.
    pub event_type: String,
    /// Executor that sent it.
    pub source: String,
    /// When it was produced.
    pub time: DateTime<Utc>,
    /// Reported result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
    /// Reported status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusType>,
    /// Payload minus scope fields.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

impl TaskEvent {
    /// Captures `event`, stamping `received_at` when it carries no time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the payload is malformed.
    pub fn from_event(event: &KeptnEvent, received_at: DateTime<Utc>) -> Result<Self> {
        let data = event.base_data()?;
        Ok(Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            time: event.time.unwrap_or(received_at),
            result: data.result,
            status: data.status,
            properties: strip_fields(&event.data, &SCOPE_FIELDS),
        })
    }

    fn kind(&self) -> Option<EventKind> {
        match EventType::parse(&self.event_type) {
            EventType::Task { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// A completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousTask {
    /// Task name.
    pub name: String,
    /// Id of the task's triggered event.
    #[serde(rename = "triggeredID")]
    pub triggered_id: String,
    /// Worst result reported.
    pub result: ResultType,
    /// Aggregated status.
    pub status: StatusType,
    /// Merged output of the finished reports.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

/// The task in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTask {
    /// Task name.
    pub name: String,
    /// Id of the task's triggered event.
    #[serde(rename = "triggeredID")]
    pub triggered_id: String,
    /// Started and finished reports, in arrival order.
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl CurrentTask {
    /// Creates a task with no reports.
    #[must_use]
    pub fn new(name: impl Into<String>, triggered_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggered_id: triggered_id.into(),
            events: Vec::new(),
        }
    }

    fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind() == Some(kind)).count()
    }

    fn finished_events(&self) -> impl Iterator<Item = &TaskEvent> {
        self.events
            .iter()
            .filter(|e| e.kind() == Some(EventKind::Finished))
    }

    /// Returns true if the event with `event_id` is already recorded.
    #[must_use]
    pub fn has_report(&self, event_id: &str) -> bool {
        !event_id.is_empty() && self.events.iter().any(|e| e.id == event_id)
    }

    /// Number of started reports.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.count(EventKind::Started)
    }

    /// Number of finished reports.
    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.count(EventKind::Finished)
    }

    /// True once every executor that started the task also finished it.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let finished = self.finished_count();
        finished > 0 && finished >= self.started_count()
    }

    /// Worst result over the finished reports; `pass` when none reported one.
    #[must_use]
    pub fn aggregate_result(&self) -> ResultType {
        self.finished_events()
            .filter_map(|e| e.result)
            .max()
            .unwrap_or(ResultType::Pass)
    }

    /// `errored` if any finished report errored, `succeeded` otherwise.
    #[must_use]
    pub fn aggregate_status(&self) -> StatusType {
        if self
            .finished_events()
            .any(|e| e.status == Some(StatusType::Errored))
        {
            StatusType::Errored
        } else {
            StatusType::Succeeded
        }
    }

    /// Output of the finished reports merged in arrival order, without
    /// outcome fields.
    #[must_use]
    pub fn merged_finished_properties(&self) -> Value {
        let mut merged = Map::new();
        for event in self.finished_events() {
            if let Value::Object(props) = strip_fields(&event.properties, &OUTCOME_FIELDS) {
                merged.extend(props);
            }
        }
        Value::Object(merged)
    }

    /// Converts the completed task into its history entry.
    #[must_use]
    pub fn complete(&self) -> PreviousTask {
        PreviousTask {
            name: self.name.clone(),
            triggered_id: self.triggered_id.clone(),
            result: self.aggregate_result(),
            status: self.aggregate_status(),
            properties: self.merged_finished_properties(),
        }
    }
}

/// Mutable part of a sequence execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceExecutionStatus {
    /// Current state.
    pub state: SequenceState,
    /// State to restore on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before_pause: Option<SequenceState>,
    /// Completed tasks, in completion order.
    #[serde(default)]
    pub previous_tasks: Vec<PreviousTask>,
    /// Task in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<CurrentTask>,
}

/// One run of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceExecution {
    /// Document id.
    pub id: SequenceExecutionId,
    /// Scope of the triggering event.
    pub scope: EventScope,
    /// Snapshot of the sequence definition.
    pub sequence: Sequence,
    /// Mutable status.
    pub status: SequenceExecutionStatus,
    /// Payload of the triggering event minus scope fields.
    pub input_properties: Value,
    /// When the sequence was triggered.
    pub triggered_at: DateTime<Utc>,
}

impl SequenceExecution {
    /// Creates an execution in state `triggered`.
    ///
    /// `first_task_triggered_id` is the id minted for the first task's
    /// triggered event; it is ignored for sequences without tasks.
    #[must_use]
    pub fn new(
        scope: EventScope,
        sequence: Sequence,
        input_properties: Value,
        triggered_at: DateTime<Utc>,
        first_task_triggered_id: impl Into<String>,
    ) -> Self {
        let current_task = sequence
            .task(0)
            .map(|task| CurrentTask::new(task.name.clone(), first_task_triggered_id));
        Self {
            id: SequenceExecutionId::generate(),
            scope,
            sequence,
            status: SequenceExecutionStatus {
                state: SequenceState::Triggered,
                state_before_pause: None,
                previous_tasks: Vec::new(),
                current_task,
            },
            input_properties,
            triggered_at,
        }
    }

    /// Index of the current task in the sequence.
    #[must_use]
    pub fn current_task_index(&self) -> usize {
        self.status.previous_tasks.len()
    }

    /// The task after the current one, if any.
    #[must_use]
    pub fn next_task(&self) -> Option<&Task> {
        self.sequence.task(self.current_task_index() + 1)
    }

    /// Worst result over completed tasks; `pass` for none.
    #[must_use]
    pub fn result(&self) -> ResultType {
        self.status
            .previous_tasks
            .iter()
            .map(|t| t.result)
            .max()
            .unwrap_or(ResultType::Pass)
    }

    /// `errored` if any completed task errored, `succeeded` otherwise.
    #[must_use]
    pub fn status_summary(&self) -> StatusType {
        if self
            .status
            .previous_tasks
            .iter()
            .any(|t| t.status == StatusType::Errored)
        {
            StatusType::Errored
        } else {
            StatusType::Succeeded
        }
    }

    /// Checks that `self.status.state -> target` is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] otherwise.
    pub fn check_transition(&self, target: SequenceState) -> Result<()> {
        let from = self.status.state;
        if from.can_transition_to(target) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: target.to_string(),
                reason: format!("sequence execution {}", self.id),
            })
        }
    }

    /// Input properties merged with the output of every completed task.
    #[must_use]
    pub fn accumulated_properties(&self) -> Map<String, Value> {
        let mut merged = match &self.input_properties {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for previous in &self.status.previous_tasks {
            if let Value::Object(props) = &previous.properties {
                merged.extend(props.clone());
            }
        }
        merged
    }

    /// Payload of the triggered event for `task`.
    ///
    /// Merges the input properties, the data of earlier finished reports and
    /// the task's own properties under its name.
    #[must_use]
    pub fn task_payload(&self, task: &Task) -> Value {
        let mut payload = self.accumulated_properties();
        if !task.properties.is_null() {
            payload.insert(task.name.clone(), task.properties.clone());
        }
        self.scoped(payload, &self.scope.stage)
    }

    /// Payload for an event of this run addressed to `stage`.
    #[must_use]
    pub fn scoped(&self, mut payload: Map<String, Value>, stage: &str) -> Value {
        payload.insert("project".into(), Value::String(self.scope.project.clone()));
        payload.insert("stage".into(), Value::String(stage.to_string()));
        payload.insert("service".into(), Value::String(self.scope.service.clone()));
        Value::Object(payload)
    }
}

/// Copies `value` without the named top-level fields.
#[must_use]
pub fn strip_fields(value: &Value, fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        Value::Null => Value::Null,
        other => other.clone(),
    }
}

/// Input properties of a sequence: the trigger's payload minus scope fields.
#[must_use]
pub fn input_properties(trigger: &KeptnEvent) -> Value {
    match strip_fields(&trigger.data, &SCOPE_FIELDS) {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}
