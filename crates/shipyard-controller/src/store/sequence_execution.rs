//! Sequence execution repository.
//!
//! Executions live in `<project>-sequenceExecution`. Documents are versioned:
//!
//! | `schemaVersion` | Property encoding |
//! |-----------------|-------------------|
//! | absent or `1` | raw JSON objects |
//! | `2` | JSON-encoded strings |
//!
//! Version 2 keeps arbitrary user keys (which may contain `.`) out of the
//! document structure. Reads inspect the version first and decode with the
//! matching record type; writes always produce version 2. Targeted writes
//! against a legacy document migrate it in place first.
//!
//! ## Concurrency
//!
//! - [`SequenceExecutionRepo::append_task_event`] is an atomic array append
//!   guarded by the current task's triggered id, so racing executors never
//!   lose each other's reports.
//! - [`SequenceExecutionRepo::update_status`] touches only
//!   `status.state` and `status.stateBeforePause`.
//! - [`SequenceExecutionRepo::advance_task`] is a compare-and-set on the
//!   current task's triggered id, so a task is completed at most once.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use shipyard_core::SequenceExecutionId;

use super::{BatchOutcome, ConnectionManager, Filter, UpdateResult, WriteOp, WriteResult};
use crate::error::{Error, Result};
use crate::event::{ResultType, StatusType};
use crate::scope::EventScope;
use crate::sequence::{
    CurrentTask, PreviousTask, SequenceExecution, SequenceExecutionStatus, SequenceState,
    TaskEvent,
};
use crate::shipyard::Sequence;

/// Schema version written by this release.
pub const CURRENT_SCHEMA_VERSION: u64 = 2;

const SCHEMA_VERSION: &str = "schemaVersion";
const STATE: &str = "status.state";
const STATE_BEFORE_PAUSE: &str = "status.stateBeforePause";
const CURRENT_TASK: &str = "status.currentTask";
const CURRENT_TRIGGERED_ID: &str = "status.currentTask.triggeredID";
const CURRENT_EVENTS: &str = "status.currentTask.events";
const PREVIOUS_TASKS: &str = "status.previousTasks";
const SCOPE_TRIGGERED_ID: &str = "scope.triggeredId";

const COLLECTION_SUFFIX: &str = "-sequenceExecution";

/// Name of the execution collection of `project`.
#[must_use]
pub fn collection(project: &str) -> String {
    format!("{project}{COLLECTION_SUFFIX}")
}

/// Options for [`SequenceExecutionRepo::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Reject the write if an execution with the same scope triggered id exists.
    pub check_unique_triggered_id: bool,
}

/// Query over the executions of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionQuery {
    /// Project whose collection is searched.
    pub project: String,
    /// Restrict to a stage.
    pub stage: Option<String>,
    /// Restrict to a service.
    pub service: Option<String>,
    /// Restrict to a run.
    pub keptn_context: Option<String>,
    /// Restrict to a sequence name.
    pub name: Option<String>,
    /// Restrict to states.
    pub states: Vec<SequenceState>,
}

impl ExecutionQuery {
    /// Query for every execution of `project`.
    #[must_use]
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    /// Restricts to `keptn_context`.
    #[must_use]
    pub fn context(mut self, keptn_context: impl Into<String>) -> Self {
        self.keptn_context = Some(keptn_context.into());
        self
    }

    /// Restricts to `stage` when given.
    #[must_use]
    pub fn stage(mut self, stage: Option<&str>) -> Self {
        self.stage = stage.map(str::to_string);
        self
    }

    /// Restricts to the given states.
    #[must_use]
    pub fn states(mut self, states: &[SequenceState]) -> Self {
        self.states = states.to_vec();
        self
    }

    fn filter(&self) -> Filter {
        let mut filter = Filter::all();
        if let Some(stage) = &self.stage {
            filter = filter.eq("scope.stage", stage.as_str());
        }
        if let Some(service) = &self.service {
            filter = filter.eq("scope.service", service.as_str());
        }
        if let Some(context) = &self.keptn_context {
            filter = filter.eq("scope.keptnContext", context.as_str());
        }
        if let Some(name) = &self.name {
            filter = filter.eq("sequence.name", name.as_str());
        }
        if !self.states.is_empty() {
            filter = filter.is_in(STATE, self.states.iter().map(SequenceState::as_label));
        }
        filter
    }
}

/// Repository for sequence executions.
#[derive(Debug, Clone)]
pub struct SequenceExecutionRepo {
    conn: ConnectionManager,
}

impl SequenceExecutionRepo {
    /// Creates a repository over `conn`.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Reads the executions matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidScope`] for an empty project, or a store error.
    #[tracing::instrument(skip(self), fields(project = %query.project))]
    pub async fn get(&self, query: &ExecutionQuery) -> Result<Vec<SequenceExecution>> {
        require_project(&query.project)?;
        let store = self.conn.store().await?;
        store
            .find(&collection(&query.project), &query.filter())
            .await?
            .into_iter()
            .map(decode_execution)
            .collect()
    }

    /// Executions of run `keptn_context` in any project.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_by_context(
        &self,
        keptn_context: &str,
        stage: Option<&str>,
        states: &[SequenceState],
    ) -> Result<Vec<SequenceExecution>> {
        let collections = self.conn.store().await?.list_collections().await?;
        let mut found = Vec::new();
        for name in collections {
            let Some(project) = name.strip_suffix(COLLECTION_SUFFIX) else {
                continue;
            };
            let query = ExecutionQuery::project(project)
                .context(keptn_context)
                .stage(stage)
                .states(states);
            found.extend(self.get(&query).await?);
        }
        Ok(found)
    }

    /// Reads one execution by id.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_by_id(
        &self,
        project: &str,
        id: &SequenceExecutionId,
    ) -> Result<Option<SequenceExecution>> {
        require_project(project)?;
        let store = self.conn.store().await?;
        store
            .get(&collection(project), &id.to_string())
            .await?
            .map(decode_execution)
            .transpose()
    }

    /// Finds the execution whose current task was triggered by `triggered_id`.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_by_triggered_id(
        &self,
        project: &str,
        triggered_id: &str,
    ) -> Result<Option<SequenceExecution>> {
        require_project(project)?;
        let store = self.conn.store().await?;
        let filter = Filter::all().eq(CURRENT_TRIGGERED_ID, triggered_id);
        store
            .find(&collection(project), &filter)
            .await?
            .into_iter()
            .next()
            .map(decode_execution)
            .transpose()
    }

    /// Stores an execution.
    ///
    /// With `check_unique_triggered_id`, the write is an atomic
    /// insert-if-absent keyed on the scope's triggered id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] for a duplicate trigger,
    /// [`Error::InvalidScope`] for an incomplete scope, or a store error.
    #[tracing::instrument(
        skip(self, execution),
        fields(project = %execution.scope.project, id = %execution.id)
    )]
    pub async fn upsert(&self, execution: &SequenceExecution, options: UpsertOptions) -> Result<()> {
        execution.scope.validate_for_write()?;
        let document = encode_execution(execution)?;
        let name = collection(&execution.scope.project);
        let id = execution.id.to_string();
        let store = self.conn.store().await?;

        if !options.check_unique_triggered_id {
            return store.upsert(&name, &id, document).await;
        }

        let unique = Filter::all().eq(SCOPE_TRIGGERED_ID, execution.scope.triggered_id.as_str());
        match store.insert(&name, &id, document, Some(&unique)).await? {
            WriteResult::Applied => Ok(()),
            WriteResult::AlreadyExists => Err(Error::already_exists(
                "sequence execution",
                execution.scope.triggered_id.clone(),
            )),
        }
    }

    /// Appends a report to the current task.
    ///
    /// Returns the execution after the append, or `None` when the execution
    /// no longer has that current task or is not accepting events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the execution does not exist.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn append_task_event(
        &self,
        project: &str,
        id: &SequenceExecutionId,
        triggered_id: &str,
        event: &TaskEvent,
    ) -> Result<Option<SequenceExecution>> {
        require_project(project)?;
        let value = serde_json::to_value(TaskEventRecord::<EncodedJson>::from_domain(event)?)?;
        let guard = current_task_guard(triggered_id);

        for _ in 0..2 {
            let store = self.conn.store().await?;
            match store
                .push(
                    &collection(project),
                    &id.to_string(),
                    &guard,
                    CURRENT_EVENTS,
                    value.clone(),
                )
                .await?
            {
                UpdateResult::Updated(doc) => return decode_execution(doc).map(Some),
                UpdateResult::NotFound => {
                    return Err(Error::not_found("sequence execution", id.to_string()));
                }
                UpdateResult::GuardMismatch => {
                    if !self.migrate_legacy(project, id).await? {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Sets the state, leaving every other field untouched.
    ///
    /// Returns false when the execution is not in one of `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the execution does not exist.
    pub async fn update_status(
        &self,
        project: &str,
        id: &SequenceExecutionId,
        expected: &[SequenceState],
        state: SequenceState,
        state_before_pause: Option<SequenceState>,
    ) -> Result<bool> {
        require_project(project)?;
        let doc_id = id.to_string();
        let store = self.conn.store().await?;
        match store
            .update(
                &collection(project),
                &doc_id,
                &state_guard(expected),
                status_fields(state, state_before_pause),
            )
            .await?
        {
            UpdateResult::Updated(_) => Ok(true),
            UpdateResult::GuardMismatch => Ok(false),
            UpdateResult::NotFound => Err(Error::not_found("sequence execution", doc_id)),
        }
    }

    /// The write performed by [`SequenceExecutionRepo::update_status`], for
    /// use in an atomic batch.
    #[must_use]
    pub fn status_update_op(
        project: &str,
        id: &SequenceExecutionId,
        expected: &[SequenceState],
        state: SequenceState,
        state_before_pause: Option<SequenceState>,
    ) -> WriteOp {
        WriteOp::Set {
            collection: collection(project),
            id: id.to_string(),
            guard: state_guard(expected),
            fields: status_fields(state, state_before_pause),
        }
    }

    /// Completes the current task and moves to `next` (or to no task).
    ///
    /// Applies only if the current task is still `completed.triggered_id` and
    /// the execution accepts task events. Returns the updated execution, or
    /// `None` if another handler advanced it first.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    #[tracing::instrument(skip(self, completed, next), fields(task = %completed.name))]
    pub async fn advance_task(
        &self,
        project: &str,
        id: &SequenceExecutionId,
        completed: &PreviousTask,
        next: Option<&CurrentTask>,
        state: SequenceState,
    ) -> Result<Option<SequenceExecution>> {
        require_project(project)?;
        let previous = serde_json::to_value(PreviousTaskRecord::<EncodedJson>::from_domain(
            completed,
        )?)?;
        let current = match next {
            Some(task) => serde_json::to_value(CurrentTaskRecord::<EncodedJson>::from_domain(task)?)?,
            None => Value::Null,
        };
        let guard = current_task_guard(&completed.triggered_id);
        let name = collection(project);
        let doc_id = id.to_string();

        for _ in 0..2 {
            let store = self.conn.store().await?;
            let outcome = store
                .apply_batch(vec![
                    WriteOp::Push {
                        collection: name.clone(),
                        id: doc_id.clone(),
                        guard: guard.clone(),
                        path: PREVIOUS_TASKS.to_string(),
                        value: previous.clone(),
                    },
                    WriteOp::Set {
                        collection: name.clone(),
                        id: doc_id.clone(),
                        guard: guard.clone(),
                        fields: vec![
                            (CURRENT_TASK.to_string(), current.clone()),
                            (STATE.to_string(), json!(state)),
                        ],
                    },
                ])
                .await?;
            match outcome {
                BatchOutcome::Applied => return self.get_by_id(project, id).await,
                BatchOutcome::Rejected { reason, .. } => {
                    tracing::debug!(%reason, "task advance rejected");
                    if !self.migrate_legacy(project, id).await? {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Rewrites a legacy document in the current schema.
    ///
    /// Returns true if the document was (or concurrently became) current and
    /// the caller should retry, false if it was already current.
    async fn migrate_legacy(&self, project: &str, id: &SequenceExecutionId) -> Result<bool> {
        let store = self.conn.store().await?;
        let name = collection(project);
        let doc_id = id.to_string();
        let Some(doc) = store.get(&name, &doc_id).await? else {
            return Err(Error::not_found("sequence execution", doc_id));
        };
        if schema_version(&doc) == CURRENT_SCHEMA_VERSION {
            return Ok(false);
        }

        let execution = decode_execution(doc)?;
        let Value::Object(fields) = encode_execution(&execution)? else {
            return Err(Error::storage("encoded execution is not an object"));
        };
        let legacy = Filter::all().is_in(SCHEMA_VERSION, [Value::Null, json!(1)]);
        let outcome = store
            .update(&name, &doc_id, &legacy, fields.into_iter().collect())
            .await?;
        tracing::info!(
            id = %doc_id,
            migrated = outcome.is_updated(),
            "migrated legacy sequence execution"
        );
        Ok(true)
    }

    /// Removes one execution. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    #[tracing::instrument(skip(self), fields(%id))]
    pub async fn delete(&self, project: &str, id: &SequenceExecutionId) -> Result<bool> {
        require_project(project)?;
        let store = self.conn.store().await?;
        store.delete(&collection(project), &id.to_string()).await
    }

    /// Removes every execution of `project`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn clear(&self, project: &str) -> Result<()> {
        require_project(project)?;
        let store = self.conn.store().await?;
        store.drop_collection(&collection(project)).await
    }
}

fn require_project(project: &str) -> Result<()> {
    if project.trim().is_empty() {
        Err(Error::invalid_scope("project must not be empty"))
    } else {
        Ok(())
    }
}

fn state_guard(expected: &[SequenceState]) -> Filter {
    Filter::all().is_in(STATE, expected.iter().map(SequenceState::as_label))
}

fn status_fields(
    state: SequenceState,
    state_before_pause: Option<SequenceState>,
) -> Vec<(String, Value)> {
    vec![
        (STATE.to_string(), json!(state)),
        (
            STATE_BEFORE_PAUSE.to_string(),
            state_before_pause.map_or(Value::Null, |s| json!(s)),
        ),
    ]
}

fn current_task_guard(triggered_id: &str) -> Filter {
    Filter::all()
        .eq(SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)
        .eq(CURRENT_TRIGGERED_ID, triggered_id)
        .is_in(
            STATE,
            [SequenceState::Triggered, SequenceState::Started].map(|s| s.as_label()),
        )
}

fn schema_version(doc: &Value) -> u64 {
    doc.get(SCHEMA_VERSION).and_then(Value::as_u64).unwrap_or(1)
}

/// Encodes an execution as a current-schema document.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if a property cannot be encoded.
pub fn encode_execution(execution: &SequenceExecution) -> Result<Value> {
    let record = ExecutionRecord::<EncodedJson>::from_domain(execution, CURRENT_SCHEMA_VERSION)?;
    Ok(serde_json::to_value(record)?)
}

/// Decodes a document of any supported schema version.
///
/// # Errors
///
/// Returns [`Error::Serialization`] for malformed documents or unknown versions.
pub fn decode_execution(doc: Value) -> Result<SequenceExecution> {
    match schema_version(&doc) {
        1 => serde_json::from_value::<ExecutionRecord<Value>>(doc)?.into_domain(),
        CURRENT_SCHEMA_VERSION => {
            serde_json::from_value::<ExecutionRecord<EncodedJson>>(doc)?.into_domain()
        }
        other => Err(Error::Serialization {
            message: format!("unsupported sequence execution schema version {other}"),
        }),
    }
}

/// How free-form properties are represented in a document.
trait PropertyCodec: Serialize + DeserializeOwned + Default {
    fn encode(value: &Value) -> Result<Self>;
    fn decode(self) -> Result<Value>;
}

impl PropertyCodec for Value {
    fn encode(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }

    fn decode(self) -> Result<Value> {
        Ok(self)
    }
}

/// A JSON value stored as its string encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct EncodedJson(String);

impl PropertyCodec for EncodedJson {
    fn encode(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(Self(serde_json::to_string(value)?))
    }

    fn decode(self) -> Result<Value> {
        if self.0.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.0)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: PropertyCodec")]
struct TaskEventRecord<P> {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    event_type: String,
    source: String,
    time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ResultType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<StatusType>,
    #[serde(default)]
    properties: P,
}

impl<P: PropertyCodec> TaskEventRecord<P> {
    fn from_domain(event: &TaskEvent) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            time: event.time,
            result: event.result,
            status: event.status,
            properties: P::encode(&event.properties)?,
        })
    }

    fn into_domain(self) -> Result<TaskEvent> {
        Ok(TaskEvent {
            id: self.id,
            event_type: self.event_type,
            source: self.source,
            time: self.time,
            result: self.result,
            status: self.status,
            properties: self.properties.decode()?,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: PropertyCodec")]
struct PreviousTaskRecord<P> {
    name: String,
    #[serde(rename = "triggeredID")]
    triggered_id: String,
    result: ResultType,
    status: StatusType,
    #[serde(default)]
    properties: P,
}

impl<P: PropertyCodec> PreviousTaskRecord<P> {
    fn from_domain(task: &PreviousTask) -> Result<Self> {
        Ok(Self {
            name: task.name.clone(),
            triggered_id: task.triggered_id.clone(),
            result: task.result,
            status: task.status,
            properties: P::encode(&task.properties)?,
        })
    }

    fn into_domain(self) -> Result<PreviousTask> {
        Ok(PreviousTask {
            name: self.name,
            triggered_id: self.triggered_id,
            result: self.result,
            status: self.status,
            properties: self.properties.decode()?,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: PropertyCodec")]
struct CurrentTaskRecord<P> {
    name: String,
    #[serde(rename = "triggeredID")]
    triggered_id: String,
    #[serde(default)]
    events: Vec<TaskEventRecord<P>>,
}

impl<P: PropertyCodec> CurrentTaskRecord<P> {
    fn from_domain(task: &CurrentTask) -> Result<Self> {
        Ok(Self {
            name: task.name.clone(),
            triggered_id: task.triggered_id.clone(),
            events: task
                .events
                .iter()
                .map(TaskEventRecord::from_domain)
                .collect::<Result<_>>()?,
        })
    }

    fn into_domain(self) -> Result<CurrentTask> {
        Ok(CurrentTask {
            name: self.name,
            triggered_id: self.triggered_id,
            events: self
                .events
                .into_iter()
                .map(TaskEventRecord::into_domain)
                .collect::<Result<_>>()?,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: PropertyCodec")]
struct StatusRecord<P> {
    state: SequenceState,
    #[serde(default)]
    state_before_pause: Option<SequenceState>,
    #[serde(default)]
    previous_tasks: Vec<PreviousTaskRecord<P>>,
    #[serde(default)]
    current_task: Option<CurrentTaskRecord<P>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "P: PropertyCodec")]
struct ExecutionRecord<P> {
    id: SequenceExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_version: Option<u64>,
    scope: EventScope,
    sequence: Sequence,
    status: StatusRecord<P>,
    #[serde(default)]
    input_properties: P,
    triggered_at: DateTime<Utc>,
}

impl<P: PropertyCodec> ExecutionRecord<P> {
    fn from_domain(execution: &SequenceExecution, schema_version: u64) -> Result<Self> {
        let status = &execution.status;
        Ok(Self {
            id: execution.id,
            schema_version: Some(schema_version),
            scope: execution.scope.clone(),
            sequence: execution.sequence.clone(),
            status: StatusRecord {
                state: status.state,
                state_before_pause: status.state_before_pause,
                previous_tasks: status
                    .previous_tasks
                    .iter()
                    .map(PreviousTaskRecord::from_domain)
                    .collect::<Result<_>>()?,
                current_task: status
                    .current_task
                    .as_ref()
                    .map(CurrentTaskRecord::from_domain)
                    .transpose()?,
            },
            input_properties: P::encode(&execution.input_properties)?,
            triggered_at: execution.triggered_at,
        })
    }

    fn into_domain(self) -> Result<SequenceExecution> {
        let status = self.status;
        Ok(SequenceExecution {
            id: self.id,
            scope: self.scope,
            sequence: self.sequence,
            status: SequenceExecutionStatus {
                state: status.state,
                state_before_pause: status.state_before_pause,
                previous_tasks: status
                    .previous_tasks
                    .into_iter()
                    .map(PreviousTaskRecord::into_domain)
                    .collect::<Result<_>>()?,
                current_task: status
                    .current_task
                    .map(CurrentTaskRecord::into_domain)
                    .transpose()?,
            },
            input_properties: self.input_properties.decode()?,
            triggered_at: self.triggered_at,
        })
    }
}
