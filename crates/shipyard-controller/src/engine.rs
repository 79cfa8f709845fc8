//! Sequence execution engine.
//!
//! The engine consumes lifecycle events and drives [`SequenceExecution`]s
//! through their state machine:
//!
//! - `<stage>.<sequence>.triggered` creates an execution, announces it with
//!   `<stage>.<sequence>.started` and triggers the first task.
//! - `<task>.started` and `<task>.finished` are appended to the current task.
//!   Once every executor that started the task has finished it, the task is
//!   completed and either the next task is triggered or the sequence
//!   finishes.
//! - A finished sequence fans out into the sequences whose `triggeredOn`
//!   rules name it. Those triggers are returned as follow-ups for the
//!   dispatcher to deliver through its pause gate.
//!
//! All persistent changes go through narrow, guarded store writes, so
//! several engines may handle events of the same run concurrently. Events
//! that no longer match the current task are ignored. Task events of a
//! paused run are refused with [`Error::Paused`] and redelivered after
//! resume; reports are keyed by event id, so a redelivery counts once.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use shipyard_core::{Clock, IdSource};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::event::{
    EventKind, EventType, KeptnEvent, ResultType, StatusType, sequence_event_type,
    task_event_type,
};
use crate::metrics::{ControllerMetrics, TimingGuard};
use crate::project::Remediation;
use crate::scope::EventScope;
use crate::sequence::{CurrentTask, SequenceExecution, SequenceState, TaskEvent, input_properties};
use crate::shipyard::{Shipyard, ShipyardSource, Task};
use crate::sink::EventSink;
use crate::store::{ProjectEventRepo, SequenceExecutionRepo, UpsertOptions};
use crate::view::ProjectMaterializedView;

/// Sequence name whose runs are tracked as open remediations.
pub const REMEDIATION_SEQUENCE: &str = "remediation";

/// What handling one event produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    /// Events published to the sink, in publish order.
    pub emitted: Vec<KeptnEvent>,
    /// Sequence triggers that must be dispatched in turn.
    pub follow_ups: Vec<KeptnEvent>,
}

impl EngineOutput {
    /// Returns true if the event changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty() && self.follow_ups.is_empty()
    }
}

/// Collaborators of the engine.
#[derive(Debug, Clone)]
pub struct EngineDeps {
    /// Source of shipyard documents.
    pub shipyards: Arc<dyn ShipyardSource>,
    /// Execution store.
    pub executions: SequenceExecutionRepo,
    /// Event history.
    pub events: ProjectEventRepo,
    /// Project view.
    pub view: ProjectMaterializedView,
    /// Destination of outgoing events.
    pub sink: Arc<dyn EventSink>,
    /// Mints event ids.
    pub ids: Arc<dyn IdSource>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

/// Drives sequence executions from lifecycle events.
#[derive(Debug, Clone)]
pub struct SequenceEngine {
    deps: EngineDeps,
    metrics: ControllerMetrics,
    source: String,
    check_unique_triggered_id: bool,
}

impl SequenceEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(deps: EngineDeps, config: &ControllerConfig) -> Self {
        Self {
            deps,
            metrics: ControllerMetrics::new(),
            source: config.event_source.clone(),
            check_unique_triggered_id: config.check_unique_triggered_id,
        }
    }

    /// The execution store.
    #[must_use]
    pub fn executions(&self) -> &SequenceExecutionRepo {
        &self.deps.executions
    }

    /// Gives a sequence trigger without a run correlation id a fresh one.
    ///
    /// Returns true if a context was assigned.
    pub fn assign_context(&self, event: &mut KeptnEvent) -> bool {
        let is_trigger = matches!(
            event.parsed_type(),
            EventType::Sequence {
                kind: EventKind::Triggered,
                ..
            }
        );
        if !is_trigger || !event.keptn_context.trim().is_empty() {
            return false;
        }
        event.keptn_context = self.deps.ids.mint();
        tracing::info!(
            event_type = %event.event_type,
            keptn_context = %event.keptn_context,
            "assigned run context to sequence trigger"
        );
        true
    }

    /// Handles one lifecycle event.
    ///
    /// Events that do not drive a sequence, or that no longer match the
    /// current task of their execution, produce an empty output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] for a redelivered sequence trigger,
    /// [`Error::NotFound`] if the triggered sequence is not in the shipyard,
    /// [`Error::Paused`] for a task event of a paused run, and store or
    /// collaborator errors. A trigger whose start fails leaves no execution
    /// behind.
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, id = %event.id, keptn_context = %event.keptn_context)
    )]
    pub async fn handle(&self, event: &KeptnEvent) -> Result<EngineOutput> {
        let parsed = event.parsed_type();
        let kind = match &parsed {
            EventType::Task { kind, .. } | EventType::Sequence { kind, .. } => kind.as_str(),
            EventType::Other(_) => "other",
        };
        let metrics = self.metrics.clone();
        let _timer = TimingGuard::new(move |elapsed| metrics.observe_handle_duration(kind, elapsed));

        let result = match parsed {
            EventType::Sequence {
                stage,
                sequence,
                kind: EventKind::Triggered,
            } => self.on_sequence_triggered(event, &stage, &sequence).await,
            EventType::Task {
                task,
                kind: kind @ (EventKind::Started | EventKind::Finished),
            } => self.on_task_event(event, &task, kind).await,
            other => {
                tracing::debug!(?other, "event does not drive a sequence");
                Ok(EngineOutput::default())
            }
        };

        let outcome = match &result {
            Ok(out) if out.is_empty() => "ignored",
            Ok(_) => "handled",
            Err(e) if e.is_already_exists() => "duplicate",
            Err(e) if e.is_paused() => "paused",
            Err(_) => "error",
        };
        self.metrics.record_event(kind, outcome);
        result
    }

    async fn on_sequence_triggered(
        &self,
        event: &KeptnEvent,
        stage: &str,
        sequence_name: &str,
    ) -> Result<EngineOutput> {
        let mut scope = EventScope::from_event(event)?;
        scope.triggered_id = event.id.clone();
        scope.validate_for_write()?;

        let shipyard = self.load_shipyard(&scope.project).await?;
        let sequence = shipyard.sequence(stage, sequence_name)?.clone();
        let triggered_at = event.time.unwrap_or_else(|| self.deps.clock.now());
        let execution = SequenceExecution::new(
            scope,
            sequence,
            input_properties(event),
            triggered_at,
            self.deps.ids.mint(),
        );
        self.deps
            .executions
            .upsert(
                &execution,
                UpsertOptions {
                    check_unique_triggered_id: self.check_unique_triggered_id,
                },
            )
            .await?;
        tracing::info!(
            execution_id = %execution.id,
            project = %execution.scope.project,
            "sequence execution created"
        );

        match self.start_execution(event, &execution, stage, sequence_name).await {
            Ok(out) => Ok(out),
            Err(e) => {
                self.roll_back_execution(&execution).await;
                Err(e)
            }
        }
    }

    /// Announces a freshly stored execution and triggers its first task.
    async fn start_execution(
        &self,
        event: &KeptnEvent,
        execution: &SequenceExecution,
        stage: &str,
        sequence_name: &str,
    ) -> Result<EngineOutput> {
        let project = execution.scope.project.as_str();
        self.deps.events.insert_event(project, event).await?;
        self.fold_into_view(event).await?;
        if sequence_name == REMEDIATION_SEQUENCE {
            self.open_remediation(execution, event).await?;
        }

        let mut out = EngineOutput::default();
        let started = self.outgoing(
            self.deps.ids.mint(),
            sequence_event_type(stage, sequence_name, EventKind::Started),
            execution,
            execution.scoped(Map::new(), stage),
        );
        self.deps.events.insert_event(project, &started).await?;
        self.emit(&mut out, started).await?;

        match (&execution.status.current_task, execution.sequence.task(0)) {
            (Some(current), Some(task)) => {
                self.trigger_task(&mut out, execution, task, &current.triggered_id)
                    .await?;
            }
            _ => {
                let finished = self
                    .deps
                    .executions
                    .update_status(
                        project,
                        &execution.id,
                        &[SequenceState::Triggered],
                        SequenceState::Finished,
                        None,
                    )
                    .await?;
                if finished {
                    let mut done = execution.clone();
                    done.status.state = SequenceState::Finished;
                    self.complete_sequence(&mut out, &done).await?;
                }
            }
        }
        Ok(out)
    }

    /// Removes an execution whose start failed so a redelivered trigger
    /// creates it again.
    async fn roll_back_execution(&self, execution: &SequenceExecution) {
        match self
            .deps
            .executions
            .delete(&execution.scope.project, &execution.id)
            .await
        {
            Ok(_) => tracing::warn!(
                execution_id = %execution.id,
                "sequence start failed; execution removed"
            ),
            Err(e) => tracing::error!(
                execution_id = %execution.id,
                error = %e,
                "sequence start failed and the execution could not be removed"
            ),
        }
    }

    async fn on_task_event(
        &self,
        event: &KeptnEvent,
        task_name: &str,
        kind: EventKind,
    ) -> Result<EngineOutput> {
        let data = event.base_data()?;
        if data.project.trim().is_empty() {
            return Err(Error::invalid_scope("task event must name a project"));
        }
        if event.triggered_id.is_empty() {
            tracing::debug!("task event carries no triggeredid");
            return Ok(EngineOutput::default());
        }
        let project = data.project.as_str();

        let Some(execution) = self
            .deps
            .executions
            .get_by_triggered_id(project, &event.triggered_id)
            .await?
        else {
            tracing::debug!("no sequence execution waits for this event");
            return Ok(EngineOutput::default());
        };
        let Some(current) = &execution.status.current_task else {
            return Ok(EngineOutput::default());
        };
        let other_stage = !data.stage.is_empty() && data.stage != execution.scope.stage;
        if current.name != task_name || other_stage {
            tracing::debug!(
                current = %current.name,
                stage = %execution.scope.stage,
                "event does not match the current task"
            );
            return Ok(EngineOutput::default());
        }
        if execution.status.state == SequenceState::Paused {
            return Err(paused(&execution));
        }
        if !execution.status.state.accepts_task_events() {
            tracing::debug!(state = %execution.status.state, "execution takes no task events");
            return Ok(EngineOutput::default());
        }

        let updated = if current.has_report(&event.id) {
            tracing::debug!("report already recorded");
            execution.clone()
        } else {
            let report = TaskEvent::from_event(event, self.deps.clock.now())?;
            match self
                .deps
                .executions
                .append_task_event(project, &execution.id, &event.triggered_id, &report)
                .await?
            {
                Some(updated) => updated,
                None => {
                    return self
                        .paused_or_moved_on(&execution, &event.triggered_id)
                        .await;
                }
            }
        };
        self.deps.events.insert_event(project, event).await?;
        self.fold_into_view(event).await?;

        match kind {
            EventKind::Started => {
                if updated.status.state == SequenceState::Triggered {
                    self.deps
                        .executions
                        .update_status(
                            project,
                            &updated.id,
                            &[SequenceState::Triggered],
                            SequenceState::Started,
                            None,
                        )
                        .await?;
                }
                Ok(EngineOutput::default())
            }
            _ => self.on_task_finished(&updated, &event.triggered_id).await,
        }
    }

    async fn on_task_finished(
        &self,
        execution: &SequenceExecution,
        triggered_id: &str,
    ) -> Result<EngineOutput> {
        let mut out = EngineOutput::default();
        let Some(current) = execution
            .status
            .current_task
            .as_ref()
            .filter(|t| t.triggered_id == triggered_id)
        else {
            return Ok(out);
        };
        if !current.is_complete() {
            tracing::debug!(
                started = current.started_count(),
                finished = current.finished_count(),
                "waiting for outstanding finished reports"
            );
            return Ok(out);
        }
        let expected = execution
            .sequence
            .task(execution.current_task_index())
            .map(|t| t.name.as_str());
        if expected != Some(current.name.as_str()) {
            return Err(Error::Inconsistent {
                message: format!(
                    "execution {} runs task '{}' at position {} of sequence '{}'",
                    execution.id,
                    current.name,
                    execution.current_task_index(),
                    execution.sequence.name
                ),
            });
        }

        let completed = current.complete();
        let next = if completed.result == ResultType::Fail {
            None
        } else {
            execution.next_task().cloned()
        };
        let project = execution.scope.project.as_str();

        if let Some(task) = next {
            let next_current = CurrentTask::new(task.name.clone(), self.deps.ids.mint());
            let Some(advanced) = self
                .deps
                .executions
                .advance_task(
                    project,
                    &execution.id,
                    &completed,
                    Some(&next_current),
                    SequenceState::Triggered,
                )
                .await?
            else {
                return self.paused_or_moved_on(execution, triggered_id).await;
            };
            tracing::info!(
                task = %completed.name,
                result = %completed.result,
                next = %task.name,
                "task completed"
            );
            self.trigger_task(&mut out, &advanced, &task, &next_current.triggered_id)
                .await?;
        } else {
            let Some(finished) = self
                .deps
                .executions
                .advance_task(
                    project,
                    &execution.id,
                    &completed,
                    None,
                    SequenceState::Finished,
                )
                .await?
            else {
                return self.paused_or_moved_on(execution, triggered_id).await;
            };
            tracing::info!(
                task = %completed.name,
                result = %completed.result,
                "last task completed"
            );
            self.complete_sequence(&mut out, &finished).await?;
        }
        Ok(out)
    }

    /// Settles a guarded write that matched nothing: the run was paused
    /// under the event, or its current task moved on.
    async fn paused_or_moved_on(
        &self,
        execution: &SequenceExecution,
        triggered_id: &str,
    ) -> Result<EngineOutput> {
        let latest = self
            .deps
            .executions
            .get_by_id(&execution.scope.project, &execution.id)
            .await?;
        match latest {
            Some(latest)
                if latest.status.state == SequenceState::Paused
                    && latest
                        .status
                        .current_task
                        .as_ref()
                        .is_some_and(|t| t.triggered_id == triggered_id) =>
            {
                Err(paused(&latest))
            }
            _ => {
                tracing::debug!("current task moved on before the write landed");
                Ok(EngineOutput::default())
            }
        }
    }

    async fn trigger_task(
        &self,
        out: &mut EngineOutput,
        execution: &SequenceExecution,
        task: &Task,
        triggered_id: &str,
    ) -> Result<()> {
        let event = self.outgoing(
            triggered_id.to_string(),
            task_event_type(&task.name, EventKind::Triggered),
            execution,
            execution.task_payload(task),
        );
        self.deps
            .events
            .insert_event(&execution.scope.project, &event)
            .await?;
        self.fold_into_view(&event).await?;
        self.emit(out, event).await
    }

    async fn complete_sequence(
        &self,
        out: &mut EngineOutput,
        execution: &SequenceExecution,
    ) -> Result<()> {
        let result = execution.result();
        let status = execution.status_summary();
        let finished = self
            .publish_sequence_finished(execution, result, status)
            .await?;
        out.emitted.push(finished.clone());
        self.metrics
            .record_sequence_outcome(SequenceState::Finished.as_label(), result.as_str());
        self.fan_out(out, execution, &finished, result).await
    }

    /// Publishes `<stage>.<sequence>.finished` for `execution`.
    ///
    /// Also closes the run's open remediations when the sequence is a
    /// remediation.
    ///
    /// # Errors
    ///
    /// Returns a store or sink error.
    pub async fn publish_sequence_finished(
        &self,
        execution: &SequenceExecution,
        result: ResultType,
        status: StatusType,
    ) -> Result<KeptnEvent> {
        let mut data = Map::new();
        data.insert("result".into(), json!(result));
        data.insert("status".into(), json!(status));
        let finished = self.outgoing(
            self.deps.ids.mint(),
            sequence_event_type(
                &execution.scope.stage,
                &execution.sequence.name,
                EventKind::Finished,
            ),
            execution,
            execution.scoped(data, &execution.scope.stage),
        );
        self.deps
            .events
            .insert_event(&execution.scope.project, &finished)
            .await?;
        self.fold_into_view(&finished).await?;
        self.deps.sink.publish(&finished).await?;
        tracing::info!(
            execution_id = %execution.id,
            %result,
            %status,
            "sequence finished"
        );

        if execution.sequence.name == REMEDIATION_SEQUENCE {
            self.close_remediations(execution).await?;
        }
        Ok(finished)
    }

    async fn fan_out(
        &self,
        out: &mut EngineOutput,
        execution: &SequenceExecution,
        finished: &KeptnEvent,
        result: ResultType,
    ) -> Result<()> {
        let shipyard = self.load_shipyard(&execution.scope.project).await?;
        for (stage, sequence) in shipyard.sequences_triggered_by(
            &execution.scope.stage,
            &execution.sequence.name,
            result,
        ) {
            let follow_up = KeptnEvent::new(
                self.deps.ids.mint(),
                sequence_event_type(&stage.name, &sequence.name, EventKind::Triggered),
                self.source.as_str(),
                execution.scoped(execution.accumulated_properties(), &stage.name),
            )
            .with_context(execution.scope.keptn_context.as_str())
            .with_triggered_id(finished.id.as_str())
            .with_time(self.deps.clock.now())
            .with_git_commit_id(execution.scope.git_commit_id.clone());
            tracing::info!(
                stage = %stage.name,
                sequence = %sequence.name,
                "triggering follow-up sequence"
            );
            self.deps.sink.publish(&follow_up).await?;
            out.emitted.push(follow_up.clone());
            out.follow_ups.push(follow_up);
        }
        Ok(())
    }

    async fn load_shipyard(&self, project: &str) -> Result<Shipyard> {
        let text = self.deps.shipyards.fetch_shipyard(project).await?;
        Shipyard::parse(&text)
    }

    fn outgoing(
        &self,
        id: String,
        event_type: String,
        execution: &SequenceExecution,
        data: Value,
    ) -> KeptnEvent {
        KeptnEvent::new(id, event_type, self.source.as_str(), data)
            .with_context(execution.scope.keptn_context.as_str())
            .with_triggered_id(execution.scope.triggered_id.as_str())
            .with_time(self.deps.clock.now())
            .with_git_commit_id(execution.scope.git_commit_id.clone())
    }

    async fn emit(&self, out: &mut EngineOutput, event: KeptnEvent) -> Result<()> {
        self.deps.sink.publish(&event).await?;
        out.emitted.push(event);
        Ok(())
    }

    /// Records `event` on its service. Only store outages abort handling;
    /// a view that lags behind is logged.
    async fn fold_into_view(&self, event: &KeptnEvent) -> Result<()> {
        let data = event.base_data()?;
        if data.service.is_empty() || data.stage.is_empty() {
            return Ok(());
        }
        match self.deps.view.update_event_of_service(event).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "could not record event in project view");
                Ok(())
            }
        }
    }

    async fn open_remediation(
        &self,
        execution: &SequenceExecution,
        event: &KeptnEvent,
    ) -> Result<()> {
        let scope = &execution.scope;
        let remediation = Remediation {
            event_id: event.id.clone(),
            keptn_context: scope.keptn_context.clone(),
            event_type: event.event_type.clone(),
            time: execution.triggered_at,
        };
        match self
            .deps
            .view
            .create_remediation(&scope.project, &scope.stage, &scope.service, remediation)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "could not record open remediation");
                Ok(())
            }
        }
    }

    async fn close_remediations(&self, execution: &SequenceExecution) -> Result<()> {
        let scope = &execution.scope;
        match self
            .deps
            .view
            .close_open_remediations(
                &scope.project,
                &scope.stage,
                &scope.service,
                &scope.keptn_context,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("remediations already closed");
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "could not close open remediations");
                Ok(())
            }
        }
    }
}

fn paused(execution: &SequenceExecution) -> Error {
    Error::Paused {
        keptn_context: execution.scope.keptn_context.clone(),
        stage: execution.scope.stage.clone(),
    }
}
