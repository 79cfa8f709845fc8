//! Controller facade.
//!
//! [`Controller`] wires the store, repositories, view, engine and dispatcher
//! together and exposes the operations callers use: event intake, the
//! pause/resume/abort/timeout control surface and project lifecycle.
//!
//! ## Control commands
//!
//! Each command first reads the affected executions, then builds every write
//! it needs (status updates guarded by the state that was read, pause marker
//! changes, queue purges) and applies them in one atomic batch. If another
//! handler changed one of the executions in between, the batch is rejected
//! and nothing changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use shipyard_core::{Clock, IdSource, LockProvider};
use shipyard_core::observability::sequence_span;
use tracing::Instrument;

use crate::config::ControllerConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher, DrainReport};
use crate::engine::{EngineDeps, SequenceEngine};
use crate::error::{Error, Result};
use crate::event::{KeptnEvent, ResultType, StatusType};
use crate::metrics::ControllerMetrics;
use crate::project::{ExpandedProject, ExpandedStage};
use crate::secrets::{GitCredentials, SecretStore};
use crate::sequence::{SequenceExecution, SequenceState};
use crate::shipyard::{Shipyard, ShipyardSource};
use crate::sink::EventSink;
use crate::store::{
    BatchOutcome, ConnectionManager, DocumentStore, EventQueueRepo, ProjectEventRepo,
    ProjectRepo, SequenceExecutionRepo, WriteOp,
};
use crate::store::sequence_execution::ExecutionQuery;
use crate::view::ProjectMaterializedView;

const ACTIVE: [SequenceState; 2] = [SequenceState::Triggered, SequenceState::Started];
const INTERRUPTIBLE: [SequenceState; 3] = [
    SequenceState::Triggered,
    SequenceState::Started,
    SequenceState::Paused,
];

/// External collaborators of a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerDeps {
    /// Backing document store.
    pub store: Arc<dyn DocumentStore>,
    /// Source of shipyard documents.
    pub shipyards: Arc<dyn ShipyardSource>,
    /// Secret store for upstream credentials.
    pub secrets: Arc<dyn SecretStore>,
    /// Destination of outgoing events.
    pub sink: Arc<dyn EventSink>,
    /// Named locks guarding the project view.
    pub locks: Arc<dyn LockProvider>,
    /// Mints event ids.
    pub ids: Arc<dyn IdSource>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

/// Request to create a project.
#[derive(Debug, Clone)]
pub struct CreateProject {
    /// Project name.
    pub name: String,
    /// Raw shipyard text.
    pub shipyard: String,
    /// Upstream repository credentials, if any.
    pub upstream: Option<GitCredentials>,
}

/// The shipyard controller.
#[derive(Debug, Clone)]
pub struct Controller {
    conn: ConnectionManager,
    engine: Arc<SequenceEngine>,
    dispatcher: Arc<Dispatcher>,
    executions: SequenceExecutionRepo,
    queue: EventQueueRepo,
    events: ProjectEventRepo,
    view: ProjectMaterializedView,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    metrics: ControllerMetrics,
}

impl Controller {
    /// Wires a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(config: &ControllerConfig, deps: ControllerDeps) -> Result<Self> {
        config.validate()?;
        let conn = ConnectionManager::from_config(deps.store, config);
        let executions = SequenceExecutionRepo::new(conn.clone());
        let events = ProjectEventRepo::new(conn.clone());
        let queue = EventQueueRepo::new(conn.clone());
        let view = ProjectMaterializedView::new(
            ProjectRepo::new(conn.clone()),
            events.clone(),
            deps.locks,
            Arc::clone(&deps.clock),
        );
        let engine = Arc::new(SequenceEngine::new(
            EngineDeps {
                shipyards: deps.shipyards,
                executions: executions.clone(),
                events: events.clone(),
                view: view.clone(),
                sink: deps.sink,
                ids: deps.ids,
                clock: Arc::clone(&deps.clock),
            },
            config,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&engine),
            queue.clone(),
            Arc::clone(&deps.clock),
        ));
        Ok(Self {
            conn,
            engine,
            dispatcher,
            executions,
            queue,
            events,
            view,
            secrets: deps.secrets,
            clock: deps.clock,
            metrics: ControllerMetrics::new(),
        })
    }

    /// The dispatcher, e.g. for [`Dispatcher::run_drain_loop`].
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The materialized project view.
    #[must_use]
    pub fn view(&self) -> &ProjectMaterializedView {
        &self.view
    }

    /// The execution store.
    #[must_use]
    pub fn executions(&self) -> &SequenceExecutionRepo {
        &self.executions
    }

    /// Handles one incoming lifecycle event.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub async fn handle_event(&self, event: KeptnEvent) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(event).await
    }

    /// Replays queued events that are due now.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::drain`].
    pub async fn drain(&self) -> Result<DrainReport> {
        self.dispatcher.drain(self.clock.now()).await
    }

    /// Pauses a run, or one stage of it.
    ///
    /// Active executions move to `paused` and remember their state; events
    /// arriving afterwards are queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the run has no executions in scope, or
    /// an error if the batch was rejected.
    pub async fn pause(&self, keptn_context: &str, stage: Option<&str>) -> Result<()> {
        let span = sequence_span("pause", "", keptn_context);
        async {
            self.require_executions(keptn_context, stage).await?;
            let active = self
                .executions
                .get_by_context(keptn_context, stage, &ACTIVE)
                .await?;

            let mut ops: Vec<WriteOp> = active
                .iter()
                .map(|exec| {
                    SequenceExecutionRepo::status_update_op(
                        &exec.scope.project,
                        &exec.id,
                        &[exec.status.state],
                        SequenceState::Paused,
                        Some(exec.status.state),
                    )
                })
                .collect();
            ops.push(EventQueueRepo::pause_op(keptn_context, stage)?);

            self.apply_control("pause", ops).await?;
            tracing::info!(paused = active.len(), "run paused");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Resumes a run, or one stage of it, then replays its queued events.
    ///
    /// A stage cannot be resumed on its own while the whole run is paused.
    /// Resuming a run whose executions were aborted changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the run has no executions in scope,
    /// [`Error::InvalidStateTransition`] for a stage resume under a run-wide
    /// pause, or an error if the batch was rejected.
    pub async fn resume(&self, keptn_context: &str, stage: Option<&str>) -> Result<DrainReport> {
        let span = sequence_span("resume", "", keptn_context);
        async {
            self.require_executions(keptn_context, stage).await?;
            if let Some(stage) = stage {
                let run_paused = self
                    .queue
                    .pause_markers(keptn_context)
                    .await?
                    .iter()
                    .any(|marker| marker.stage.is_empty() && marker.blocks(stage));
                if run_paused {
                    return Err(Error::InvalidStateTransition {
                        from: SequenceState::Paused.to_string(),
                        to: "resumed".to_string(),
                        reason: format!(
                            "run is paused as a whole; resume it without stage '{stage}'"
                        ),
                    });
                }
            }
            let paused = self
                .executions
                .get_by_context(keptn_context, stage, &[SequenceState::Paused])
                .await?;

            let mut ops: Vec<WriteOp> = paused
                .iter()
                .map(|exec| {
                    SequenceExecutionRepo::status_update_op(
                        &exec.scope.project,
                        &exec.id,
                        &[SequenceState::Paused],
                        exec.status
                            .state_before_pause
                            .unwrap_or(SequenceState::Triggered),
                        None,
                    )
                })
                .collect();
            ops.extend(EventQueueRepo::resume_ops(keptn_context, stage));

            self.apply_control("resume", ops).await?;
            tracing::info!(resumed = paused.len(), "run resumed");
            self.drain().await
        }
        .instrument(span)
        .await
    }

    /// Aborts a run, or one stage of it.
    ///
    /// Unfinished executions move to `aborted`, queued events and pause
    /// markers in scope are dropped, and every aborted sequence announces
    /// `finished` with status `aborted`. Aborted sequences trigger nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing in scope can be aborted, or an
    /// error if the batch was rejected.
    pub async fn abort(&self, keptn_context: &str, stage: Option<&str>) -> Result<Vec<KeptnEvent>> {
        let span = sequence_span("abort", "", keptn_context);
        async {
            let targets = self
                .interrupt(
                    "abort",
                    keptn_context,
                    stage,
                    SequenceState::Aborted,
                )
                .await?;
            let mut announced = Vec::with_capacity(targets.len());
            for exec in &targets {
                announced.push(
                    self.engine
                        .publish_sequence_finished(exec, exec.result(), StatusType::Aborted)
                        .await?,
                );
                self.metrics.record_sequence_outcome(
                    SequenceState::Aborted.as_label(),
                    exec.result().as_str(),
                );
            }
            Ok(announced)
        }
        .instrument(span)
        .await
    }

    /// Times out the run's sequences in `stage`.
    ///
    /// Issued by an external expiry check. Unfinished executions move to
    /// `timedout` and announce `finished` with result `fail` and status
    /// `errored`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing in scope can time out, or an
    /// error if the batch was rejected.
    pub async fn time_out(&self, keptn_context: &str, stage: &str) -> Result<Vec<KeptnEvent>> {
        let span = sequence_span("time_out", "", keptn_context);
        async {
            let targets = self
                .interrupt("timeout", keptn_context, Some(stage), SequenceState::TimedOut)
                .await?;
            let mut announced = Vec::with_capacity(targets.len());
            for exec in &targets {
                announced.push(
                    self.engine
                        .publish_sequence_finished(exec, ResultType::Fail, StatusType::Errored)
                        .await?,
                );
                self.metrics.record_sequence_outcome(
                    SequenceState::TimedOut.as_label(),
                    ResultType::Fail.as_str(),
                );
            }
            Ok(announced)
        }
        .instrument(span)
        .await
    }

    /// Moves every unfinished execution in scope to `target` and purges the
    /// scope's queue, atomically. Returns the executions that moved.
    async fn interrupt(
        &self,
        command: &str,
        keptn_context: &str,
        stage: Option<&str>,
        target: SequenceState,
    ) -> Result<Vec<SequenceExecution>> {
        let targets = self
            .executions
            .get_by_context(keptn_context, stage, &INTERRUPTIBLE)
            .await?;
        if targets.is_empty() {
            return Err(Error::not_found(
                "unfinished sequence execution",
                scope_label(keptn_context, stage),
            ));
        }
        for exec in &targets {
            exec.check_transition(target)?;
        }

        let mut ops: Vec<WriteOp> = targets
            .iter()
            .map(|exec| {
                SequenceExecutionRepo::status_update_op(
                    &exec.scope.project,
                    &exec.id,
                    &[exec.status.state],
                    target,
                    None,
                )
            })
            .collect();
        ops.extend(EventQueueRepo::purge_ops(keptn_context, stage));
        self.apply_control(command, ops).await?;
        tracing::info!(count = targets.len(), state = %target, "sequences interrupted");

        Ok(targets
            .into_iter()
            .map(|mut exec| {
                exec.status.state = target;
                exec
            })
            .collect())
    }

    async fn require_executions(&self, keptn_context: &str, stage: Option<&str>) -> Result<()> {
        if self
            .executions
            .get_by_context(keptn_context, stage, &[])
            .await?
            .is_empty()
        {
            return Err(Error::not_found(
                "sequence execution",
                scope_label(keptn_context, stage),
            ));
        }
        Ok(())
    }

    async fn apply_control(&self, command: &str, ops: Vec<WriteOp>) -> Result<()> {
        let outcome = self.conn.store().await?.apply_batch(ops).await;
        let result = match outcome {
            Ok(BatchOutcome::Applied) => Ok(()),
            Ok(BatchOutcome::Rejected { index, reason }) => Err(Error::Inconsistent {
                message: format!("{command} rejected at write {index}: {reason}"),
            }),
            Err(e) => Err(e),
        };
        let label = if result.is_ok() { "ok" } else { "rejected" };
        self.metrics.record_control_command(command, label);
        result
    }

    /// Creates a project with the stages of its shipyard.
    ///
    /// Upstream credentials, when given, are stored as
    /// `git-credentials-<project>` and their remote and user recorded on the
    /// project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShipyard`] for an invalid shipyard and
    /// [`Error::AlreadyExists`] if the project exists.
    #[tracing::instrument(skip(self, request), fields(project = %request.name))]
    pub async fn create_project(&self, request: CreateProject) -> Result<ExpandedProject> {
        if request.name.trim().is_empty() || request.name.contains('.') {
            return Err(Error::invalid_scope(format!(
                "invalid project name '{}'",
                request.name
            )));
        }
        let shipyard = Shipyard::parse(&request.shipyard)?;

        let mut project =
            ExpandedProject::new(request.name.as_str(), request.shipyard.as_str(), self.clock.now());
        project.stages = shipyard.stage_names().map(ExpandedStage::new).collect();
        if let Some(upstream) = &request.upstream {
            project.git_remote_uri.clone_from(&upstream.remote_uri);
            project.git_user.clone_from(&upstream.user);
        }
        self.view.create_project(&project).await?;

        if let Some(upstream) = &request.upstream {
            self.secrets
                .set_secret(&GitCredentials::secret_name(&request.name), upstream.to_secret())
                .await?;
        }
        Ok(project)
    }

    /// Adds a service to every stage of a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn create_service(&self, project: &str, service: &str) -> Result<()> {
        let doc = self.view.get_project(project).await?;
        for stage in &doc.stages {
            self.view
                .create_service(project, &stage.stage_name, service)
                .await?;
        }
        Ok(())
    }

    /// Removes a project and everything recorded for it.
    ///
    /// # Errors
    ///
    /// Returns a store or secret store error.
    #[tracing::instrument(skip(self))]
    pub async fn delete_project(&self, project: &str) -> Result<()> {
        let contexts: BTreeSet<String> = self
            .executions
            .get(&ExecutionQuery::project(project))
            .await?
            .into_iter()
            .map(|exec| exec.scope.keptn_context)
            .collect();

        let ops = EventQueueRepo::purge_project_ops(project, contexts.iter().map(String::as_str));
        self.apply_control("delete_project", ops).await?;
        self.executions.clear(project).await?;
        self.events.delete_project_events(project).await?;
        self.view.delete_project(project).await?;
        self.secrets
            .delete_secret(&GitCredentials::secret_name(project))
            .await?;
        tracing::info!(runs = contexts.len(), "project deleted");
        Ok(())
    }
}

fn scope_label(keptn_context: &str, stage: Option<&str>) -> String {
    match stage {
        Some(stage) => format!("{keptn_context}/{stage}"),
        None => keptn_context.to_string(),
    }
}
