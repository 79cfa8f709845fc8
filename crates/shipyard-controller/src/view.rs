//! Materialized project view.
//!
//! [`ProjectMaterializedView`] is the only writer of [`ExpandedProject`]
//! documents. Every mutation is a read-modify-write of the whole document and
//! runs under the project's lock, so concurrent handlers for the same project
//! are serialized while unrelated projects proceed in parallel.
//!
//! Mutations that would not change the document (creating a stage that
//! exists, deleting one that does not) skip the write entirely.

use std::sync::Arc;

use tracing::Instrument;

use shipyard_core::observability::project_span;
use shipyard_core::{Clock, LockKey, LockProvider};

use crate::error::{Error, Result};
use crate::event::{
    DEPLOYMENT_TASK, EventKind, KeptnEvent, TaskEventData, task_event_type,
};
use crate::project::{EventContextInfo, ExpandedProject, ExpandedService, ExpandedStage, Remediation};
use crate::store::{ProjectEventRepo, ProjectRepo};

/// Incrementally maintained project/stage/service state.
#[derive(Debug, Clone)]
pub struct ProjectMaterializedView {
    projects: ProjectRepo,
    events: ProjectEventRepo,
    locks: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
}

impl ProjectMaterializedView {
    /// Creates a view over the given repositories.
    #[must_use]
    pub fn new(
        projects: ProjectRepo,
        events: ProjectEventRepo,
        locks: Arc<dyn LockProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            projects,
            events,
            locks,
            clock,
        }
    }

    /// Runs `apply` on the stored project under the project lock and writes
    /// the result back if `apply` reports a change.
    async fn modify<F>(&self, project: &str, op: &'static str, apply: F) -> Result<ExpandedProject>
    where
        F: FnOnce(&mut ExpandedProject) -> Result<bool> + Send,
    {
        async {
            let guard = self.locks.lock(&LockKey::project(project)).await?;
            let mut doc = self
                .projects
                .get(project)
                .await?
                .ok_or_else(|| Error::not_found("project", project))?;
            if apply(&mut doc)? {
                doc.last_changed = self.clock.now();
                self.projects.put(&doc).await?;
            } else {
                tracing::debug!("project unchanged, skipping write");
            }
            guard.unlock();
            Ok(doc)
        }
        .instrument(project_span(op, project))
        .await
    }

    /// Stores a new project document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the project exists.
    pub async fn create_project(&self, project: &ExpandedProject) -> Result<()> {
        let _guard = self
            .locks
            .lock(&LockKey::project(&project.project_name))
            .await?;
        self.projects.create(project).await?;
        tracing::info!(project = %project.project_name, "created project");
        Ok(())
    }

    /// Reads a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    pub async fn get_project(&self, name: &str) -> Result<ExpandedProject> {
        self.projects
            .get(name)
            .await?
            .ok_or_else(|| Error::not_found("project", name))
    }

    /// Reads every project.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_projects(&self) -> Result<Vec<ExpandedProject>> {
        self.projects.get_all().await
    }

    /// Removes a project document; a missing project is not an error.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(&LockKey::project(name)).await?;
        if !self.projects.delete(name).await? {
            tracing::debug!(project = name, "project view already absent");
        }
        Ok(())
    }

    /// Replaces the stored shipyard text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn update_shipyard(&self, project: &str, shipyard: &str) -> Result<()> {
        self.modify(project, "update_shipyard", |doc| {
            if doc.shipyard == shipyard {
                return Ok(false);
            }
            doc.shipyard = shipyard.to_string();
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Records the upstream repository of a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn update_upstream_info(
        &self,
        project: &str,
        remote_uri: &str,
        user: &str,
    ) -> Result<()> {
        self.modify(project, "update_upstream_info", |doc| {
            if doc.git_remote_uri == remote_uri && doc.git_user == user {
                return Ok(false);
            }
            doc.git_remote_uri = remote_uri.to_string();
            doc.git_user = user.to_string();
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Adds a stage; an existing stage is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn create_stage(&self, project: &str, stage: &str) -> Result<()> {
        self.modify(project, "create_stage", |doc| {
            if doc.stage(stage).is_some() {
                return Ok(false);
            }
            doc.stages.push(ExpandedStage::new(stage));
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Removes a stage; a missing stage is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn delete_stage(&self, project: &str, stage: &str) -> Result<()> {
        self.modify(project, "delete_stage", |doc| {
            let Some(index) = doc.stages.iter().position(|s| s.stage_name == stage) else {
                return Ok(false);
            };
            doc.stages.remove(index);
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Adds a service to a stage; an existing service is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project or stage does not exist.
    pub async fn create_service(&self, project: &str, stage: &str, service: &str) -> Result<()> {
        let now = self.clock.now();
        self.modify(project, "create_service", |doc| {
            let found = doc
                .stage_mut(stage)
                .ok_or_else(|| Error::not_found("stage", stage))?;
            if found.service(service).is_some() {
                return Ok(false);
            }
            found.services.push(ExpandedService::new(service, now));
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Reads a service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project, stage or service is missing.
    pub async fn get_service(
        &self,
        project: &str,
        stage: &str,
        service: &str,
    ) -> Result<ExpandedService> {
        let doc = self.get_project(project).await?;
        let found = doc
            .stage(stage)
            .ok_or_else(|| Error::not_found("stage", stage))?;
        found
            .service(service)
            .cloned()
            .ok_or_else(|| Error::not_found("service", service))
    }

    /// Removes a service from a stage; a missing stage or service is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project does not exist.
    pub async fn delete_service(&self, project: &str, stage: &str, service: &str) -> Result<()> {
        self.modify(project, "delete_service", |doc| {
            let Some(found) = doc.stage_mut(stage) else {
                return Ok(false);
            };
            let Some(index) = found.services.iter().position(|s| s.service_name == service)
            else {
                return Ok(false);
            };
            found.services.remove(index);
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Folds a lifecycle event into its service.
    ///
    /// Records the event as the last of its type. For finished deployments,
    /// also records the image from the correlated triggered event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidScope`] if the event names no service and
    /// [`Error::NotFound`] if the project, stage or service is missing.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, id = %event.id))]
    pub async fn update_event_of_service(&self, event: &KeptnEvent) -> Result<()> {
        let data = event.base_data()?;
        if data.project.is_empty() || data.stage.is_empty() || data.service.is_empty() {
            return Err(Error::invalid_scope(
                "event must name project, stage and service",
            ));
        }

        let deployed_image = if event.event_type == task_event_type(DEPLOYMENT_TASK, EventKind::Finished)
        {
            self.deployed_image(&data.project, event).await?
        } else {
            None
        };

        let info = EventContextInfo {
            event_id: event.id.clone(),
            keptn_context: event.keptn_context.clone(),
            time: event.time.unwrap_or_else(|| self.clock.now()),
        };
        self.modify(&data.project, "update_event_of_service", |doc| {
            let service = doc
                .stage_mut(&data.stage)
                .ok_or_else(|| Error::not_found("stage", data.stage.clone()))?
                .service_mut(&data.service)
                .ok_or_else(|| Error::not_found("service", data.service.clone()))?;
            if let Some(image) = deployed_image {
                service.deployed_image = image;
            }
            service.last_event_types.insert(event.event_type.clone(), info);
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Image of the deployment that `finished` reports on.
    async fn deployed_image(&self, project: &str, finished: &KeptnEvent) -> Result<Option<String>> {
        let Some(triggered) = self
            .events
            .get_triggered_event(project, &finished.triggered_id, &finished.keptn_context)
            .await?
        else {
            tracing::warn!(
                triggered_id = %finished.triggered_id,
                "no deployment.triggered event found for finished deployment"
            );
            return Ok(None);
        };
        match TaskEventData::decode(&triggered)? {
            TaskEventData::Deployment(data) => Ok(data.image().map(str::to_string)),
            TaskEventData::Generic(_) => Ok(None),
        }
    }

    /// Records an open remediation for a service. A remediation already
    /// recorded for the same event is kept as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the project, stage or service is missing.
    pub async fn create_remediation(
        &self,
        project: &str,
        stage: &str,
        service: &str,
        remediation: Remediation,
    ) -> Result<()> {
        self.modify(project, "create_remediation", |doc| {
            let open = &mut service_of(doc, stage, service)?.open_remediations;
            if open.iter().any(|r| r.event_id == remediation.event_id) {
                return Ok(false);
            }
            open.push(remediation);
            Ok(true)
        })
        .await
        .map(drop)
    }

    /// Closes every open remediation of `keptn_context` on a service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing matched, which callers treat as
    /// already closed.
    pub async fn close_open_remediations(
        &self,
        project: &str,
        stage: &str,
        service: &str,
        keptn_context: &str,
    ) -> Result<()> {
        self.modify(project, "close_open_remediations", |doc| {
            let found = service_of(doc, stage, service)?;
            let before = found.open_remediations.len();
            found
                .open_remediations
                .retain(|r| r.keptn_context != keptn_context);
            if found.open_remediations.len() == before {
                return Err(Error::not_found("open remediation", keptn_context));
            }
            Ok(true)
        })
        .await
        .map(drop)
    }
}

fn service_of<'a>(
    doc: &'a mut ExpandedProject,
    stage: &str,
    service: &str,
) -> Result<&'a mut ExpandedService> {
    doc.stage_mut(stage)
        .ok_or_else(|| Error::not_found("stage", stage))?
        .service_mut(service)
        .ok_or_else(|| Error::not_found("service", service))
}
