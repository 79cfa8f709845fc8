//! Persistence of materialized project documents.
//!
//! Documents live in `keptnProjectsMV`, keyed by project name. This layer
//! only reads and writes whole documents; callers serialize read-modify-write
//! sequences with the project lock.

use super::{ConnectionManager, Filter, WriteResult};
use crate::error::{Error, Result};
use crate::project::ExpandedProject;

/// Collection holding project documents.
pub const PROJECTS_COLLECTION: &str = "keptnProjectsMV";

/// Repository for [`ExpandedProject`] documents.
#[derive(Debug, Clone)]
pub struct ProjectRepo {
    conn: ConnectionManager,
}

impl ProjectRepo {
    /// Creates a repository over `conn`.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Reads one project.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get(&self, name: &str) -> Result<Option<ExpandedProject>> {
        let store = self.conn.store().await?;
        store
            .get(PROJECTS_COLLECTION, name)
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .transpose()
    }

    /// Reads every project in creation order.
    ///
    /// # Errors
    ///
    /// Returns a store or decoding error.
    pub async fn get_all(&self) -> Result<Vec<ExpandedProject>> {
        let store = self.conn.store().await?;
        store
            .find(PROJECTS_COLLECTION, &Filter::all())
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    /// Stores a new project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the project exists.
    pub async fn create(&self, project: &ExpandedProject) -> Result<()> {
        let document = serde_json::to_value(project)?;
        let store = self.conn.store().await?;
        match store
            .insert(PROJECTS_COLLECTION, &project.project_name, document, None)
            .await?
        {
            WriteResult::Applied => Ok(()),
            WriteResult::AlreadyExists => {
                Err(Error::already_exists("project", project.project_name.clone()))
            }
        }
    }

    /// Replaces a project document.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn put(&self, project: &ExpandedProject) -> Result<()> {
        let document = serde_json::to_value(project)?;
        let store = self.conn.store().await?;
        store
            .upsert(PROJECTS_COLLECTION, &project.project_name, document)
            .await
    }

    /// Deletes a project document. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let store = self.conn.store().await?;
        store.delete(PROJECTS_COLLECTION, name).await
    }
}
