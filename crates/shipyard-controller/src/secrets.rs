//! Secret store collaborator.
//!
//! The controller only writes one kind of secret: the upstream git
//! credentials of a project, stored as `git-credentials-<project>`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Named secrets holding string key/value pairs.
#[async_trait]
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Reads a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no secret has that name.
    async fn get_secret(&self, name: &str) -> Result<BTreeMap<String, String>>;

    /// Creates or replaces a secret.
    async fn set_secret(&self, name: &str, content: BTreeMap<String, String>) -> Result<()>;

    /// Deletes a secret. Deleting a missing secret succeeds.
    async fn delete_secret(&self, name: &str) -> Result<()>;
}

/// In-process secret store.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl InMemorySecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::storage("secret store lock poisoned")
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<BTreeMap<String, String>> {
        self.secrets
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("secret", name))
    }

    async fn set_secret(&self, name: &str, content: BTreeMap<String, String>) -> Result<()> {
        self.secrets
            .write()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), content);
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.secrets.write().map_err(|_| poisoned())?.remove(name);
        Ok(())
    }
}

/// Upstream repository credentials of a project.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GitCredentials {
    /// Remote URL.
    pub remote_uri: String,
    /// User name.
    pub user: String,
    /// Access token.
    pub token: String,
}

impl GitCredentials {
    /// Name of the secret holding the credentials of `project`.
    #[must_use]
    pub fn secret_name(project: &str) -> String {
        format!("git-credentials-{project}")
    }

    /// Converts to secret content.
    #[must_use]
    pub fn to_secret(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("git-remote-url".to_string(), self.remote_uri.clone()),
            ("git-user".to_string(), self.user.clone()),
            ("git-token".to_string(), self.token.clone()),
        ])
    }

    /// Reads credentials back from secret content.
    #[must_use]
    pub fn from_secret(content: &BTreeMap<String, String>) -> Self {
        let field = |key: &str| content.get(key).cloned().unwrap_or_default();
        Self {
            remote_uri: field("git-remote-url"),
            user: field("git-user"),
            token: field("git-token"),
        }
    }
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("remote_uri", &self.remote_uri)
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}
