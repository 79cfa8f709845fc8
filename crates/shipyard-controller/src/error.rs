//! Error types for the shipyard controller.

/// The result type used throughout shipyard-controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating sequences.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A project, stage, service, sequence or execution does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of the missing resource.
        resource: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The resource already exists (a redelivered trigger or queue entry).
    #[error("{resource} already exists: {id}")]
    AlreadyExists {
        /// Kind of the duplicated resource.
        resource: &'static str,
        /// Identifier of the duplicated resource.
        id: String,
    },

    /// A required scope field is missing on a write.
    #[error("invalid scope: {message}")]
    InvalidScope {
        /// What is missing.
        message: String,
    },

    /// The document store could not be reached within the reconnect deadline.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the connectivity failure.
        message: String,
    },

    /// The project view references something that does not exist.
    #[error("inconsistent state: {message}")]
    Inconsistent {
        /// Description of the inconsistency.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A task event reached a run that is paused; deliver it after resume.
    #[error("sequence paused: {keptn_context} in stage {stage}")]
    Paused {
        /// Run the event belongs to.
        keptn_context: String,
        /// Stage of the paused execution.
        stage: String,
    },

    /// A shipyard document could not be parsed or validated.
    #[error("invalid shipyard: {message}")]
    InvalidShipyard {
        /// Description of the problem.
        message: String,
    },

    /// An incoming event is malformed.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// Description of the problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// An error from shipyard-core.
    #[error("core error: {0}")]
    Core(#[from] shipyard_core::Error),
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Creates an already-exists error.
    #[must_use]
    pub fn already_exists(resource: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource,
            id: id.into(),
        }
    }

    /// Creates an invalid-scope error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope {
            message: message.into(),
        }
    }

    /// Creates an invalid-event error.
    #[must_use]
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::InvalidEvent {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true for [`Error::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`Error::AlreadyExists`].
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true for [`Error::Paused`].
    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused { .. })
    }

    /// Returns true when the caller may retry the operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::Storage { .. }
                | Self::Core(shipyard_core::Error::LockUnavailable { .. })
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
