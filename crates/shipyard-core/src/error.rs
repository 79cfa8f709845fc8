//! Error types and result aliases shared by shipyard crates.

/// The result type used throughout shipyard-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lock could not be acquired.
    #[error("lock unavailable for key {key}: {message}")]
    LockUnavailable {
        /// The key that could not be locked.
        key: String,
        /// Why acquisition failed.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unavailable_display_names_key() {
        let err = Error::LockUnavailable {
            key: "sockshop".into(),
            message: "timed out".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sockshop"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn internal_helper_builds_variant() {
        assert!(matches!(Error::internal("boom"), Error::Internal { .. }));
    }
}
