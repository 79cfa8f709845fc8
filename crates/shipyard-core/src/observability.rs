//! Logging initialisation and span helpers.
//!
//! Every shipyard component logs through `tracing`. Binaries call
//! [`init_logging`] once at startup; library code only creates spans and
//! events, so tests can install their own subscriber.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// Levels come from `RUST_LOG` and default to `info`.
///
/// ```rust
/// use shipyard_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Span for work on one sequence run.
#[must_use]
pub fn sequence_span(operation: &str, project: &str, keptn_context: &str) -> Span {
    tracing::info_span!(
        "sequence",
        op = operation,
        project = project,
        keptn_context = keptn_context,
    )
}

/// Span for work on a project document.
#[must_use]
pub fn project_span(operation: &str, project: &str) -> Span {
    tracing::info_span!("project", op = operation, project = project)
}
