//! Controller configuration.
//!
//! Defaults suit local development. Deployments override them through
//! `SHIPYARD_*` environment variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SHIPYARD_LOG_FORMAT` | `pretty` |
//! | `SHIPYARD_DRAIN_INTERVAL_SECS` | `10` |
//! | `SHIPYARD_STORE_RECONNECT_TIMEOUT_MS` | `5000` |
//! | `SHIPYARD_STORE_RECONNECT_BACKOFF_MS` | `50` |
//! | `SHIPYARD_EVENT_SOURCE` | `shipyard-controller` |
//! | `SHIPYARD_CHECK_UNIQUE_TRIGGERED_ID` | `true` |
//! | `SHIPYARD_SHIPYARD_DIR` | unset |

use std::path::PathBuf;
use std::time::Duration;

use shipyard_core::LogFormat;

use crate::error::{Error, Result};

/// Default `source` attribute of outgoing events.
pub const DEFAULT_EVENT_SOURCE: &str = "shipyard-controller";

/// Runtime configuration of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Log output format.
    pub log_format: LogFormat,
    /// How often the queue drain loop runs.
    pub drain_interval: Duration,
    /// Upper bound on re-establishing a lost store connection.
    pub store_reconnect_timeout: Duration,
    /// First backoff step between reconnect attempts; doubles per attempt.
    pub store_reconnect_backoff: Duration,
    /// `source` attribute of events emitted by the controller.
    pub event_source: String,
    /// Reject a second sequence trigger carrying an already-seen event id.
    pub check_unique_triggered_id: bool,
    /// Directory holding `<project>/shipyard.yaml` files.
    pub shipyard_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            drain_interval: Duration::from_secs(10),
            store_reconnect_timeout: Duration::from_millis(5_000),
            store_reconnect_backoff: Duration::from_millis(50),
            event_source: DEFAULT_EVENT_SOURCE.to_string(),
            check_unique_triggered_id: true,
            shipyard_dir: None,
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a variable is set but malformed,
    /// or when the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`ControllerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(format) = env.string("SHIPYARD_LOG_FORMAT") {
            config.log_format = format.parse().map_err(|e: shipyard_core::Error| {
                Error::configuration(format!("SHIPYARD_LOG_FORMAT: {e}"))
            })?;
        }
        if let Some(secs) = env.u64("SHIPYARD_DRAIN_INTERVAL_SECS")? {
            config.drain_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env.u64("SHIPYARD_STORE_RECONNECT_TIMEOUT_MS")? {
            config.store_reconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("SHIPYARD_STORE_RECONNECT_BACKOFF_MS")? {
            config.store_reconnect_backoff = Duration::from_millis(ms);
        }
        if let Some(source) = env.string("SHIPYARD_EVENT_SOURCE") {
            config.event_source = source;
        }
        if let Some(check) = env.bool("SHIPYARD_CHECK_UNIQUE_TRIGGERED_ID")? {
            config.check_unique_triggered_id = check;
        }
        config.shipyard_dir = env.string("SHIPYARD_SHIPYARD_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.drain_interval.is_zero() {
            return Err(Error::configuration(
                "SHIPYARD_DRAIN_INTERVAL_SECS must be greater than zero",
            ));
        }
        if self.store_reconnect_backoff.is_zero() {
            return Err(Error::configuration(
                "SHIPYARD_STORE_RECONNECT_BACKOFF_MS must be greater than zero",
            ));
        }
        if self.store_reconnect_backoff > self.store_reconnect_timeout {
            return Err(Error::configuration(
                "SHIPYARD_STORE_RECONNECT_BACKOFF_MS must not exceed SHIPYARD_STORE_RECONNECT_TIMEOUT_MS",
            ));
        }
        if self.event_source.trim().is_empty() {
            return Err(Error::configuration("SHIPYARD_EVENT_SOURCE must not be empty"));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
