use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BackendKind, Budget, Limits};

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../timebox.example.toml");

/// Prefix of environment variables that override file values
pub const ENV_PREFIX: &str = "TIMEBOX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid budget: {0}")]
    InvalidBudget(String),

    #[error("backend '{0}' is not available on this platform")]
    BackendUnavailable(BackendKind),

    #[error("callable name cannot be resolved from {type_name}; give it an explicit name")]
    UnresolvableName { type_name: String },

    #[error("callable name must not be empty")]
    EmptyName,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for timebox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Wall-clock budget in seconds
    #[serde(default = "default_budget")]
    pub budget: f64,

    /// Backend used to enforce the budget
    #[serde(default)]
    pub backend: BackendKind,

    /// Seconds between the terminate signal and the forced kill of a worker
    #[serde(default = "default_kill_grace")]
    pub kill_grace: f64,

    /// Seconds the thread backend waits for a cancelled thread to return
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: f64,

    /// Worker reaping poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that relies only on built-in defaults
    pub fn builtin() -> Self {
        Self {
            budget: default_budget(),
            backend: BackendKind::default(),
            kill_grace: default_kill_grace(),
            cancel_grace: default_cancel_grace(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Replace the budget
    pub fn with_budget(mut self, seconds: f64) -> Self {
        self.budget = seconds;
        self
    }

    /// Replace the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Budget as a validated value
    pub fn budget(&self) -> Result<Budget, ConfigError> {
        Budget::from_secs_f64(self.budget)
    }

    /// Convert to the timing policy used by the backends
    pub fn limits(&self) -> Result<Limits, ConfigError> {
        Ok(Limits::new(self.budget()?)
            .with_kill_grace(grace("kill_grace", self.kill_grace)?)
            .with_cancel_grace(grace("cancel_grace", self.cancel_grace)?)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn grace(field: &str, seconds: f64) -> Result<Duration, ConfigError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{field} must be a non-negative number of seconds, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))
}

fn default_budget() -> f64 {
    5.0
}

fn default_kill_grace() -> f64 {
    Limits::DEFAULT_KILL_GRACE.as_secs_f64()
}

fn default_cancel_grace() -> f64 {
    Limits::DEFAULT_CANCEL_GRACE.as_secs_f64()
}

fn default_poll_interval_ms() -> u64 {
    Limits::DEFAULT_POLL_INTERVAL.as_millis() as u64
}
