use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Wall-clock budget for a single invocation
///
/// Always positive and finite. Constructing a zero, negative, NaN or infinite
/// budget is a configuration error, never a runtime timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Budget(Duration);

impl Budget {
    /// Create a budget from fractional seconds
    pub fn from_secs_f64(seconds: f64) -> Result<Self, ConfigError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ConfigError::InvalidBudget(format!(
                "budget must be a positive number of seconds, got {seconds}"
            )));
        }
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| ConfigError::InvalidBudget(format!("{seconds}s: {e}")))?;
        Self::new(duration)
    }

    /// Create a budget from a duration
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::InvalidBudget(
                "budget must be greater than zero".to_string(),
            ));
        }
        Ok(Self(duration))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }
}

impl TryFrom<f64> for Budget {
    type Error = ConfigError;

    fn try_from(seconds: f64) -> Result<Self, Self::Error> {
        Self::from_secs_f64(seconds)
    }
}

impl From<Budget> for f64 {
    fn from(budget: Budget) -> Self {
        budget.as_secs_f64()
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs_f64())
    }
}

/// Timing policy shared by every backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Wall-clock budget of one invocation
    pub budget: Budget,

    /// Time between the graceful terminate signal and the forced kill of a worker
    pub kill_grace: Duration,

    /// Time the thread backend waits for a cancelled thread to return
    pub cancel_grace: Duration,

    /// Granularity of worker reaping loops
    pub poll_interval: Duration,
}

impl Limits {
    pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
    pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(50);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Create limits with the given budget and default grace periods
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            kill_grace: Self::DEFAULT_KILL_GRACE,
            cancel_grace: Self::DEFAULT_CANCEL_GRACE,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the terminate-to-kill escalation delay
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Set how long a cancelled thread may take to acknowledge
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set the reaping poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Strategy used to enforce the budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run on a dedicated thread, signal cancellation and stop waiting on expiry
    #[default]
    Thread,

    /// Run on the caller's thread under a one-shot `SIGALRM` interval timer
    ///
    /// Expiry only ends the call at a checkpoint or at a system call that
    /// fails with `EINTR`. Anything else runs to completion before the
    /// timeout is reported.
    Alarm,

    /// Run in a forked worker process that is killed on expiry
    Isolated,
}

impl BackendKind {
    /// Every backend, in order of increasing isolation
    pub const ALL: [BackendKind; 3] = [Self::Thread, Self::Alarm, Self::Isolated];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Alarm => "alarm",
            Self::Isolated => "isolated",
        }
    }

    /// Check if the backend can be used on this platform
    pub fn is_available(&self) -> bool {
        match self {
            Self::Thread => true,
            Self::Alarm | Self::Isolated => cfg!(unix),
        }
    }

    /// Whether a timed-out call is guaranteed to stop consuming resources
    pub fn guarantees_kill(&self) -> bool {
        matches!(self, Self::Isolated)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "alarm" | "signal" => Ok(Self::Alarm),
            "isolated" | "process" => Ok(Self::Isolated),
            other => Err(ConfigError::Invalid(format!("unknown backend '{other}'"))),
        }
    }
}

/// What became of the execution unit of a timed-out invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fate {
    /// The worker process was terminated and reaped
    Killed,

    /// The worker process died without reporting an outcome
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// The thread observed cancellation and returned within the grace period
    Cancelled,

    /// The thread is still running in the background
    Abandoned,

    /// The alarm expired on the caller's own thread
    Interrupted,
}

impl Fate {
    /// Whether the execution unit is known to have stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }
}

impl fmt::Display for Fate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Killed => f.write_str("worker killed"),
            Self::Crashed {
                exit_code: Some(code),
                ..
            } => write!(f, "worker exited with code {code} without a result"),
            Self::Crashed {
                signal: Some(signal),
                ..
            } => write!(f, "worker died from signal {signal} without a result"),
            Self::Crashed { .. } => f.write_str("worker died without a result"),
            Self::Cancelled => f.write_str("thread cancelled"),
            Self::Abandoned => f.write_str("thread still running"),
            Self::Interrupted => f.write_str("interrupted by alarm"),
        }
    }
}

/// Timeout of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("\"{name}\" takes more than {budget} to run ({fate})")]
pub struct TimedOut {
    /// Identifying name of the wrapped callable
    pub name: String,

    /// Configured budget
    pub budget: Budget,

    /// What became of the execution unit
    pub fate: Fate,
}

/// Result of executing one invocation on a backend
///
/// Produced exactly once per invocation and consumed by the adapter.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The callable returned a value
    Success(T),

    /// The callable returned an error
    Failure(E),

    /// The callable panicked; the payload is re-raised unchanged
    Panicked(Box<dyn Any + Send>),

    /// The budget elapsed first
    TimedOut(TimedOut),
}

impl<T, E> Outcome<T, E> {
    /// Build an outcome from the callable's own result
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Failure(error),
        }
    }

    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Panicked(_) => "panicked",
            Self::TimedOut(_) => "timed_out",
        }
    }
}
