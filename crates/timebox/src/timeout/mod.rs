//! Timeout wrapper
//!
//! [`with_timeout`] builds a [`Timeout`] factory; [`Timeout::wrap`] turns a
//! callable into a [`Wrapped`] callable with the same signature whose result
//! also carries the timeout case.
//!
//! ```rust,ignore
//! fn fetch(id: u32) -> Result<String, String> { /* ... */ }
//!
//! let fetch = with_timeout(2.0)?.backend(BackendKind::Isolated).wrap(fetch)?;
//! match fetch.call_transported(7) {
//!     Ok(body) => println!("{body}"),
//!     Err(CallError::TimedOut(timeout)) => eprintln!("{timeout}"),
//!     Err(e) => eprintln!("fetch failed: {e}"),
//! }
//! ```

use std::fmt;
use std::panic;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{self, BackendError};
use crate::config::{Config, ConfigError};
use crate::invocation::{Invocation, resolve_name};
use crate::types::{BackendKind, Budget, Limits, Outcome, TimedOut};

/// Errors returned by a wrapped call
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The budget elapsed before the callable returned
    #[error(transparent)]
    TimedOut(#[from] TimedOut),

    /// The callable returned this error within the budget
    #[error("{0}")]
    Failed(E),

    /// The backend failed before or around the callable
    #[error("timeout backend failed: {0}")]
    Backend(#[from] BackendError),
}

impl<E> CallError<E> {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    pub fn timed_out(&self) -> Option<&TimedOut> {
        match self {
            Self::TimedOut(timeout) => Some(timeout),
            _ => None,
        }
    }

    /// The callable's own error, if that is what ended the call
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Build a timeout factory from a budget in seconds
///
/// Zero, negative and non-finite budgets are rejected here, before anything
/// is wrapped or invoked.
pub fn with_timeout(seconds: f64) -> Result<Timeout, ConfigError> {
    Ok(Timeout::new(Budget::from_secs_f64(seconds)?))
}

/// Timeout policy applied to wrapped callables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeout {
    limits: Limits,
    backend: BackendKind,
}

impl Timeout {
    /// Create a policy with the default backend and grace periods
    pub fn new(budget: Budget) -> Self {
        Self {
            limits: Limits::new(budget),
            backend: BackendKind::default(),
        }
    }

    /// Create a policy from a loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            limits: config.limits()?,
            backend: config.backend,
        })
    }

    /// Select the enforcement backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the timing policy, budget included
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn budget(&self) -> Budget {
        self.limits.budget
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend
    }

    /// Wrap a callable, naming it after its type path
    ///
    /// Fails with [`ConfigError::UnresolvableName`] for function pointers and
    /// other callables without a path; use [`Timeout::wrap_named`] for those.
    pub fn wrap<F>(&self, func: F) -> Result<Wrapped<F>, ConfigError> {
        let name = resolve_name::<F>().ok_or_else(|| ConfigError::UnresolvableName {
            type_name: std::any::type_name::<F>().to_string(),
        })?;
        self.wrap_named(name, func)
    }

    /// Wrap a callable under an explicit name
    pub fn wrap_named<F>(&self, name: impl Into<String>, func: F) -> Result<Wrapped<F>, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if !self.backend.is_available() {
            return Err(ConfigError::BackendUnavailable(self.backend));
        }
        debug!(%name, budget = %self.limits.budget, backend = %self.backend, "wrapped callable");
        Ok(Wrapped {
            name: name.into(),
            func: Arc::new(func),
            limits: self.limits,
            backend: self.backend,
        })
    }
}

/// A callable bound to a timeout policy
///
/// Cheap to clone; clones share the callable. Every call is independent: it
/// gets its own execution unit, which is reclaimed before the call returns.
pub struct Wrapped<F> {
    name: Arc<str>,
    func: Arc<F>,
    limits: Limits,
    backend: BackendKind,
}

impl<F> Wrapped<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> Budget {
        self.limits.budget
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Call the wrapped callable with `args` under the budget
    ///
    /// Returns the callable's value or its error unchanged, or
    /// [`CallError::TimedOut`] once the budget elapsed. A panic inside the
    /// callable is resumed on the calling thread.
    ///
    /// The result stays in this process, so any `Send` value or error works.
    /// Wrappers on [`BackendKind::Isolated`] fail with
    /// [`BackendError::NeedsTransport`]; use [`Wrapped::call_transported`].
    pub fn call<A, T, E>(&self, args: A) -> Result<T, CallError<E>>
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let invocation = Invocation::bind(self.name.clone(), self.func.clone(), args);
        debug!(name = %self.name, backend = %self.backend, "dispatching call");
        self.settle(backend::dispatch_local(self.backend, invocation, &self.limits)?)
    }

    /// Call the wrapped callable on any backend, the isolated one included
    ///
    /// Same contract as [`Wrapped::call`], but the value and error must
    /// serialize since the isolated worker sends them back over a pipe. There
    /// a panic payload is reduced to its message.
    pub fn call_transported<A, T, E>(&self, args: A) -> Result<T, CallError<E>>
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Serialize + DeserializeOwned + Send + 'static,
    {
        let invocation = Invocation::bind(self.name.clone(), self.func.clone(), args);
        debug!(name = %self.name, backend = %self.backend, "dispatching transported call");
        self.settle(backend::dispatch(self.backend, invocation, &self.limits)?)
    }

    fn settle<T, E>(&self, outcome: Outcome<T, E>) -> Result<T, CallError<E>> {
        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(CallError::Failed(error)),
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
            Outcome::TimedOut(timeout) => {
                warn!(name = %timeout.name, budget = %timeout.budget, fate = %timeout.fate, "call timed out");
                Err(CallError::TimedOut(timeout))
            }
        }
    }
}

impl<F> Clone for Wrapped<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
            limits: self.limits,
            backend: self.backend,
        }
    }
}

impl<F> fmt::Debug for Wrapped<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapped")
            .field("name", &self.name)
            .field("budget", &self.limits.budget)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
