//! Timeout enforcement backends
//!
//! Every backend takes one [`Invocation`] and the [`Limits`] it runs under and
//! produces exactly one [`Outcome`]. Whatever the backend allocated for the
//! call (a thread, an armed alarm, a worker process) is reclaimed before it
//! returns, on every path.
//!
//! - [`thread`]: cooperative, the call runs on its own thread and is abandoned
//!   if it ignores cancellation.
//! - [`alarm`]: cooperative, the call runs on the caller's thread under a
//!   `SIGALRM` interval timer (unix).
//! - [`isolated`]: the call runs in a forked worker that is killed on expiry
//!   (unix).

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::invocation::Invocation;
use crate::types::{BackendKind, Limits, Outcome};

#[cfg(unix)]
pub mod alarm;
#[cfg(unix)]
pub mod isolated;
pub mod thread;
#[cfg(unix)]
mod report;
#[cfg(unix)]
mod worker;

#[cfg(unix)]
pub use crate::backend::alarm::AlarmHandle;
#[cfg(unix)]
pub use crate::backend::worker::{ExitInfo, WorkerHandle, WorkerState, in_worker};

/// Errors of the enforcement facility itself
///
/// These happen before or around the callable, never because of it: the
/// callable's own errors always travel inside the [`Outcome`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn worker thread: {0}")]
    SpawnThread(#[source] std::io::Error),

    #[error("failed to create result channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("failed to fork worker process: {0}")]
    Fork(#[source] std::io::Error),

    #[error("failed to wait for worker {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal worker {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("interval alarm is already owned by another invocation")]
    AlarmBusy,

    #[error("failed to arm interval alarm: {0}")]
    Alarm(#[source] std::io::Error),

    #[error("backend '{0}' is not available on this platform")]
    Unavailable(BackendKind),

    #[error("backend '{0}' sends results across a process boundary; call it with `call_transported`")]
    NeedsTransport(BackendKind),
}

/// Run `invocation` on a backend that keeps it in this process
///
/// Results never leave the address space, so any `Send` value or error works.
/// [`BackendKind::Isolated`] is rejected with [`BackendError::NeedsTransport`].
pub fn dispatch_local<T, E>(
    kind: BackendKind,
    invocation: Invocation<T, E>,
    limits: &Limits,
) -> Result<Outcome<T, E>, BackendError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    match kind {
        BackendKind::Thread => thread::execute(invocation, limits),
        #[cfg(unix)]
        BackendKind::Alarm => alarm::execute(invocation, limits),
        #[cfg(not(unix))]
        BackendKind::Alarm => Err(BackendError::Unavailable(kind)),
        BackendKind::Isolated => Err(BackendError::NeedsTransport(kind)),
    }
}

/// Run `invocation` on any backend, serializing the outcome where needed
pub fn dispatch<T, E>(
    kind: BackendKind,
    invocation: Invocation<T, E>,
    limits: &Limits,
) -> Result<Outcome<T, E>, BackendError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    E: Serialize + DeserializeOwned + Send + 'static,
{
    match kind {
        #[cfg(unix)]
        BackendKind::Isolated => isolated::execute(invocation, limits),
        #[cfg(not(unix))]
        BackendKind::Isolated => Err(BackendError::Unavailable(kind)),
        local => dispatch_local(local, invocation, limits),
    }
}
