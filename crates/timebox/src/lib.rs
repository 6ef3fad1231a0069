//! Wall-clock timeouts for single calls.
//!
//! Timebox wraps an ordinary callable so that every call either returns what
//! the callable returned or fails with a timeout naming the callable and its
//! budget. Enforcement is pluggable:
//!
//! - **Thread**: the call runs on its own thread; on expiry the call is
//!   flagged as cancelled and, if it does not stop, abandoned.
//! - **Alarm**: the call runs on the caller's thread under a `SIGALRM`
//!   interval timer that interrupts blocking system calls (unix). Code that
//!   neither checks nor blocks runs to completion first.
//! - **Isolated**: the call runs in a forked worker process that is killed on
//!   expiry (unix). Results cross a pipe, so these calls go through
//!   [`Wrapped::call_transported`].
//! - **Commands**: external programs run under the same limits with live
//!   output streaming.
//! - **TOML configuration**: budget, backend and grace periods with
//!   `TIMEBOX_*` environment overrides.
//!
//! Cooperative backends cannot preempt Rust code. Long-running callables
//! should call [`checkpoint`] between steps.

pub use backend::BackendError;
pub use cancel::{CancelToken, Cancelled, checkpoint, is_cancelled};
pub use command::{
    CommandError, CommandEvent, CommandEventStream, CommandReport, CommandSpec, run_command,
};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use invocation::Invocation;
pub use timeout::{CallError, Timeout, Wrapped, with_timeout};
pub use types::{BackendKind, Budget, Fate, Limits, Outcome, TimedOut};

pub mod backend;
pub mod cancel;
pub mod command;
pub mod config;
pub mod invocation;
pub mod timeout;
pub mod types;
