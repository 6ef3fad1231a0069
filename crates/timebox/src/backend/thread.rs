//! Cross-context interrupt backend
//!
//! The callable runs on a dedicated thread (the target context) while the
//! calling thread (the controlling context) holds the deadline. On expiry the
//! controller raises the invocation's cancellation flag, gives the target a
//! short grace period to acknowledge, and then returns the timeout no matter
//! what. A target that never reaches a checkpoint keeps running detached.
//!
//! The outcome channel holds a single slot and is drained by exactly one
//! receive that wins the race: a result that arrives after the deadline has
//! claimed the call is dropped, and the cancellation flag is only raised on the
//! timeout path, so a completed call can never be cancelled after the fact.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};

use tracing::{debug, instrument, warn};

use crate::backend::BackendError;
use crate::cancel::{self, CancelToken, Watch};
use crate::invocation::Invocation;
use crate::types::{Fate, Limits, Outcome, TimedOut};

/// Execute an invocation on its own thread, bounded by the budget
#[instrument(skip_all, fields(name = invocation.name(), budget = %limits.budget))]
pub fn execute<T, E>(
    invocation: Invocation<T, E>,
    limits: &Limits,
) -> Result<Outcome<T, E>, BackendError>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let name = invocation.name().to_owned();
    let token = CancelToken::new();
    let (tx, rx) = mpsc::sync_channel(1);

    let target_token = token.clone();
    let handle = thread::Builder::new()
        .name(format!("timebox:{name}"))
        .spawn(move || {
            let _watch = cancel::enter(Watch::Token(target_token));
            // The receiver is gone once the controller abandoned the call
            let _ = tx.send(invocation.run_catching());
        })
        .map_err(BackendError::SpawnThread)?;

    debug!("deadline armed");

    match rx.recv_timeout(limits.budget.as_duration()) {
        Ok(outcome) => {
            debug!(outcome = outcome.kind(), "completed within budget");
            join(handle);
            Ok(outcome)
        }
        Err(RecvTimeoutError::Timeout) => {
            token.cancel();
            let fate = match rx.recv_timeout(limits.cancel_grace) {
                Ok(late) => {
                    debug!(outcome = late.kind(), "discarding result that missed the deadline");
                    join(handle);
                    Fate::Cancelled
                }
                Err(RecvTimeoutError::Disconnected) => {
                    join(handle);
                    Fate::Cancelled
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("thread ignored cancellation, leaving it running in the background");
                    Fate::Abandoned
                }
            };
            warn!(%fate, "budget elapsed");
            Ok(Outcome::TimedOut(TimedOut {
                name,
                budget: limits.budget,
                fate,
            }))
        }
        Err(RecvTimeoutError::Disconnected) => {
            // run_catching never unwinds, so this only happens if the send itself failed
            join(handle);
            Ok(Outcome::TimedOut(TimedOut {
                name,
                budget: limits.budget,
                fate: Fate::Crashed {
                    exit_code: None,
                    signal: None,
                },
            }))
        }
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("timebox thread panicked outside of the invocation");
    }
}
