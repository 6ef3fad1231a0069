//! Cooperative cancellation
//!
//! Cooperative backends cannot stop a running callable; they can only tell it
//! that its budget is gone. Long-running code observes that through
//! [`checkpoint`] or [`is_cancelled`], which read the watch installed for the
//! current thread by the backend executing it. Outside of a timed call both
//! report "not cancelled".

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned by [`checkpoint`] once the budget of the current call has elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("invocation cancelled: its budget elapsed")]
pub struct Cancelled;

/// Shared cancellation flag of one invocation
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`Cancelled`] if cancellation was requested
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Source of cancellation for the current thread
#[derive(Debug, Clone)]
pub(crate) enum Watch {
    Token(CancelToken),
    #[cfg(unix)]
    Alarm,
}

impl Watch {
    fn is_cancelled(&self) -> bool {
        match self {
            Self::Token(token) => token.is_cancelled(),
            #[cfg(unix)]
            Self::Alarm => crate::backend::alarm::expired(),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Watch>> = const { RefCell::new(None) };
}

/// Restores the previous watch of the thread when dropped
#[derive(Debug)]
pub(crate) struct WatchGuard {
    previous: Option<Watch>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Install `watch` for the current thread until the guard is dropped
pub(crate) fn enter(watch: Watch) -> WatchGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(watch));
    WatchGuard { previous }
}

/// Check if the budget of the call running on this thread has elapsed
pub fn is_cancelled() -> bool {
    CURRENT.with(|current| current.borrow().as_ref().is_some_and(Watch::is_cancelled))
}

/// Cancellation point for cooperative code
///
/// Returns `Err(Cancelled)` once the budget of the call running on this thread
/// has elapsed. Callables that loop or block in small steps should call this
/// between steps so the thread and alarm backends can actually stop them.
pub fn checkpoint() -> Result<(), Cancelled> {
    if is_cancelled() { Err(Cancelled) } else { Ok(()) }
}
