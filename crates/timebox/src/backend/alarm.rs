//! OS interval alarm backend
//!
//! The callable runs on the caller's own thread under a one-shot
//! `ITIMER_REAL` timer. The `SIGALRM` handler only records expiry and, when the
//! kernel delivers the signal to some other thread, forwards it to the owning
//! thread so that a blocking system call there fails with `EINTR` (the handler
//! is installed without `SA_RESTART`). Cooperative code sees the expiry through
//! [`crate::checkpoint`].
//!
//! Those are the only two ways the alarm ends a call. Code that never reaches
//! a checkpoint and never blocks in a system call that returns `EINTR` (a CPU
//! loop, or [`std::thread::sleep`], which resumes after `EINTR`) runs to
//! completion and is reported as timed out only when it returns. An infinite
//! loop of that kind never returns at all.
//!
//! The timer and the signal disposition are process-wide, so the alarm is a
//! singleton: [`AlarmHandle::arm`] takes the owner slot or fails with
//! [`BackendError::AlarmBusy`], and dropping the handle disarms the timer and
//! restores the previous handler.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, instrument, warn};

use crate::backend::BackendError;
use crate::cancel::{self, Watch};
use crate::invocation::Invocation;
use crate::types::{Budget, Fate, Limits, Outcome, TimedOut};

/// Owner slot of the process-wide alarm
static OWNER: Mutex<()> = Mutex::new(());

/// Set by the signal handler once the armed alarm fired
static EXPIRED: AtomicBool = AtomicBool::new(false);

/// `pthread_t` of the owning thread, 0 while no alarm is armed
static OWNER_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Handlers currently running, possibly about to forward to the owner
static IN_HANDLER: AtomicUsize = AtomicUsize::new(0);

const SETTLE_ATTEMPTS: u32 = 50;
const SETTLE_STEP: Duration = Duration::from_millis(1);

/// Whether the currently armed alarm has fired
pub(crate) fn expired() -> bool {
    EXPIRED.load(Ordering::SeqCst)
}

extern "C" fn on_alarm(_signal: libc::c_int) {
    IN_HANDLER.fetch_add(1, Ordering::SeqCst);
    EXPIRED.store(true, Ordering::SeqCst);

    let owner = OWNER_THREAD.load(Ordering::SeqCst);
    if owner != 0 {
        // SAFETY: pthread_self and pthread_kill are async-signal-safe
        unsafe {
            if libc::pthread_self() as usize != owner {
                libc::pthread_kill(owner as libc::pthread_t, libc::SIGALRM);
            }
        }
    }
    IN_HANDLER.fetch_sub(1, Ordering::SeqCst);
}

/// An armed process-wide interval alarm
///
/// Owned by the thread that armed it. Dropping the handle disarms the timer,
/// lets an already pending `SIGALRM` reach our handler, and restores the
/// previous disposition.
#[derive(Debug)]
pub struct AlarmHandle {
    _slot: MutexGuard<'static, ()>,
    previous: SigAction,
    disarmed: bool,
    _not_send: PhantomData<*const ()>,
}

impl AlarmHandle {
    /// Take the alarm and arm it for `budget`
    pub fn arm(budget: Budget) -> Result<Self, BackendError> {
        let slot = match OWNER.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(BackendError::AlarmBusy),
        };

        EXPIRED.store(false, Ordering::SeqCst);
        // SAFETY: pthread_self has no preconditions
        OWNER_THREAD.store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics and async-signal-safe calls
        let previous = match unsafe { sigaction(Signal::SIGALRM, &action) } {
            Ok(previous) => previous,
            Err(errno) => {
                OWNER_THREAD.store(0, Ordering::SeqCst);
                return Err(BackendError::Alarm(io::Error::from(errno)));
            }
        };

        let handle = Self {
            _slot: slot,
            previous,
            disarmed: false,
            _not_send: PhantomData,
        };
        set_timer(budget.as_duration()).map_err(BackendError::Alarm)?;
        debug!(%budget, "alarm armed");
        Ok(handle)
    }

    /// Whether the alarm fired
    pub fn expired(&self) -> bool {
        expired()
    }

    /// Stop the timer; expiry observed so far is kept
    pub fn disarm(&mut self) {
        if self.disarmed {
            return;
        }
        if let Err(e) = set_timer(Duration::ZERO) {
            warn!(error = %e, "failed to disarm interval alarm");
        }
        self.disarmed = true;
    }
}

impl Drop for AlarmHandle {
    fn drop(&mut self) {
        self.disarm();
        // No new forwards after this; wait out the ones in flight
        OWNER_THREAD.store(0, Ordering::SeqCst);
        settle_pending();

        // SAFETY: restores the disposition that was installed before arming
        if let Err(errno) = unsafe { sigaction(Signal::SIGALRM, &self.previous) } {
            warn!(error = %errno, "failed to restore previous SIGALRM handler");
        }
        EXPIRED.store(false, Ordering::SeqCst);
        debug!("alarm released");
    }
}

/// Execute an invocation on the calling thread under the interval alarm
#[instrument(skip_all, fields(name = invocation.name(), budget = %limits.budget))]
pub fn execute<T, E>(
    invocation: Invocation<T, E>,
    limits: &Limits,
) -> Result<Outcome<T, E>, BackendError> {
    let name = invocation.name().to_owned();
    let mut alarm = AlarmHandle::arm(limits.budget)?;

    let outcome = {
        let _watch = cancel::enter(Watch::Alarm);
        invocation.run_catching()
    };

    // Disarm before looking at the flag so a late alarm cannot flip the result
    alarm.disarm();
    let expired = alarm.expired();
    drop(alarm);

    if expired {
        debug!(outcome = outcome.kind(), "alarm fired before the call returned");
        warn!("budget elapsed");
        return Ok(Outcome::TimedOut(TimedOut {
            name,
            budget: limits.budget,
            fate: Fate::Interrupted,
        }));
    }
    Ok(outcome)
}

fn set_timer(value: Duration) -> io::Result<()> {
    // A zero it_value disarms, so a non-zero budget must round up to 1us
    let value = if value.is_zero() {
        value
    } else {
        value.max(Duration::from_micros(1))
    };
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: value.as_secs() as libc::time_t,
            tv_usec: value.subsec_micros() as libc::suseconds_t,
        },
    };
    // SAFETY: timer points to a valid itimerval and the old value is not requested
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wait briefly for a `SIGALRM` that fired during disarm to be handled
fn settle_pending() {
    for _ in 0..SETTLE_ATTEMPTS {
        if IN_HANDLER.load(Ordering::SeqCst) == 0 && !alarm_pending() {
            return;
        }
        std::thread::sleep(SETTLE_STEP);
    }
    warn!("SIGALRM still pending while restoring the previous handler");
}

fn alarm_pending() -> bool {
    // SAFETY: sigset_t is plain data, initialised by sigemptyset before use
    unsafe {
        let mut pending: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut pending);
        if libc::sigpending(&mut pending) != 0 {
            return false;
        }
        libc::sigismember(&pending, libc::SIGALRM) == 1
    }
}
