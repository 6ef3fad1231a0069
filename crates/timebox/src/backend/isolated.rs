//! Isolated worker backend
//!
//! The invocation runs in a forked child process. The child inherits the
//! callable and its arguments through the fork, runs it, and sends the outcome
//! back as a JSON [`Report`] over a pipe. The parent waits for the report
//! until the deadline; on expiry the worker is terminated and reaped, so a
//! timed-out call never keeps consuming resources.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::{ForkResult, fork, pipe};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::backend::BackendError;
use crate::backend::report::{self, Progress, Report};
use crate::backend::worker::{self, WorkerHandle};
use crate::invocation::Invocation;
use crate::types::{Fate, Limits, Outcome, TimedOut};

/// Exit status of a worker that could not write its report
const EXIT_REPORT_FAILED: i32 = 70;

/// Execute an invocation in a forked worker process, bounded by the budget
#[instrument(skip_all, fields(name = invocation.name(), budget = %limits.budget))]
pub fn execute<T, E>(
    invocation: Invocation<T, E>,
    limits: &Limits,
) -> Result<Outcome<T, E>, BackendError>
where
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
{
    // No logging on this path: it runs in a forked child
    if worker::in_worker() {
        return Ok(invocation.run_catching());
    }

    let name = invocation.name().to_owned();
    let deadline = Instant::now() + limits.budget.as_duration();

    let (read_fd, write_fd) = pipe().map_err(|e| BackendError::Channel(e.into()))?;
    set_cloexec(&read_fd)?;
    set_cloexec(&write_fd)?;

    // SAFETY: the child only runs the invocation, writes its report and calls _exit
    let forked = unsafe { fork() }.map_err(|e| BackendError::Fork(e.into()))?;
    let child = match forked {
        ForkResult::Child => {
            drop(read_fd);
            run_worker(invocation, write_fd)
        }
        ForkResult::Parent { child } => child,
    };
    drop(write_fd);
    drop(invocation);

    let mut worker = WorkerHandle::new(child);
    debug!(pid = worker.pid(), "worker started");

    let mut pipe = File::from(read_fd);
    let received = wait_report(&mut pipe, &mut worker, deadline, limits.poll_interval)?;

    let Some(bytes) = received else {
        let info = worker.terminate(limits.kill_grace, limits.poll_interval)?;
        warn!(pid = worker.pid(), ?info, "budget elapsed, worker killed");
        return Ok(Outcome::TimedOut(TimedOut {
            name,
            budget: limits.budget,
            fate: Fate::Killed,
        }));
    };

    let report = serde_json::from_slice::<Report<T, E>>(&bytes);
    let info = match worker.reap_until(deadline, limits.poll_interval)? {
        Some(info) => info,
        None => {
            let info = worker.terminate(limits.kill_grace, limits.poll_interval)?;
            warn!(pid = worker.pid(), ?info, "worker outlived its result pipe, killed");
            if report.is_err() {
                return Ok(Outcome::TimedOut(TimedOut {
                    name,
                    budget: limits.budget,
                    fate: Fate::Killed,
                }));
            }
            info
        }
    };
    match report {
        Ok(report) => {
            debug!(pid = worker.pid(), "worker reported");
            Ok(report.into_outcome())
        }
        Err(e) => {
            let fate = info.crashed();
            if bytes.is_empty() {
                warn!(pid = worker.pid(), %fate, "worker exited without a report");
            } else {
                warn!(pid = worker.pid(), %fate, error = %e, "worker sent an unreadable report");
            }
            Ok(Outcome::TimedOut(TimedOut {
                name,
                budget: limits.budget,
                fate,
            }))
        }
    }
}

/// Collect the worker's report, `None` if the deadline passes first
///
/// End of file is the normal signal. The worker exiting also ends the wait:
/// a concurrent fork elsewhere in the process can inherit the write end and
/// keep the pipe open after the worker is gone.
fn wait_report(
    pipe: &mut File,
    worker: &mut WorkerHandle,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<Option<Vec<u8>>, BackendError> {
    let poll_interval = poll_interval.max(Duration::from_millis(1));
    let mut buf = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let progress = report::read_some(pipe, &mut buf, remaining.min(poll_interval))
            .map_err(BackendError::Channel)?;
        match progress {
            Progress::Eof => return Ok(Some(buf)),
            Progress::Open => {
                if worker.try_reap()?.is_some() {
                    report::drain(pipe, &mut buf).map_err(BackendError::Channel)?;
                    return Ok(Some(buf));
                }
            }
        }
    }
}

/// Body of the forked child; never returns
///
/// Nothing here may log: the parent's subscriber state is not usable after fork.
fn run_worker<T, E>(invocation: Invocation<T, E>, pipe: OwnedFd) -> !
where
    T: Serialize,
    E: Serialize,
{
    worker::mark_worker();
    let report = Report::from_outcome(invocation.run_catching());

    let mut writer = BufWriter::new(File::from(pipe));
    let code = match serde_json::to_writer(&mut writer, &report)
        .map_err(std::io::Error::from)
        .and_then(|()| writer.flush())
    {
        Ok(()) => 0,
        Err(_) => EXIT_REPORT_FAILED,
    };

    // SAFETY: _exit skips destructors and atexit handlers inherited from the parent
    unsafe { libc::_exit(code) }
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), BackendError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(drop)
        .map_err(|e| BackendError::Channel(e.into()))
}
