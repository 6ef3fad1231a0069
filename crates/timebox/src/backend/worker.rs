//! Worker process lifecycle
//!
//! A [`WorkerHandle`] owns one forked child. It reaps the child on every path:
//! explicitly through [`WorkerHandle::reap`] or [`WorkerHandle::terminate`], and
//! as a last resort on drop, where a still running worker is killed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::types::Fate;

static IN_WORKER: AtomicBool = AtomicBool::new(false);

/// Whether the current process is an isolated worker
///
/// Nested isolated calls inside a worker run inline instead of forking again.
pub fn in_worker() -> bool {
    IN_WORKER.load(Ordering::SeqCst)
}

pub(crate) fn mark_worker() {
    IN_WORKER.store(true, Ordering::SeqCst);
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self {
                exit_code: Some(code),
                signal: None,
            }),
            WaitStatus::Signaled(_, signal, _) => Some(Self {
                exit_code: None,
                signal: Some(signal as i32),
            }),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Fate of a worker that ended this way without reporting an outcome
    pub fn crashed(&self) -> Fate {
        Fate::Crashed {
            exit_code: self.exit_code,
            signal: self.signal,
        }
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Exited on its own and was reaped
    Exited(ExitInfo),
    /// Terminated by us and reaped
    Killed(ExitInfo),
}

/// Handle to a forked worker process
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Pid,
    state: WorkerState,
}

impl WorkerHandle {
    pub(crate) fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: WorkerState::Running,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Reap the worker if it already exited
    pub fn try_reap(&mut self) -> Result<Option<ExitInfo>, BackendError> {
        if let Some(info) = self.finished() {
            return Ok(Some(info));
        }
        let info = self.wait(Some(WaitPidFlag::WNOHANG))?;
        if let Some(info) = info {
            self.state = WorkerState::Exited(info);
        }
        Ok(info)
    }

    /// Block until the worker exits
    pub fn reap(&mut self) -> Result<ExitInfo, BackendError> {
        if let Some(info) = self.finished() {
            return Ok(info);
        }
        let info = self.wait_blocking()?;
        self.state = WorkerState::Exited(info);
        debug!(pid = self.pid(), ?info, "worker reaped");
        Ok(info)
    }

    /// Wait for the worker to exit until `deadline`, `None` if it is still running
    pub fn reap_until(
        &mut self,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Option<ExitInfo>, BackendError> {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        loop {
            if let Some(info) = self.try_reap()? {
                return Ok(Some(info));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            thread::sleep(poll_interval.min(remaining));
        }
    }

    /// Stop the worker: `SIGTERM`, up to `grace` to exit, then `SIGKILL`
    pub fn terminate(
        &mut self,
        grace: Duration,
        poll_interval: Duration,
    ) -> Result<ExitInfo, BackendError> {
        if let Some(info) = self.finished() {
            return Ok(info);
        }

        self.signal(Signal::SIGTERM)?;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let deadline = Instant::now() + grace;
        loop {
            if let Some(info) = self.wait(Some(WaitPidFlag::WNOHANG))? {
                self.state = WorkerState::Killed(info);
                debug!(pid = self.pid(), ?info, "worker terminated");
                return Ok(info);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(poll_interval.min(remaining));
        }

        warn!(pid = self.pid(), "worker ignored SIGTERM, sending SIGKILL");
        self.signal(Signal::SIGKILL)?;
        let info = self.wait_blocking()?;
        self.state = WorkerState::Killed(info);
        Ok(info)
    }

    fn finished(&self) -> Option<ExitInfo> {
        match self.state {
            WorkerState::Running => None,
            WorkerState::Exited(info) | WorkerState::Killed(info) => Some(info),
        }
    }

    fn signal(&self, signal: Signal) -> Result<(), BackendError> {
        match signal::kill(self.pid, signal) {
            // Already gone, the following wait collects it
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(BackendError::Signal {
                pid: self.pid(),
                source: io::Error::from(errno),
            }),
        }
    }

    fn wait(&self, flags: Option<WaitPidFlag>) -> Result<Option<ExitInfo>, BackendError> {
        loop {
            match waitpid(self.pid, flags) {
                Ok(status) => return Ok(ExitInfo::from_status(status)),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(BackendError::Wait {
                        pid: self.pid(),
                        source: io::Error::from(errno),
                    });
                }
            }
        }
    }

    fn wait_blocking(&self) -> Result<ExitInfo, BackendError> {
        loop {
            if let Some(info) = self.wait(None)? {
                return Ok(info);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state != WorkerState::Running {
            return;
        }
        warn!(pid = self.pid(), "worker handle dropped while running, killing it");
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(error = %e, "failed to kill worker");
            return;
        }
        if let Err(e) = self.wait_blocking() {
            warn!(error = %e, "failed to reap worker");
        }
    }
}
