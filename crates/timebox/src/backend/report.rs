//! Outcome report sent from a worker to its parent
//!
//! The worker writes one JSON document to the result pipe and exits. The
//! parent reads it in chunks between checks on the worker and the deadline.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Deserialize, Serialize};

use crate::invocation::panic_message;
use crate::types::{Outcome, TimedOut};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Report<T, E> {
    Success(T),
    Failure(E),
    Panicked(String),
    TimedOut(TimedOut),
}

impl<T, E> Report<T, E> {
    pub(crate) fn from_outcome(outcome: Outcome<T, E>) -> Self {
        match outcome {
            Outcome::Success(value) => Self::Success(value),
            Outcome::Failure(error) => Self::Failure(error),
            Outcome::Panicked(payload) => Self::Panicked(panic_message(payload.as_ref())),
            Outcome::TimedOut(timeout) => Self::TimedOut(timeout),
        }
    }

    pub(crate) fn into_outcome(self) -> Outcome<T, E> {
        match self {
            Self::Success(value) => Outcome::Success(value),
            Self::Failure(error) => Outcome::Failure(error),
            Self::Panicked(message) => Outcome::Panicked(Box::new(message)),
            Self::TimedOut(timeout) => Outcome::TimedOut(timeout),
        }
    }
}

/// State of the result pipe after a read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Every write end is closed
    Eof,
    /// The pipe may still deliver data
    Open,
}

/// Wait up to `timeout` for data on `pipe` and append one chunk of it to `buf`
pub(crate) fn read_some(pipe: &mut File, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<Progress> {
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let ready = {
        let mut fds = [PollFd::new(pipe.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(millis))
    };
    match ready {
        Ok(0) | Err(Errno::EINTR) => return Ok(Progress::Open),
        Ok(_) => {}
        Err(errno) => return Err(io::Error::from(errno)),
    }

    let mut chunk = [0u8; READ_CHUNK];
    match pipe.read(&mut chunk) {
        Ok(0) => Ok(Progress::Eof),
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(Progress::Open)
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Progress::Open),
        Err(e) => Err(e),
    }
}

/// Read whatever is already buffered in `pipe` without waiting
pub(crate) fn drain(pipe: &mut File, buf: &mut Vec<u8>) -> io::Result<()> {
    loop {
        let before = buf.len();
        if read_some(pipe, buf, Duration::ZERO)? == Progress::Eof || buf.len() == before {
            return Ok(());
        }
    }
}
