//! Timed external commands
//!
//! Runs a program with piped stdio under the same [`Limits`] as the callable
//! backends: optional input is written and stdin closed, stdout and stderr are
//! collected line by line (and optionally streamed as [`CommandEvent`]s), and
//! the program is terminated once the budget elapses.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::types::Limits;

pub use crate::command::stream::CommandEventStream;

mod stream;

/// How long output readers may keep draining after the program exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command program must not be empty")]
    EmptyProgram,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal '{program}': {source}")]
    Signal {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External program to run under a budget
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    input: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Data written to stdin before it is closed
    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(data.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

/// Event from a running command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    /// A complete line was received on stdout
    Stdout(String),

    /// A complete line was received on stderr
    Stderr(String),

    /// The command exited or was terminated
    Exited(CommandReport),
}

/// Result of a finished command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    /// Exit code, if the program exited normally
    pub exit_code: Option<i32>,

    /// Terminating signal, if the program was killed by one
    pub signal: Option<i32>,

    /// Whether the budget elapsed and the program was terminated
    pub timed_out: bool,

    /// Wall time from spawn to reap
    pub elapsed: Duration,

    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandReport {
    /// Whether the program finished in time with exit code 0
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run a command to completion under `limits`
pub async fn run_command(spec: CommandSpec, limits: &Limits) -> Result<CommandReport, CommandError> {
    supervise(spec, *limits, None).await
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

#[instrument(skip_all, fields(program = %spec.program, budget = %limits.budget))]
async fn supervise(
    spec: CommandSpec,
    limits: Limits,
    events: Option<mpsc::Sender<CommandEvent>>,
) -> Result<CommandReport, CommandError> {
    if spec.program.trim().is_empty() {
        return Err(CommandError::EmptyProgram);
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(if spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.working_dir {
        command.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    debug!(pid = child.id(), args = ?spec.args, "command spawned");

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.input) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    warn!(error = %e, "failed to write command input");
                }
            }
            // Dropping stdin closes it
        });
    }

    let stdout = child
        .stdout
        .take()
        .map(|out| read_lines(out, Pipe::Stdout, events.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|err| read_lines(err, Pipe::Stderr, events.clone()));

    let (status, timed_out) =
        match tokio::time::timeout(limits.budget.as_duration(), child.wait()).await {
            Ok(status) => (status?, false),
            Err(_) => {
                warn!(pid = child.id(), "budget elapsed, terminating command");
                (terminate(&mut child, &spec.program, limits.kill_grace).await?, true)
            }
        };
    let elapsed = started.elapsed();

    let (exit_code, signal) = exit_parts(status);
    let report = CommandReport {
        exit_code,
        signal,
        timed_out,
        elapsed,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    };

    info!(
        exit_code = ?report.exit_code,
        signal = ?report.signal,
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );

    if let Some(events) = events {
        let _ = events.send(CommandEvent::Exited(report.clone())).await;
    }
    Ok(report)
}

/// `SIGTERM`, up to `grace` to exit, then kill
async fn terminate(
    child: &mut Child,
    program: &str,
    grace: Duration,
) -> Result<ExitStatus, CommandError> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                return Err(CommandError::Signal {
                    program: program.to_string(),
                    source: errno.into(),
                });
            }
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return Ok(status?);
        }
        warn!(pid, "command ignored SIGTERM, killing it");
    }
    #[cfg(not(unix))]
    let _ = (program, grace);

    child.kill().await?;
    Ok(child.wait().await?)
}

fn read_lines<R>(
    reader: R,
    pipe: Pipe,
    events: Option<mpsc::Sender<CommandEvent>>,
) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = trim_line(&buf);
                    if let Some(ref events) = events {
                        let event = match pipe {
                            Pipe::Stdout => CommandEvent::Stdout(line.clone()),
                            Pipe::Stderr => CommandEvent::Stderr(line.clone()),
                        };
                        // Keep collecting even if nobody listens anymore
                        let _ = events.send(event).await;
                    }
                    lines.push(line);
                }
                Err(e) => {
                    warn!(?pipe, error = %e, "output read error");
                    break;
                }
            }
        }
        lines
    })
}

async fn collect(reader: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(mut handle) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader failed");
            Vec::new()
        }
        Err(_) => {
            // A descendant still holds the pipe open
            warn!("output still open after exit, dropping remaining lines");
            handle.abort();
            Vec::new()
        }
    }
}

fn trim_line(buf: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(buf).into_owned();
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}
