use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::{CommandError, CommandEvent, CommandReport, CommandSpec, supervise};
use crate::types::Limits;

const EVENT_BUFFER: usize = 100;

/// Live events from a running command
///
/// Output lines arrive as they are written, followed by a single
/// [`CommandEvent::Exited`]. The command runs on a background task and keeps
/// running even when events are not consumed.
pub struct CommandEventStream {
    rx: mpsc::Receiver<CommandEvent>,
    handle: JoinHandle<Result<CommandReport, CommandError>>,
}

impl CommandEventStream {
    /// Spawn the command on the current tokio runtime
    pub fn spawn(spec: CommandSpec, limits: Limits) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(supervise(spec, limits, Some(tx)));
        Self { rx, handle }
    }

    /// Receive the next event, `None` once the command is done
    pub async fn recv(&mut self) -> Option<CommandEvent> {
        self.rx.recv().await
    }

    /// Stop listening and wait for the final report
    pub async fn finish(self) -> Result<CommandReport, CommandError> {
        drop(self.rx);
        self.handle.await?
    }
}
