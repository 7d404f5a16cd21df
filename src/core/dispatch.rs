//! Command dispatcher
//!
//! Routes requests addressed by session id to the owning session.
//!
//! There is no command-completion signal: [`CommandDispatcher::execute`]
//! writes the command, waits a fixed settle interval and captures whatever
//! output has accumulated by then. Slow commands may not have produced
//! their output yet; callers that need certainty should poll
//! [`CommandDispatcher::read`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::registry::SessionRegistry;
use super::session::SessionId;
use crate::error::Result;

/// Output captured after running a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub session: SessionId,
    /// Full transcript kept by the session
    pub transcript: String,
    /// Output produced since the command was written
    pub delta: String,
    /// Bytes the session had received before the command was written
    pub offset: usize,
    /// Whether the session was still running at capture time
    pub running: bool,
}

/// Dispatches requests to sessions in a registry
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    settle: Duration,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, settle: Duration) -> Self {
        Self { registry, settle }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Run a command line in a session and capture the transcript
    pub fn execute(&self, id: &SessionId, command: &str) -> Result<CommandOutput> {
        let session = self.registry.get(id)?;

        let mut line = command.trim_end_matches(['\r', '\n']).to_string();
        line.push('\n');

        let offset = session.transcript_position();
        session.write(line.as_bytes())?;
        debug!("{}: wrote {:?}, settling for {:?}", id, command, self.settle);

        thread::sleep(self.settle);

        let (transcript, delta) = session.snapshot(offset);
        Ok(CommandOutput {
            session: id.clone(),
            transcript,
            delta,
            offset,
            running: session.is_running(),
        })
    }

    /// Write raw bytes to a session
    pub fn write(&self, id: &SessionId, data: &[u8]) -> Result<usize> {
        self.registry.get(id)?.write(data)
    }

    /// Full transcript of a session
    pub fn read(&self, id: &SessionId) -> Result<String> {
        Ok(self.registry.get(id)?.read_transcript())
    }

    pub fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        self.registry.get(id)?.resize(cols, rows)?;
        debug!("{}: resized to {}x{}", id, cols, rows);
        Ok(())
    }

    /// Close a session. Closing an unknown or exited session succeeds.
    pub fn close(&self, id: &SessionId) -> Result<()> {
        self.registry.remove(id);
        Ok(())
    }
}
