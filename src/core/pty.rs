//! Pseudo-terminal backend
//!
//! This module defines the seam between sessions and whatever actually runs
//! the shell process, plus a portable-pty implementation of it (ConPTY on
//! Windows, openpty elsewhere).

use std::io::{self, Read, Write};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use super::session::SessionOptions;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(String),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to terminate process: {0}")]
    Kill(#[source] io::Error),

    #[error("Reader already taken")]
    ReaderTaken,

    #[error("Invalid handle")]
    InvalidHandle,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Starts terminal processes for new sessions.
pub trait TerminalBackend: Send + Sync {
    fn spawn(&self, options: &SessionOptions) -> Result<Box<dyn TerminalProcess>>;
}

/// A running process attached to a terminal.
///
/// Output is consumed through the reader returned by [`take_reader`], which
/// must report EOF (or an error) once the process is gone.
///
/// [`take_reader`]: TerminalProcess::take_reader
pub trait TerminalProcess: Send {
    /// Hand out the output stream. Only the first call succeeds.
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Terminate the process. Calling it on a finished process is harmless.
    fn finish(&mut self) -> Result<()>;

    /// Exit code, once the process has exited.
    fn exit_code(&mut self) -> Option<u32>;
}

/// Backend spawning real processes in a native pseudo terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyBackend;

impl PtyBackend {
    pub fn new() -> Self {
        Self
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl TerminalBackend for PtyBackend {
    fn spawn(&self, options: &SessionOptions) -> Result<Box<dyn TerminalProcess>> {
        let (program, args) = options.argv.split_first().ok_or(PtyError::EmptyCommand)?;

        let pair = native_pty_system()
            .openpty(pty_size(options.cols, options.rows))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(&options.cwd);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("{}: {}", program, e)))?;
        // The child holds its own copy; keeping ours would stop EOF on exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        Ok(Box::new(PtyProcess {
            master: pair.master,
            writer: Some(writer),
            reader: Some(reader),
            child,
        }))
    }
}

/// A process running inside a native PTY
struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl TerminalProcess for PtyProcess {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.reader.take().ok_or(PtyError::ReaderTaken)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let writer = self.writer.as_mut().ok_or(PtyError::InvalidHandle)?;
        writer.write_all(data).map_err(PtyError::Write)?;
        writer.flush().map_err(PtyError::Write)?;
        Ok(data.len())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn finish(&mut self) -> Result<()> {
        self.writer = None;
        if self.exit_code().is_some() {
            return Ok(());
        }
        self.child.kill().map_err(PtyError::Kill)
    }

    fn exit_code(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }
}
