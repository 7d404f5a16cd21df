//! In-process echo backend
//!
//! Runs no external process: everything written to the "terminal" is echoed
//! back as output, the way a cooked-mode tty echoes keystrokes. Resizes are
//! reported in-band as `[resize COLSxROWS]` lines. Useful for demo mode and
//! for exercising sessions deterministically.

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender};

use super::pty::{PtyError, Result, TerminalBackend, TerminalProcess};
use super::session::SessionOptions;

/// Backend whose processes echo their input
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackBackend;

impl LoopbackBackend {
    pub fn new() -> Self {
        Self
    }
}

impl TerminalBackend for LoopbackBackend {
    fn spawn(&self, options: &SessionOptions) -> Result<Box<dyn TerminalProcess>> {
        if options.argv.is_empty() {
            return Err(PtyError::EmptyCommand);
        }
        if !options.cwd.is_dir() {
            return Err(PtyError::Spawn(format!(
                "working directory {} does not exist",
                options.cwd.display()
            )));
        }

        let (tx, rx) = mpsc::channel();
        Ok(Box::new(LoopbackProcess {
            output: Some(tx),
            reader: Some(ChannelReader::new(rx)),
            exit_code: None,
        }))
    }
}

struct LoopbackProcess {
    output: Option<Sender<Vec<u8>>>,
    reader: Option<ChannelReader>,
    exit_code: Option<u32>,
}

impl LoopbackProcess {
    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let tx = self.output.as_ref().ok_or(PtyError::InvalidHandle)?;
        tx.send(bytes).map_err(|_| {
            PtyError::Write(io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"))
        })
    }
}

impl TerminalProcess for LoopbackProcess {
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        let reader = self.reader.take().ok_or(PtyError::ReaderTaken)?;
        Ok(Box::new(reader))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        // Translate bare LF to CRLF like a tty with onlcr set
        let mut echoed = Vec::with_capacity(data.len() + 1);
        for &b in data {
            if b == b'\n' {
                echoed.push(b'\r');
            }
            echoed.push(b);
        }
        self.send(echoed)?;
        Ok(data.len())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.send(format!("[resize {}x{}]\r\n", cols, rows).into_bytes())
    }

    fn finish(&mut self) -> Result<()> {
        // Dropping the sender makes the reader see EOF
        if self.output.take().is_some() {
            self.exit_code = Some(0);
        }
        Ok(())
    }

    fn exit_code(&mut self) -> Option<u32> {
        self.exit_code
    }
}

/// Blocking `Read` over a channel of byte chunks
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_and_eof() {
        let mut process = LoopbackBackend::new()
            .spawn(&SessionOptions::default())
            .unwrap();
        let mut reader = process.take_reader().unwrap();
        assert!(matches!(process.take_reader(), Err(PtyError::ReaderTaken)));

        process.write(b"ls\n").unwrap();
        process.resize(100, 30).unwrap();
        process.finish().unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ls\r\n[resize 100x30]\r\n");
        assert_eq!(process.exit_code(), Some(0));
        assert!(process.write(b"late").is_err());
    }

    #[test]
    fn test_missing_cwd_fails() {
        let options = SessionOptions {
            cwd: "/definitely/not/here".into(),
            ..SessionOptions::default()
        };
        assert!(LoopbackBackend::new().spawn(&options).is_err());
    }
}
