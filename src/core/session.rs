//! Session management
//!
//! A session pairs a terminal process with the output it has produced so
//! far. A reader thread drains the process output into the transcript and
//! the vt100 screen, and reports changes through the event emitter.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::pty::{TerminalBackend, TerminalProcess};
use crate::config::{Config, SessionConfig};
use crate::error::{BridgeError, Result};
use crate::events::{Event, EventEmitter};

/// Opaque session identifier of the form `session-<n>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn from_sequence(n: u64) -> Self {
        Self(format!("session-{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric suffix, if the id was issued by a registry
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix("session-")?.parse().ok()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, output not yet being read
    Created,
    Running,
    /// Process exited or was closed
    Finished,
}

/// How to start a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            argv: vec![default_shell()],
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }
}

impl SessionOptions {
    /// Options using the configured shell and terminal size
    pub fn from_config(config: &Config) -> Self {
        let mut options = Self {
            cols: config.session.cols,
            rows: config.session.rows,
            ..Self::default()
        };
        if let Some(shell) = &config.shell {
            let argv: Vec<String> = shell.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                options.argv = argv;
            }
        }
        if !config.session.term.is_empty() {
            options.env.insert("TERM".to_string(), config.session.term.clone());
        }
        options.env.extend(config.session.env.clone());
        options
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Shell used when nothing is configured
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        "cmd.exe".to_string()
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Called once by the reader thread after the process is gone
pub(crate) type ExitHook = Box<dyn FnOnce(&SessionId) + Send + 'static>;

/// Raw process output, trimmed from the front to at most `limit` bytes.
///
/// Positions count every byte received, including trimmed ones.
struct Transcript {
    bytes: VecDeque<u8>,
    trimmed: usize,
    limit: usize,
}

impl Transcript {
    fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            trimmed: 0,
            limit,
        }
    }

    /// Position just past the last byte received
    fn end(&self) -> usize {
        self.trimmed + self.bytes.len()
    }

    fn push(&mut self, chunk: &[u8]) {
        let skip = chunk.len().saturating_sub(self.limit);
        self.bytes.extend(&chunk[skip..]);
        self.trimmed += skip;

        let excess = self.bytes.len().saturating_sub(self.limit);
        if excess == 0 && skip == 0 {
            return;
        }
        self.bytes.drain(..excess);
        self.trimmed += excess;

        // Don't start on half a UTF-8 sequence
        for _ in 0..3 {
            match self.bytes.front() {
                Some(&b) if b & 0xc0 == 0x80 => {
                    self.bytes.pop_front();
                    self.trimmed += 1;
                }
                _ => break,
            }
        }
    }

    /// Text received from `position` on, or everything kept if older
    fn text_since(&self, position: usize) -> String {
        let start = position.saturating_sub(self.trimmed).min(self.bytes.len());
        let raw: Vec<u8> = self.bytes.range(start..).copied().collect();
        String::from_utf8_lossy(&raw).into_owned()
    }
}

/// Output accumulated from the process
struct Output {
    state: SessionState,
    transcript: Transcript,
    parser: vt100::Parser,
    exit_code: Option<u32>,
}

/// What changed after feeding a chunk of output
struct Changes {
    title: Option<String>,
    bell: bool,
}

impl Output {
    fn feed(&mut self, bytes: &[u8]) -> Changes {
        self.transcript.push(bytes);

        let screen = self.parser.screen();
        let title_before = screen.title().to_string();
        let bells_before = screen.audible_bell_count();

        self.parser.process(bytes);

        let screen = self.parser.screen();
        Changes {
            title: (screen.title() != title_before).then(|| screen.title().to_string()),
            bell: screen.audible_bell_count() != bells_before,
        }
    }
}

/// A shell session
pub struct Session {
    id: SessionId,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    process: Arc<Mutex<Box<dyn TerminalProcess>>>,
    output: Arc<Mutex<Output>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl Session {
    /// Spawn the process for a new session. Output is not read until
    /// [`start`](Session::start) is called.
    pub fn spawn(
        id: SessionId,
        options: &SessionOptions,
        backend: &dyn TerminalBackend,
        config: &SessionConfig,
    ) -> Result<Self> {
        if options.cols == 0 || options.rows == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "terminal size {}x{}",
                options.cols, options.rows
            )));
        }

        let mut process = backend
            .spawn(options)
            .map_err(|e| BridgeError::Resource(e.to_string()))?;
        let reader = process
            .take_reader()
            .map_err(|e| BridgeError::Resource(e.to_string()))?;

        Ok(Self {
            id,
            cwd: options.cwd.clone(),
            env: options.env.clone(),
            process: Arc::new(Mutex::new(process)),
            output: Arc::new(Mutex::new(Output {
                state: SessionState::Created,
                transcript: Transcript::new(config.transcript_limit),
                parser: vt100::Parser::new(options.rows, options.cols, config.scrollback),
                exit_code: None,
            })),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Start the reader thread.
    ///
    /// `on_exit` runs on the reader thread after the process output closes
    /// and the session has been marked finished.
    pub(crate) fn start(&self, events: EventEmitter, on_exit: ExitHook) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Resource(format!("{} already started", self.id)))?;

        let id = self.id.clone();
        let output = self.output.clone();
        let process = self.process.clone();

        output.lock().state = SessionState::Running;

        let spawned = thread::Builder::new()
            .name(format!("{}-reader", self.id))
            .spawn(move || {
                let mut buffer = vec![0u8; 4096];

                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            let changes = output.lock().feed(&buffer[..n]);

                            events.emit(Event::SessionOutput {
                                session: id.clone(),
                                bytes: n,
                            });
                            if let Some(title) = changes.title {
                                events.emit(Event::SessionTitle {
                                    session: id.clone(),
                                    title,
                                });
                            }
                            if changes.bell {
                                events.emit(Event::SessionBell {
                                    session: id.clone(),
                                });
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        // Read error - pipe closed or process exited
                        Err(e) => {
                            debug!("{}: output closed: {}", id, e);
                            break;
                        }
                    }
                }

                let exit_code = wait_for_exit(&process);
                {
                    let mut output = output.lock();
                    output.state = SessionState::Finished;
                    output.exit_code = exit_code;
                }
                info!("{} finished (exit code {:?})", id, exit_code);

                events.emit(Event::SessionFinished {
                    session: id.clone(),
                    exit_code,
                });
                on_exit(&id);
            });

        if let Err(e) = spawned {
            self.output.lock().state = SessionState::Finished;
            return Err(BridgeError::Resource(format!("reader thread: {}", e)));
        }
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn state(&self) -> SessionState {
        self.output.lock().state
    }

    /// Check if session is running
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.output.lock().exit_code
    }

    /// Write input to the process
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.process.lock().write(data)?)
    }

    /// Resize the terminal
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "terminal size {}x{}",
                cols, rows
            )));
        }
        self.process.lock().resize(cols, rows)?;
        self.output.lock().parser.set_size(rows, cols);
        Ok(())
    }

    /// Current size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.output.lock().parser.screen().size();
        (cols, rows)
    }

    /// Output kept so far, oldest first
    pub fn read_transcript(&self) -> String {
        self.output.lock().transcript.text_since(0)
    }

    /// Output received at or after `position`
    pub fn read_since(&self, position: usize) -> String {
        self.output.lock().transcript.text_since(position)
    }

    /// The kept transcript together with the output from `position` on
    pub fn snapshot(&self, position: usize) -> (String, String) {
        let output = self.output.lock();
        (output.transcript.text_since(0), output.transcript.text_since(position))
    }

    /// Total bytes received, including any no longer kept
    pub fn transcript_position(&self) -> usize {
        self.output.lock().transcript.end()
    }

    /// Visible screen text as rendered by the terminal emulator
    pub fn screen_contents(&self) -> String {
        self.output.lock().parser.screen().contents()
    }

    /// Get the terminal title
    pub fn title(&self) -> String {
        self.output.lock().parser.screen().title().to_string()
    }

    pub fn bell_count(&self) -> usize {
        self.output.lock().parser.screen().audible_bell_count()
    }

    /// Terminate the process. The reader thread reports the exit.
    pub fn finish(&self) -> Result<()> {
        Ok(self.process.lock().finish()?)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The reader thread may be the one dropping us, so it is not joined;
        // it exits on its own once the process output closes.
        if let Err(e) = self.process.lock().finish() {
            warn!("{}: failed to terminate process: {}", self.id, e);
        }
    }
}

/// Reap the exit code, giving a just-closed process a moment to exit
fn wait_for_exit(process: &Mutex<Box<dyn TerminalProcess>>) -> Option<u32> {
    for _ in 0..20 {
        if let Some(code) = process.lock().exit_code() {
            return Some(code);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::core::loopback::LoopbackBackend;

    fn started(events: &EventEmitter) -> (Session, mpsc::Receiver<SessionId>) {
        let session = Session::spawn(
            SessionId::from_sequence(1),
            &SessionOptions::default(),
            &LoopbackBackend::new(),
            &SessionConfig::default(),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .start(
                events.clone(),
                Box::new(move |id: &SessionId| {
                    let _ = tx.send(id.clone());
                }),
            )
            .unwrap();
        (session, rx)
    }

    #[test]
    fn test_session_id_sequence() {
        let id = SessionId::from_sequence(42);
        assert_eq!(id.as_str(), "session-42");
        assert_eq!(id.sequence(), Some(42));
        assert_eq!(SessionId::from("other").sequence(), None);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.shell = Some("bash --noprofile".to_string());
        config.session.cols = 120;
        config.session.env.insert("LANG".to_string(), "C.UTF-8".to_string());

        let options = SessionOptions::from_config(&config);
        assert_eq!(options.argv, vec!["bash", "--noprofile"]);
        assert_eq!(options.cols, 120);
        assert_eq!(options.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(options.env.get("LANG").map(String::as_str), Some("C.UTF-8"));

        let options = options.with_env("TERM", "xterm");
        assert_eq!(options.env.get("TERM").map(String::as_str), Some("xterm"));

        config.session.term.clear();
        config.session.env.insert("TERM".to_string(), "vt100".to_string());
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.env.get("TERM").map(String::as_str), Some("vt100"));
    }

    #[test]
    fn test_transcript_is_capped() {
        let mut transcript = Transcript::new(8);
        transcript.push(b"0123");
        transcript.push(b"456789");
        assert_eq!(transcript.end(), 10);
        assert_eq!(transcript.text_since(0), "23456789");
        assert_eq!(transcript.text_since(6), "6789");

        transcript.push(&[b'x'; 100]);
        assert_eq!(transcript.bytes.len(), 8);
        assert_eq!(transcript.end(), 110);
        assert_eq!(transcript.text_since(105), "xxxxx");
    }

    #[test]
    fn test_transcript_trim_skips_partial_character() {
        let mut transcript = Transcript::new(3);
        transcript.push("ab\u{e9}cd".as_bytes());
        assert_eq!(transcript.text_since(0), "cd");
        assert_eq!(transcript.end(), 6);
    }

    #[test]
    fn test_positions_survive_invalid_utf8() {
        let mut transcript = Transcript::new(1024);
        transcript.push(b"\xff\xffhello\n");
        let position = transcript.end();
        transcript.push(b"world\n");

        assert_eq!(transcript.text_since(position), "world\n");
        assert!(transcript.text_since(0).starts_with('\u{fffd}'));
    }

    #[test]
    fn test_session_output_stays_within_limit() {
        let config = SessionConfig {
            transcript_limit: 1024,
            ..SessionConfig::default()
        };
        let session = Session::spawn(
            SessionId::from_sequence(3),
            &SessionOptions::default(),
            &LoopbackBackend::new(),
            &config,
        )
        .unwrap();
        let (tx, exited) = mpsc::channel();
        session
            .start(
                EventEmitter::new(),
                Box::new(move |id: &SessionId| {
                    let _ = tx.send(id.clone());
                }),
            )
            .unwrap();

        let chunk = [b'y'; 4096];
        for _ in 0..16 {
            session.write(&chunk).unwrap();
        }
        session.finish().unwrap();
        exited.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(session.transcript_position(), 16 * 4096);
        assert_eq!(session.read_transcript().len(), 1024);
    }

    #[test]
    fn test_zero_size_rejected() {
        let options = SessionOptions {
            cols: 0,
            ..SessionOptions::default()
        };
        let err = Session::spawn(
            SessionId::from_sequence(1),
            &options,
            &LoopbackBackend::new(),
            &SessionConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_lifecycle_and_title() {
        let events = EventEmitter::new();
        let rx = events.subscribe();

        let session = Session::spawn(
            SessionId::from_sequence(7),
            &SessionOptions::default(),
            &LoopbackBackend::new(),
            &SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Created);

        let (tx, exited) = mpsc::channel();
        session
            .start(
                events.clone(),
                Box::new(move |id: &SessionId| {
                    let _ = tx.send(id.clone());
                }),
            )
            .unwrap();
        assert!(session.is_running());

        session.write(b"\x1b]2;build\x07\x07").unwrap();
        session.finish().unwrap();

        let id = exited.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id.as_str(), "session-7");
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.exit_code(), Some(0));
        assert_eq!(session.title(), "build");
        assert!(session.bell_count() >= 1);

        let names: Vec<&str> = rx.try_iter().map(|e| e.name()).collect();
        assert_eq!(names.first(), Some(&"sessionOutput"));
        assert!(names.contains(&"sessionTitle"));
        assert!(names.contains(&"sessionBell"));
        assert_eq!(names.last(), Some(&"sessionFinished"));
    }

    #[test]
    fn test_transcript_accumulates() {
        let events = EventEmitter::new();
        let (session, _exited) = started(&events);

        session.write(b"one\n").unwrap();
        session.write(b"two\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.transcript_position() < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.read_transcript(), "one\r\ntwo\r\n");
        assert!(session.screen_contents().contains("two"));
    }

    #[test]
    fn test_resize_tracks_size() {
        let events = EventEmitter::new();
        let (session, _exited) = started(&events);

        assert_eq!(session.size(), (80, 24));
        session.resize(40, 10).unwrap();
        assert_eq!(session.size(), (40, 10));
        assert!(session.resize(0, 10).is_err());
    }

    #[test]
    fn test_start_twice_fails() {
        let events = EventEmitter::new();
        let (session, _exited) = started(&events);
        assert!(session.start(events, Box::new(|_: &SessionId| {})).is_err());
    }
}
