//! Terminal session core.
//!
//! - **pty**: backend seam plus the native pseudo-terminal implementation
//! - **loopback**: in-process echo backend
//! - **session**: one process, its transcript and terminal state
//! - **registry**: id allocation and ownership of live sessions
//! - **dispatch**: routing requests to sessions by id
//!
//! # Architecture
//!
//! ```text
//! CommandDispatcher
//! └── SessionRegistry
//!     └── Session (one per id)
//!         ├── TerminalProcess (PTY or loopback)
//!         ├── reader thread ──> EventEmitter
//!         └── transcript + vt100 screen
//! ```

pub mod dispatch;
pub mod loopback;
pub mod pty;
pub mod registry;
pub mod session;

pub use dispatch::{CommandDispatcher, CommandOutput};
pub use loopback::LoopbackBackend;
pub use pty::{PtyBackend, PtyError, TerminalBackend, TerminalProcess};
pub use registry::SessionRegistry;
pub use session::{Session, SessionId, SessionOptions, SessionState};
