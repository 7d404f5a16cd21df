//! bridged - terminal sessions and on-device inference as a service
//!
//! bridged keeps a registry of interactive terminal sessions, routes
//! commands to them by id, and runs inference and training requests against
//! a loaded model. Asynchronous notifications (session output, exits,
//! training progress) flow through a single best-effort event channel.
//!
//! # Components
//!
//! - **Session registry**: issues `session-<n>` ids and owns live sessions
//! - **Command dispatcher**: writes commands and captures transcripts
//! - **Event emitter**: non-blocking delivery to the current subscriber
//! - **Inference pipeline**: model loading, accelerator selection,
//!   bounded-time inference and training runs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bridged::core::{CommandDispatcher, PtyBackend, SessionOptions, SessionRegistry};
//! use bridged::events::EventEmitter;
//!
//! let events = EventEmitter::new();
//! let registry = Arc::new(SessionRegistry::new(Arc::new(PtyBackend::new()), events));
//! let dispatcher = CommandDispatcher::new(registry.clone(), Duration::from_millis(300));
//!
//! let id = registry.create(&SessionOptions::default())?;
//! let output = dispatcher.execute(&id, "echo hello")?;
//! assert!(output.transcript.contains("hello"));
//! # Ok::<(), bridged::BridgeError>(())
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod inference;

pub use config::Config;
pub use error::{BridgeError, Result};
