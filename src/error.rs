//! Error taxonomy shared by every bridged component.
//!
//! Each failure is scoped to one session or one request. [`BridgeError::code`]
//! gives the stable tag the line protocol reports to clients.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::pty::PtyError;
use crate::core::session::SessionId;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("{what} size mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no model loaded")]
    NotLoaded,

    #[error("inference timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("a training run is already active")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Stable tag for the wire response.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::SessionNotFound(_) | BridgeError::ModelNotFound(_) => "NOT_FOUND",
            BridgeError::Resource(_) => "RESOURCE",
            BridgeError::ShapeMismatch { .. } => "SHAPE_MISMATCH",
            BridgeError::NotLoaded => "NOT_LOADED",
            BridgeError::Timeout { .. } => "TIMEOUT",
            BridgeError::Busy => "BUSY",
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::Pty(_) => "IO",
            BridgeError::Config(_) => "CONFIG",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == "NOT_FOUND"
    }
}
