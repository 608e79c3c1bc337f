//! Error types for ring sessions

use ring_core::RingError;
use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while driving a ring
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation needs a live link
    #[error("Not connected. Call connect first.")]
    NotConnected,

    /// `connect` called on a live session
    #[error("Session already connected to {0}")]
    AlreadyConnected(String),

    /// Transport could not establish the link
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// Transport error on an established link
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport is receive-only
    #[error("Transport '{0}' does not support writes")]
    WriteUnsupported(String),

    /// The session task has ended
    #[error("Session closed")]
    SessionClosed,

    /// Protocol engine error
    #[error("Protocol error: {0}")]
    Protocol(#[from] RingError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotConnected => "NOT_CONNECTED",
            SessionError::AlreadyConnected(_) => "ALREADY_CONNECTED",
            SessionError::ConnectFailed { .. } => "CONNECT_FAILED",
            SessionError::Transport(_) => "TRANSPORT_ERROR",
            SessionError::WriteUnsupported(_) => "WRITE_UNSUPPORTED",
            SessionError::SessionClosed => "SESSION_CLOSED",
            SessionError::Protocol(e) => e.error_code(),
            SessionError::Serialization(_) => "SERIALIZATION_ERROR",
            SessionError::Io(_) => "IO_ERROR",
        }
    }
}
