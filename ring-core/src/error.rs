//! Error types for ring protocol operations
//!
//! Decoding itself never fails: integrity and framing problems are recovered
//! locally by the frame synchronizer and only show up as counters in
//! [`DecodeStats`](crate::protocol::DecodeStats). The errors here cover the
//! operations that *can* be refused: configuration, command construction and
//! clock model fitting.
//!
//! # Error Codes
//!
//! Each variant has a stable code (e.g. `INVALID_CONFIG`) for log aggregation
//! and programmatic handling.
//!
//! ```rust
//! use ring_core::error::{RingError, ErrorCategory};
//!
//! let err = RingError::InvalidConfig { reason: "tap_interval must be positive".into() };
//! assert_eq!(err.category(), ErrorCategory::Config);
//! assert_eq!(err.error_code(), "INVALID_CONFIG");
//! assert!(!err.is_recoverable());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ring operations
pub type Result<T> = std::result::Result<T, RingError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Checksum mismatch on a received frame
    Integrity,
    /// Insufficient or malformed bytes
    Framing,
    /// Clock calibration could not produce a model
    Calibration,
    /// Invalid configuration or command arguments
    Config,
    /// File or serialization failure
    Io,
}

/// Errors that can occur in ring protocol operations
#[derive(Error, Debug)]
pub enum RingError {
    // ═══════════════════════════════════════════════════════════════════════
    // Wire errors (reported through DropReason, surfaced here for callers
    // that validate single frames directly)
    // ═══════════════════════════════════════════════════════════════════════

    /// Embedded checksum does not match the recomputed one
    #[error("CRC mismatch: expected {expected:#06x}, frame carries {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Not enough bytes to interpret a frame
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Calibration errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Too few samples, or samples that do not determine a line
    #[error("Clock model cannot be fitted: {reason}")]
    DegenerateFit { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration and command errors
    // ═══════════════════════════════════════════════════════════════════════

    /// Configuration value out of range
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Command arguments cannot be encoded
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RingError {
    /// Returns true if the condition is expected to clear on its own
    ///
    /// Integrity and framing errors are recovered by resynchronizing on the
    /// byte stream; everything else needs different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RingError::CrcMismatch { .. } | RingError::Truncated { .. }
        )
    }

    /// Returns the category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            RingError::CrcMismatch { .. } => ErrorCategory::Integrity,
            RingError::Truncated { .. } => ErrorCategory::Framing,
            RingError::DegenerateFit { .. } => ErrorCategory::Calibration,
            RingError::InvalidConfig { .. } | RingError::InvalidCommand { .. } => {
                ErrorCategory::Config
            }
            RingError::JsonError(_) | RingError::IoError(_) => ErrorCategory::Io,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            RingError::CrcMismatch { .. } => "CRC_MISMATCH",
            RingError::Truncated { .. } => "TRUNCATED_FRAME",
            RingError::DegenerateFit { .. } => "DEGENERATE_FIT",
            RingError::InvalidConfig { .. } => "INVALID_CONFIG",
            RingError::InvalidCommand { .. } => "INVALID_COMMAND",
            RingError::JsonError(_) => "JSON_ERROR",
            RingError::IoError(_) => "IO_ERROR",
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        RingError::InvalidConfig {
            reason: reason.into(),
        }
    }
}
