//! Error types for sange.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using sange's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sange.
#[derive(Error, Debug)]
pub enum Error {
    // Source errors
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Output negotiation
    #[error("Invalid output format: {0}")]
    InvalidFormat(String),

    // Playback errors
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Seek failed: {0}")]
    SeekError(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Player failed earlier: {0}")]
    Failed(String),

    #[error("Player destroyed")]
    Destroyed,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unsupported,
    InvalidFormat,
    DecodeError,
    SeekError,
    Destroyed,
    InvalidArgument,
    InvalidState,
    Failed,
    Io,
    Network,
    Timeout,
    Internal,
}

impl Error {
    /// Returns the coarse kind of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::DecodeError(_) => ErrorKind::DecodeError,
            Self::SeekError(_) => ErrorKind::SeekError,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Failed(_) => ErrorKind::Failed,
            Self::Destroyed => ErrorKind::Destroyed,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Returns true if the error means the player can no longer be driven.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed(_))
    }
}
