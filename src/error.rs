//! Error types for the notes service.

use thiserror::Error;

/// Why a write was refused before touching the store.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message text is blank")]
    BlankText,
}

/// Main error type for store, log and protocol operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Subscriber channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// True when the error is a rejected write rather than a service fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for notes service operations.
pub type Result<T> = std::result::Result<T, SyncError>;
