//! Error types for the register.

use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for register operations.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Type mismatch for key {key}: expected {expected} ({reason})")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        reason: String,
    },

    #[error("Handler {subscription} failed for key {key}: {reason}")]
    HandlerFailure {
        key: String,
        subscription: SubscriptionId,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl RegisterError {
    /// True for the store-level "key absent" failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegisterError::NotFound(_))
    }
}

impl From<serde_json::Error> for RegisterError {
    fn from(e: serde_json::Error) -> Self {
        RegisterError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RegisterError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RegisterError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RegisterError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RegisterError::Deserialization(e.to_string())
    }
}

/// Error returned by a failing change handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Result type for register operations.
pub type Result<T> = std::result::Result<T, RegisterError>;
