//! Error types shared by all Vigil crates

use thiserror::Error;

/// Result type alias for operations on the shared data model
pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors raised while building, validating or (de)serializing pipeline records
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Invalid inline payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}
