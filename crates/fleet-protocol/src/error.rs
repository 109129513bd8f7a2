//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A wire line exceeded the maximum allowed length
    #[error("Line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong { size: usize, max: usize },

    /// A wire line was not valid UTF-8
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    /// A required registration field was absent or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
