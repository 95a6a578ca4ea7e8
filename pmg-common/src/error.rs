//! Common error types for PMG

use thiserror::Error;

/// Common result type for PMG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across PMG crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported Standard MIDI File
    #[error("MIDI error: {0}")]
    Midi(String),

    /// Sequence cannot be quantized
    #[error("Quantization error: {0}")]
    Quantization(String),

    /// Sequence JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<midly::Error> for Error {
    fn from(err: midly::Error) -> Self {
        Error::Midi(err.to_string())
    }
}
