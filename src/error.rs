//! Error types for content envelope encryption

use thiserror::Error;

/// Result type alias for envelope encryption operations
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors that can occur while wrapping keys, encrypting or decrypting content
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The key management service failed or refused a request
    #[error("Key management error: {0}")]
    KeyManagement(String),

    /// A persisted encryption context is structurally invalid
    #[error("Corrupted encryption context: {0}")]
    CorruptedContext(String),

    /// Cipher or engine parameters are unusable; not a transient failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed binary key record
    #[error("Codec error: {0}")]
    Codec(String),

    /// Unparseable or unsatisfiable byte range request
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EnvelopeError> for std::io::Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(io) => io,
            EnvelopeError::CorruptedContext(_) | EnvelopeError::Codec(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err)
            }
            EnvelopeError::InvalidRange(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            other => std::io::Error::other(other),
        }
    }
}

impl From<base64::DecodeError> for EnvelopeError {
    fn from(err: base64::DecodeError) -> Self {
        EnvelopeError::KeyManagement(format!("Base64 decode error: {}", err))
    }
}
