//! Encryption context: the persisted `wrapped key ++ nonce` blob
//!
//! Without the key management service the context is useless, so it can be
//! stored next to the ciphertext.

use crate::config::ContextFormat;
use crate::crypto::NONCE_SIZE;
use crate::error::{EnvelopeError, Result};

/// Size of the big-endian length prefix in [`ContextFormat::LengthPrefixed`]
const LENGTH_PREFIX_SIZE: usize = 4;

/// A parsed encryption context
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    wrapped_key: Vec<u8>,
    nonce: [u8; NONCE_SIZE],
}

impl EncryptionContext {
    pub fn new(wrapped_key: Vec<u8>, nonce: [u8; NONCE_SIZE]) -> Self {
        Self { wrapped_key, nonce }
    }

    /// The key management ciphertext of the data key
    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Serialize the context
    ///
    /// With a fixed layout the wrapped key must be exactly the configured
    /// length; anything else means the layout does not match the key
    /// management service in use.
    pub fn to_bytes(&self, format: ContextFormat) -> Result<Vec<u8>> {
        match format {
            ContextFormat::Fixed { wrapped_key_len } => {
                if self.wrapped_key.len() != wrapped_key_len {
                    return Err(EnvelopeError::Config(format!(
                        "Wrapped key is {} bytes but the context layout expects {}",
                        self.wrapped_key.len(),
                        wrapped_key_len
                    )));
                }
                let mut out = Vec::with_capacity(wrapped_key_len + NONCE_SIZE);
                out.extend_from_slice(&self.wrapped_key);
                out.extend_from_slice(&self.nonce);
                Ok(out)
            }
            ContextFormat::LengthPrefixed => {
                let len = u32::try_from(self.wrapped_key.len()).map_err(|_| {
                    EnvelopeError::Config("Wrapped key too large for context".into())
                })?;
                let mut out =
                    Vec::with_capacity(LENGTH_PREFIX_SIZE + self.wrapped_key.len() + NONCE_SIZE);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&self.wrapped_key);
                out.extend_from_slice(&self.nonce);
                Ok(out)
            }
        }
    }

    /// Split a persisted context into wrapped key and nonce
    pub fn from_bytes(bytes: &[u8], format: ContextFormat) -> Result<Self> {
        let wrapped_key = match format {
            ContextFormat::Fixed { wrapped_key_len } => {
                let expected = wrapped_key_len + NONCE_SIZE;
                if bytes.len() != expected {
                    return Err(EnvelopeError::CorruptedContext(format!(
                        "Expected {} bytes, got {}",
                        expected,
                        bytes.len()
                    )));
                }
                &bytes[..wrapped_key_len]
            }
            ContextFormat::LengthPrefixed => {
                if bytes.len() < LENGTH_PREFIX_SIZE + NONCE_SIZE {
                    return Err(EnvelopeError::CorruptedContext(format!(
                        "Context of {} bytes is shorter than the minimum {}",
                        bytes.len(),
                        LENGTH_PREFIX_SIZE + NONCE_SIZE
                    )));
                }
                let (prefix, rest) = bytes.split_at(LENGTH_PREFIX_SIZE);
                let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
                len_bytes.copy_from_slice(prefix);
                let len = u32::from_be_bytes(len_bytes) as usize;
                if rest.len() - NONCE_SIZE != len {
                    return Err(EnvelopeError::CorruptedContext(format!(
                        "Declared wrapped key length {} does not fit a {} byte context",
                        len,
                        bytes.len()
                    )));
                }
                &rest[..len]
            }
        };

        if wrapped_key.is_empty() {
            return Err(EnvelopeError::CorruptedContext("Empty wrapped key".into()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[bytes.len() - NONCE_SIZE..]);

        Ok(Self {
            wrapped_key: wrapped_key.to_vec(),
            nonce,
        })
    }

    /// The wrapped key as the key management service's ciphertext string
    pub fn wrapped_key_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.wrapped_key).map_err(|_| {
            EnvelopeError::CorruptedContext("Wrapped key is not valid UTF-8".into())
        })
    }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("wrapped_key_len", &self.wrapped_key.len())
            .field("nonce", &self.nonce)
            .finish()
    }
}
