//! Stored data encryption keys
//!
//! A data key is persisted next to the content it protects in one of two
//! shapes. Both encode through [`RecordCodec`] with their own marker, so a
//! single opaque column can hold either and [`StoredDataEncryptionKey::from_bytes`]
//! can tell them apart.

use std::sync::LazyLock;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::{Field, ListCodec, RecordCodec};
use crate::error::{EnvelopeError, Result};

pub const UNENCRYPTED_MARKER: char = 'U';
pub const ENCRYPTED_MARKER: char = 'E';

/// Raw data key kept at rest, for storage that is already encrypted at
/// another layer
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct UnencryptedSymmetricDataEncryptionKey {
    pub algorithm: String,
    pub key_data: Vec<u8>,
    pub iv: Vec<u8>,
}

impl std::fmt::Debug for UnencryptedSymmetricDataEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnencryptedSymmetricDataEncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key_data", &"[REDACTED]")
            .field("iv", &self.iv)
            .finish()
    }
}

/// Data key wrapped by a key management service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedSymmetricDataEncryptionKey {
    pub wrapping_algorithm: String,
    pub wrapping_key_id: String,
    pub wrapping_key_version: String,
    pub data_encryption_algorithm: String,
    pub encrypted_key_data: Vec<u8>,
    pub iv: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredDataEncryptionKey {
    Unencrypted(UnencryptedSymmetricDataEncryptionKey),
    Encrypted(EncryptedSymmetricDataEncryptionKey),
}

static UNENCRYPTED_CODEC: LazyLock<RecordCodec<UnencryptedSymmetricDataEncryptionKey>> =
    LazyLock::new(|| {
        type K = UnencryptedSymmetricDataEncryptionKey;
        RecordCodec::new(
            UNENCRYPTED_MARKER,
            vec![
                Field::new("algorithm", |k: &K| &k.algorithm, |k, v| k.algorithm = v),
                Field::new("key_data", |k: &K| &k.key_data, |k, v| k.key_data = v),
                Field::new("iv", |k: &K| &k.iv, |k, v| k.iv = v),
            ],
        )
    });

static ENCRYPTED_CODEC: LazyLock<RecordCodec<EncryptedSymmetricDataEncryptionKey>> =
    LazyLock::new(|| {
        type K = EncryptedSymmetricDataEncryptionKey;
        RecordCodec::new(
            ENCRYPTED_MARKER,
            vec![
                Field::new(
                    "wrapping_algorithm",
                    |k: &K| &k.wrapping_algorithm,
                    |k, v| k.wrapping_algorithm = v,
                ),
                Field::new(
                    "wrapping_key_id",
                    |k: &K| &k.wrapping_key_id,
                    |k, v| k.wrapping_key_id = v,
                ),
                Field::new(
                    "wrapping_key_version",
                    |k: &K| &k.wrapping_key_version,
                    |k, v| k.wrapping_key_version = v,
                ),
                Field::new(
                    "data_encryption_algorithm",
                    |k: &K| &k.data_encryption_algorithm,
                    |k, v| k.data_encryption_algorithm = v,
                ),
                Field::new(
                    "encrypted_key_data",
                    |k: &K| &k.encrypted_key_data,
                    |k, v| k.encrypted_key_data = v,
                ),
                Field::new("iv", |k: &K| &k.iv, |k, v| k.iv = v),
            ],
        )
    });

impl UnencryptedSymmetricDataEncryptionKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        UNENCRYPTED_CODEC.encode(self)
    }

    /// `Ok(None)` if `bytes` hold another record shape
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        UNENCRYPTED_CODEC.decode(bytes)
    }
}

impl EncryptedSymmetricDataEncryptionKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        ENCRYPTED_CODEC.encode(self)
    }

    /// `Ok(None)` if `bytes` hold another record shape
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        ENCRYPTED_CODEC.decode(bytes)
    }
}

impl StoredDataEncryptionKey {
    pub fn marker(&self) -> char {
        match self {
            StoredDataEncryptionKey::Unencrypted(_) => UNENCRYPTED_MARKER,
            StoredDataEncryptionKey::Encrypted(_) => ENCRYPTED_MARKER,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            StoredDataEncryptionKey::Unencrypted(k) => k.to_bytes(),
            StoredDataEncryptionKey::Encrypted(k) => k.to_bytes(),
        }
    }

    /// Decode whichever variant `bytes` hold
    ///
    /// Markers are probed in a fixed order, `'U'` then `'E'`; the first codec
    /// that recognises its marker decides the result.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if let Some(key) = UnencryptedSymmetricDataEncryptionKey::from_bytes(bytes)? {
            return Ok(StoredDataEncryptionKey::Unencrypted(key));
        }
        if let Some(key) = EncryptedSymmetricDataEncryptionKey::from_bytes(bytes)? {
            return Ok(StoredDataEncryptionKey::Encrypted(key));
        }
        Err(EnvelopeError::Codec(
            "Data does not match any stored key variant".into(),
        ))
    }
}

impl From<UnencryptedSymmetricDataEncryptionKey> for StoredDataEncryptionKey {
    fn from(key: UnencryptedSymmetricDataEncryptionKey) -> Self {
        StoredDataEncryptionKey::Unencrypted(key)
    }
}

impl From<EncryptedSymmetricDataEncryptionKey> for StoredDataEncryptionKey {
    fn from(key: EncryptedSymmetricDataEncryptionKey) -> Self {
        StoredDataEncryptionKey::Encrypted(key)
    }
}

/// Encode several stored keys into one list blob
pub fn encode_key_list(keys: &[StoredDataEncryptionKey]) -> Vec<u8> {
    ListCodec::encode(keys.iter().map(StoredDataEncryptionKey::to_bytes))
}

pub fn decode_key_list(bytes: &[u8]) -> Result<Vec<StoredDataEncryptionKey>> {
    let items = ListCodec::decode(bytes)?
        .ok_or_else(|| EnvelopeError::Codec("Data is not a key list".into()))?;
    items
        .iter()
        .map(|item| StoredDataEncryptionKey::from_bytes(item))
        .collect()
}
