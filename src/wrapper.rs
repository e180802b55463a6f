//! Data key wrappers
//!
//! A wrapper turns freshly generated [`EncryptionParameters`] into a
//! [`StoredDataEncryptionKey`] that can be persisted, and back. Several
//! wrappers can protect the same content; on read the first wrapper that
//! supports one of the stored keys unwraps it.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{generate_iv, validate_key_len, KeyGenerator, SecureKey, AES_BLOCK_SIZE};
use crate::error::{EnvelopeError, Result};
use crate::keys::{
    EncryptedSymmetricDataEncryptionKey, StoredDataEncryptionKey,
    UnencryptedSymmetricDataEncryptionKey,
};
use crate::kms::{parse_key_version, KeyManagementClient};

/// Wrapping algorithm recorded by [`TransitKeyWrapper`]
pub const TRANSIT_WRAPPING_ALGORITHM: &str = "vault-transit";

/// Data encryption algorithm recorded in stored keys
pub const DATA_ENCRYPTION_ALGORITHM: &str = "AES";

/// Data key and initial counter block for one piece of content
#[derive(Debug, Clone)]
pub struct EncryptionParameters {
    pub key: SecureKey,
    pub iv: [u8; AES_BLOCK_SIZE],
}

impl EncryptionParameters {
    /// Fresh key of `key_len` bytes and a random IV
    pub fn generate(key_len: usize) -> Result<Self> {
        Ok(Self {
            key: KeyGenerator::global().generate_key(key_len)?,
            iv: generate_iv(),
        })
    }

    fn from_parts(key: Vec<u8>, iv: &[u8]) -> Result<Self> {
        validate_key_len(key.len())?;
        let iv: [u8; AES_BLOCK_SIZE] = iv.try_into().map_err(|_| {
            EnvelopeError::CorruptedContext(format!(
                "Stored IV is {} bytes, expected {}",
                iv.len(),
                AES_BLOCK_SIZE
            ))
        })?;
        Ok(Self {
            key: SecureKey::new(key),
            iv,
        })
    }
}

pub trait DataEncryptionKeyWrapper: Send + Sync {
    /// Whether this wrapper can unwrap `key`
    fn supports(&self, key: &StoredDataEncryptionKey) -> bool;

    fn wrap(&self, params: &EncryptionParameters) -> Result<StoredDataEncryptionKey>;

    fn unwrap(&self, key: &StoredDataEncryptionKey) -> Result<EncryptionParameters>;
}

/// Wraps data keys with one named key of a key management service
pub struct TransitKeyWrapper<K: KeyManagementClient> {
    kms: Arc<K>,
    key_name: String,
}

impl<K: KeyManagementClient> TransitKeyWrapper<K> {
    pub fn new(kms: Arc<K>, key_name: impl Into<String>) -> Self {
        Self {
            kms,
            key_name: key_name.into(),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }
}

impl<K: KeyManagementClient> DataEncryptionKeyWrapper for TransitKeyWrapper<K> {
    fn supports(&self, key: &StoredDataEncryptionKey) -> bool {
        match key {
            StoredDataEncryptionKey::Encrypted(k) => {
                k.wrapping_algorithm == TRANSIT_WRAPPING_ALGORITHM && k.wrapping_key_id == self.key_name
            }
            StoredDataEncryptionKey::Unencrypted(_) => false,
        }
    }

    fn wrap(&self, params: &EncryptionParameters) -> Result<StoredDataEncryptionKey> {
        let encoded = Zeroizing::new(STANDARD.encode(params.key.as_bytes()));
        let ciphertext = self.kms.wrap(&self.key_name, &encoded)?;
        let version = parse_key_version(&ciphertext)?;
        debug!(key = %self.key_name, version, "Wrapped data key for stored key record");

        Ok(StoredDataEncryptionKey::Encrypted(EncryptedSymmetricDataEncryptionKey {
            wrapping_algorithm: TRANSIT_WRAPPING_ALGORITHM.to_string(),
            wrapping_key_id: self.key_name.clone(),
            wrapping_key_version: version.to_string(),
            data_encryption_algorithm: DATA_ENCRYPTION_ALGORITHM.to_string(),
            encrypted_key_data: ciphertext.into_bytes(),
            iv: params.iv.to_vec(),
        }))
    }

    fn unwrap(&self, key: &StoredDataEncryptionKey) -> Result<EncryptionParameters> {
        let StoredDataEncryptionKey::Encrypted(key) = key else {
            return Err(EnvelopeError::KeyManagement(
                "Transit wrapper cannot unwrap an unencrypted key".into(),
            ));
        };
        if key.wrapping_algorithm != TRANSIT_WRAPPING_ALGORITHM || key.wrapping_key_id != self.key_name {
            return Err(EnvelopeError::KeyManagement(format!(
                "Key wrapped by {}/{} is not handled by transit key {}",
                key.wrapping_algorithm, key.wrapping_key_id, self.key_name
            )));
        }

        let ciphertext = std::str::from_utf8(&key.encrypted_key_data).map_err(|_| {
            EnvelopeError::CorruptedContext("Wrapped key is not valid UTF-8".into())
        })?;
        let encoded = Zeroizing::new(self.kms.unwrap(&self.key_name, ciphertext)?);
        let raw = STANDARD.decode(encoded.as_bytes())?;

        EncryptionParameters::from_parts(raw, &key.iv)
    }
}

/// Stores the raw data key, for storage already encrypted at another layer
#[derive(Debug, Default, Clone, Copy)]
pub struct UnencryptedKeyWrapper;

impl DataEncryptionKeyWrapper for UnencryptedKeyWrapper {
    fn supports(&self, key: &StoredDataEncryptionKey) -> bool {
        matches!(
            key,
            StoredDataEncryptionKey::Unencrypted(k) if k.algorithm == DATA_ENCRYPTION_ALGORITHM
        )
    }

    fn wrap(&self, params: &EncryptionParameters) -> Result<StoredDataEncryptionKey> {
        Ok(StoredDataEncryptionKey::Unencrypted(UnencryptedSymmetricDataEncryptionKey {
            algorithm: DATA_ENCRYPTION_ALGORITHM.to_string(),
            key_data: params.key.as_bytes().to_vec(),
            iv: params.iv.to_vec(),
        }))
    }

    fn unwrap(&self, key: &StoredDataEncryptionKey) -> Result<EncryptionParameters> {
        match key {
            StoredDataEncryptionKey::Unencrypted(k) if self.supports(key) => {
                EncryptionParameters::from_parts(k.key_data.clone(), &k.iv)
            }
            _ => Err(EnvelopeError::KeyManagement(
                "Key is not an unencrypted AES key".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::InMemoryTransit;

    fn transit_wrapper() -> (Arc<InMemoryTransit>, TransitKeyWrapper<InMemoryTransit>) {
        let kms = Arc::new(InMemoryTransit::new());
        kms.create_key("orders").unwrap();
        let wrapper = TransitKeyWrapper::new(Arc::clone(&kms), "orders");
        (kms, wrapper)
    }

    #[test]
    fn test_transit_wrap_unwrap() {
        let (_kms, wrapper) = transit_wrapper();
        let params = EncryptionParameters::generate(32).unwrap();

        let stored = wrapper.wrap(&params).unwrap();
        assert!(wrapper.supports(&stored));
        let StoredDataEncryptionKey::Encrypted(ref record) = stored else {
            panic!("expected an encrypted key");
        };
        assert_eq!(record.wrapping_key_version, "1");
        assert_eq!(record.wrapping_algorithm, "vault-transit");

        let unwrapped = wrapper.unwrap(&stored).unwrap();
        assert_eq!(unwrapped.key.as_bytes(), params.key.as_bytes());
        assert_eq!(unwrapped.iv, params.iv);
    }

    #[test]
    fn test_transit_records_rotated_version() {
        let (kms, wrapper) = transit_wrapper();
        let params = EncryptionParameters::generate(32).unwrap();
        let before = wrapper.wrap(&params).unwrap();

        kms.rotate("orders").unwrap();
        let after = wrapper.wrap(&params).unwrap();

        let StoredDataEncryptionKey::Encrypted(ref record) = after else {
            panic!("expected an encrypted key");
        };
        assert_eq!(record.wrapping_key_version, "2");
        assert_eq!(wrapper.unwrap(&before).unwrap().key.as_bytes(), params.key.as_bytes());
    }

    #[test]
    fn test_transit_does_not_support_other_keys() {
        let (kms, wrapper) = transit_wrapper();
        kms.create_key("invoices").unwrap();
        let other = TransitKeyWrapper::new(kms, "invoices");
        let params = EncryptionParameters::generate(32).unwrap();

        let stored = other.wrap(&params).unwrap();
        assert!(!wrapper.supports(&stored));
        assert!(wrapper.unwrap(&stored).is_err());
        assert!(!wrapper.supports(&UnencryptedKeyWrapper.wrap(&params).unwrap()));
    }

    #[test]
    fn test_unencrypted_wrapper() {
        let params = EncryptionParameters::generate(16).unwrap();
        let stored = UnencryptedKeyWrapper.wrap(&params).unwrap();
        assert!(UnencryptedKeyWrapper.supports(&stored));

        let unwrapped = UnencryptedKeyWrapper.unwrap(&stored).unwrap();
        assert_eq!(unwrapped.key.as_bytes(), params.key.as_bytes());
        assert_eq!(unwrapped.iv, params.iv);
    }

    #[test]
    fn test_unwrap_rejects_bad_stored_iv() {
        let stored = StoredDataEncryptionKey::Unencrypted(UnencryptedSymmetricDataEncryptionKey {
            algorithm: "AES".into(),
            key_data: vec![0u8; 32],
            iv: vec![0u8; 12],
        });
        assert!(matches!(
            UnencryptedKeyWrapper.unwrap(&stored),
            Err(EnvelopeError::CorruptedContext(_))
        ));
    }
}
