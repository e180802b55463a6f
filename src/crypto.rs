//! Cryptographic primitives for envelope encryption
//!
//! This module provides data key generation, nonce and counter arithmetic for
//! AES-CTR, and the AES-256-GCM helper used to wrap keys inside the in-memory
//! key management service.

use std::sync::OnceLock;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EnvelopeError, Result};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES block size in bytes; also the CTR counter block size
pub const AES_BLOCK_SIZE: usize = 16;

/// Nonce size in bytes (96 bits), used by both CTR contexts and AES-GCM
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AES-256 key from the process-wide generator
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; AES_256_KEY_SIZE];
        KeyGenerator::global().fill(&mut bytes);
        Self { bytes }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Check that `len` bytes is a valid AES key size
pub fn validate_key_len(len: usize) -> Result<()> {
    match len {
        16 | 24 | 32 => Ok(()),
        other => Err(EnvelopeError::Config(format!(
            "Invalid AES key size: {} bytes",
            other
        ))),
    }
}

/// Process-wide data key generator
///
/// Seeded once from the operating system and shared by every thread. Use
/// [`KeyGenerator::global`] rather than building one per call.
pub struct KeyGenerator {
    rng: Mutex<StdRng>,
}

static KEY_GENERATOR: OnceLock<KeyGenerator> = OnceLock::new();

impl KeyGenerator {
    pub fn global() -> &'static KeyGenerator {
        KEY_GENERATOR.get_or_init(|| {
            debug!("Initializing data encryption key generator");
            KeyGenerator {
                rng: Mutex::new(StdRng::from_entropy()),
            }
        })
    }

    /// Generate a fresh AES key of `len` bytes
    pub fn generate_key(&self, len: usize) -> Result<SecureKey> {
        validate_key_len(len)?;
        let mut bytes = vec![0u8; len];
        self.fill(&mut bytes);
        Ok(SecureKey::new(bytes))
    }

    fn fill(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}

/// Generate a fresh 96-bit nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a fresh random 128-bit initialization vector
pub fn generate_iv() -> [u8; AES_BLOCK_SIZE] {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Build the base CTR counter block: the nonce left-justified, zero padded to 16 bytes
pub fn base_iv(nonce: &[u8]) -> Result<[u8; AES_BLOCK_SIZE]> {
    if nonce.len() != NONCE_SIZE {
        return Err(EnvelopeError::Config(format!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    let mut iv = [0u8; AES_BLOCK_SIZE];
    iv[..NONCE_SIZE].copy_from_slice(nonce);
    Ok(iv)
}

/// Number of whole blocks preceding byte `offset`
pub fn block_index(offset: u64) -> u64 {
    offset / AES_BLOCK_SIZE as u64
}

/// Byte position of the start of the block containing `offset`
pub fn block_start(offset: u64) -> u64 {
    offset - block_remainder(offset)
}

/// Position of `offset` within its block
pub fn block_remainder(offset: u64) -> u64 {
    offset % AES_BLOCK_SIZE as u64
}

/// Counter block for the AES block that contains byte `offset`
///
/// The IV is treated as a 128-bit big-endian unsigned integer. The addition
/// wraps modulo 2^128, keeping the low-order 16 bytes, which matches how a
/// 128-bit big-endian CTR counter itself rolls over during encryption.
pub fn iv_for_offset(iv: &[u8; AES_BLOCK_SIZE], offset: u64) -> [u8; AES_BLOCK_SIZE] {
    u128::from_be_bytes(*iv)
        .wrapping_add(u128::from(block_index(offset)))
        .to_be_bytes()
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Encode `nonce ++ ciphertext` as base64
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let combined = [self.nonce.as_slice(), self.ciphertext.as_slice()].concat();
        STANDARD.encode(combined)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let decoded = STANDARD.decode(encoded)?;

        if decoded.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EnvelopeError::KeyManagement(
                "Invalid encrypted data length".into(),
            ));
        }

        let (nonce, ciphertext) = decoded.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM with a fresh random nonce
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedData> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(EnvelopeError::Config(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EnvelopeError::Config(format!("Cipher init error: {}", e)))?;

        let nonce_bytes = generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match aad {
            Some(aad_data) => {
                use aes_gcm::aead::Payload;
                cipher.encrypt(nonce, Payload { msg: plaintext, aad: aad_data })
            }
            None => cipher.encrypt(nonce, plaintext),
        }
        .map_err(|e| EnvelopeError::KeyManagement(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using AES-256-GCM
    pub fn decrypt(key: &SecureKey, encrypted: &EncryptedData, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(EnvelopeError::Config(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }

        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(EnvelopeError::KeyManagement(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EnvelopeError::Config(format!("Cipher init error: {}", e)))?;

        let nonce = Nonce::from_slice(&encrypted.nonce);

        match aad {
            Some(aad_data) => {
                use aes_gcm::aead::Payload;
                cipher.decrypt(
                    nonce,
                    Payload {
                        msg: &encrypted.ciphertext,
                        aad: aad_data,
                    },
                )
            }
            None => cipher.decrypt(nonce, encrypted.ciphertext.as_slice()),
        }
        .map_err(|_| EnvelopeError::KeyManagement("Decryption failed: authentication error".into()))
    }
}
