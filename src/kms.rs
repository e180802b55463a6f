//! Key management service abstraction
//!
//! The engine never holds a long-term key. Data keys are wrapped and unwrapped
//! by a [`KeyManagementClient`], modeled on a transit-style secrets engine
//! where a named key has numbered versions and ciphertexts carry the version
//! that produced them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey};
use crate::error::{EnvelopeError, Result};

/// Prefix of transit ciphertext strings, followed by `v<version>:`
pub const TRANSIT_PREFIX: &str = "vault";

/// Client for an external key management service
///
/// Implementations must be safe to share across threads. Calls block the
/// calling thread; retries belong to the implementation or its caller.
pub trait KeyManagementClient: Send + Sync {
    /// Create the named key; succeeds without change if it already exists
    fn create_key(&self, name: &str) -> Result<()>;

    /// Wrap a base64-encoded raw key with the latest version of `name`
    fn wrap(&self, name: &str, base64_key: &str) -> Result<String>;

    /// Unwrap a ciphertext produced by [`wrap`](Self::wrap), using whichever
    /// key version it was wrapped with, and return the base64-encoded raw key
    fn unwrap(&self, name: &str, ciphertext: &str) -> Result<String>;

    /// Add a new version of `name`; later wraps use it
    fn rotate(&self, name: &str) -> Result<()>;
}

/// Extract the key version from a `vault:v<N>:<payload>` ciphertext
pub fn parse_key_version(ciphertext: &str) -> Result<u32> {
    let (version, _) = split_ciphertext(ciphertext)?;
    Ok(version)
}

fn split_ciphertext(ciphertext: &str) -> Result<(u32, &str)> {
    let mut parts = ciphertext.splitn(3, ':');
    let (Some(prefix), Some(version), Some(payload)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(EnvelopeError::KeyManagement(
            "Malformed transit ciphertext".into(),
        ));
    };

    if prefix != TRANSIT_PREFIX {
        return Err(EnvelopeError::KeyManagement(format!(
            "Unexpected ciphertext prefix '{}'",
            prefix
        )));
    }

    let version = version
        .strip_prefix('v')
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| {
            EnvelopeError::KeyManagement(format!("Invalid key version '{}'", version))
        })?;

    Ok((version, payload))
}

/// One version of a named key
struct KeyVersion {
    key: SecureKey,
    created_at: DateTime<Utc>,
}

struct TransitKey {
    versions: BTreeMap<u32, KeyVersion>,
    latest_version: u32,
    min_decryption_version: u32,
}

impl TransitKey {
    fn new() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(
            1,
            KeyVersion {
                key: SecureKey::generate(),
                created_at: Utc::now(),
            },
        );
        Self {
            versions,
            latest_version: 1,
            min_decryption_version: 1,
        }
    }
}

/// Summary of a named key held by [`InMemoryTransit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitKeyInfo {
    pub name: String,
    pub latest_version: u32,
    pub min_decryption_version: u32,
    pub retained_versions: usize,
    pub created_at: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
}

/// In-process transit engine
///
/// Behaves like a transit secrets engine: versioned AES-256-GCM keys per name,
/// ciphertexts of the form `vault:v<N>:<base64(nonce ++ ciphertext)>`, and old
/// versions kept for unwrapping until trimmed. Suitable for development,
/// testing and single-process deployments; keys are lost on exit.
pub struct InMemoryTransit {
    keys: RwLock<HashMap<String, TransitKey>>,
}

impl InMemoryTransit {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Latest version of `name`, if it exists
    pub fn key_version(&self, name: &str) -> Option<u32> {
        self.keys.read().get(name).map(|k| k.latest_version)
    }

    pub fn key_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn key_info(&self, name: &str) -> Option<TransitKeyInfo> {
        let keys = self.keys.read();
        let key = keys.get(name)?;
        let oldest = key.versions.values().next()?;
        let newest = key.versions.values().next_back()?;
        Some(TransitKeyInfo {
            name: name.to_string(),
            latest_version: key.latest_version,
            min_decryption_version: key.min_decryption_version,
            retained_versions: key.versions.len(),
            created_at: oldest.created_at,
            rotated_at: newest.created_at,
        })
    }

    /// Refuse to unwrap ciphertexts produced by versions below `version`
    pub fn set_min_decryption_version(&self, name: &str, version: u32) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(name)
            .ok_or_else(|| EnvelopeError::KeyManagement(format!("Key not found: {}", name)))?;

        if version == 0 || version > key.latest_version {
            return Err(EnvelopeError::KeyManagement(format!(
                "Minimum decryption version {} outside 1..={}",
                version, key.latest_version
            )));
        }

        key.min_decryption_version = version;
        info!(key = name, version, "Set minimum decryption version");
        Ok(())
    }

    /// Delete key versions below the minimum decryption version
    ///
    /// Returns how many versions were removed.
    pub fn trim(&self, name: &str) -> Result<usize> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(name)
            .ok_or_else(|| EnvelopeError::KeyManagement(format!("Key not found: {}", name)))?;

        let keep = key.versions.split_off(&key.min_decryption_version);
        let removed = key.versions.len();
        key.versions = keep;

        info!(key = name, removed, "Trimmed key versions");
        Ok(removed)
    }
}

impl Default for InMemoryTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyManagementClient for InMemoryTransit {
    fn create_key(&self, name: &str) -> Result<()> {
        if self.keys.read().contains_key(name) {
            return Ok(());
        }

        let mut keys = self.keys.write();
        if !keys.contains_key(name) {
            keys.insert(name.to_string(), TransitKey::new());
            info!(key = name, "Created transit key");
        }
        Ok(())
    }

    fn wrap(&self, name: &str, base64_key: &str) -> Result<String> {
        let keys = self.keys.read();
        let key = keys
            .get(name)
            .ok_or_else(|| EnvelopeError::KeyManagement(format!("Key not found: {}", name)))?;

        let version = key.latest_version;
        let material = key.versions.get(&version).ok_or_else(|| {
            EnvelopeError::KeyManagement(format!("Key {} has no version {}", name, version))
        })?;

        let encrypted =
            AesGcmCipher::encrypt(&material.key, base64_key.as_bytes(), Some(name.as_bytes()))?;
        debug!(key = name, version, "Wrapped data key");

        Ok(format!("{}:v{}:{}", TRANSIT_PREFIX, version, encrypted.to_base64()))
    }

    fn unwrap(&self, name: &str, ciphertext: &str) -> Result<String> {
        let (version, payload) = split_ciphertext(ciphertext)?;

        let keys = self.keys.read();
        let key = keys
            .get(name)
            .ok_or_else(|| EnvelopeError::KeyManagement(format!("Key not found: {}", name)))?;

        if version < key.min_decryption_version {
            return Err(EnvelopeError::KeyManagement(format!(
                "Key {} version {} is below the minimum decryption version {}",
                name, version, key.min_decryption_version
            )));
        }

        let material = key.versions.get(&version).ok_or_else(|| {
            EnvelopeError::KeyManagement(format!("Key {} has no version {}", name, version))
        })?;

        let encrypted = EncryptedData::from_base64(payload)?;
        let plaintext = AesGcmCipher::decrypt(&material.key, &encrypted, Some(name.as_bytes()))?;
        debug!(key = name, version, "Unwrapped data key");

        String::from_utf8(plaintext)
            .map_err(|_| EnvelopeError::KeyManagement("Unwrapped key is not valid UTF-8".into()))
    }

    fn rotate(&self, name: &str) -> Result<()> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(name)
            .ok_or_else(|| EnvelopeError::KeyManagement(format!("Key not found: {}", name)))?;

        let new_version = key.latest_version + 1;
        key.versions.insert(
            new_version,
            KeyVersion {
                key: SecureKey::generate(),
                created_at: Utc::now(),
            },
        );
        key.latest_version = new_version;

        info!(key = name, version = new_version, "Rotated transit key");
        Ok(())
    }
}
