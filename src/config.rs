//! Engine configuration
//!
//! Configuration can be embedded in a host config (it is `Deserialize`) or
//! loaded from the process environment with [`EngineConfig::from_env`].

use serde::Deserialize;

use crate::error::{EnvelopeError, Result};

/// Key name used when the caller does not name one
pub const DEFAULT_KEY_NAME: &str = "shared-key";

/// Length of a Vault transit ciphertext string for key versions 1 to 9
pub const VAULT_TRANSIT_WRAPPED_KEY_LEN: usize = 105;

/// How the wrapped key and the nonce are laid out in an encryption context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ContextFormat {
    /// `wrapped ++ nonce`, with the wrapped key always exactly `wrapped_key_len` bytes
    Fixed { wrapped_key_len: usize },
    /// `len:u32 BE ++ wrapped ++ nonce`
    LengthPrefixed,
}

impl Default for ContextFormat {
    fn default() -> Self {
        ContextFormat::Fixed {
            wrapped_key_len: VAULT_TRANSIT_WRAPPED_KEY_LEN,
        }
    }
}

impl std::str::FromStr for ContextFormat {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("length-prefixed") {
            return Ok(ContextFormat::LengthPrefixed);
        }
        if let Some(len) = s.strip_prefix("fixed:") {
            let wrapped_key_len = len.trim().parse::<usize>().map_err(|e| {
                EnvelopeError::Config(format!("Invalid fixed context length '{}': {}", len, e))
            })?;
            return Ok(ContextFormat::Fixed { wrapped_key_len });
        }
        Err(EnvelopeError::Config(format!(
            "Unknown context format '{}', expected 'fixed:<len>' or 'length-prefixed'",
            s
        )))
    }
}

/// Engine settings
///
/// The default fixed context layout fits transit ciphertexts of key versions
/// 1 to 9 only. Deployments that rotate further need
/// [`ContextFormat::LengthPrefixed`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_key_name: String,
    pub context_format: ContextFormat,
    pub key_size_bits: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_key_name: DEFAULT_KEY_NAME.to_string(),
            context_format: ContextFormat::default(),
            key_size_bits: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ENVELOPE_KEY_NAME`, `ENVELOPE_CONTEXT_FORMAT`
    /// and `ENVELOPE_KEY_BITS`, falling back to defaults for unset variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("ENVELOPE_KEY_NAME") {
            config.default_key_name = name;
        }
        if let Ok(format) = std::env::var("ENVELOPE_CONTEXT_FORMAT") {
            config.context_format = format.parse()?;
        }
        if let Ok(bits) = std::env::var("ENVELOPE_KEY_BITS") {
            config.key_size_bits = bits.trim().parse().map_err(|e| {
                EnvelopeError::Config(format!("Invalid ENVELOPE_KEY_BITS '{}': {}", bits, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.key_size_bits, 128 | 192 | 256) {
            return Err(EnvelopeError::Config(format!(
                "Unsupported AES key size: {} bits",
                self.key_size_bits
            )));
        }
        if self.default_key_name.is_empty() {
            return Err(EnvelopeError::Config("Default key name must not be empty".into()));
        }
        if let ContextFormat::Fixed { wrapped_key_len: 0 } = self.context_format {
            return Err(EnvelopeError::Config(
                "Fixed context layout needs a non-zero wrapped key length".into(),
            ));
        }
        Ok(())
    }

    /// Key size in bytes
    pub fn key_len(&self) -> usize {
        self.key_size_bits / 8
    }
}
