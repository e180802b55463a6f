//! Envelope encryption engine
//!
//! Every piece of content gets its own data key. The data key encrypts the
//! content with AES-CTR and is itself wrapped by the key management service;
//! only the wrapped form is ever persisted, inside the encryption context.
//! Because CTR needs no padding and the counter for any block can be
//! computed directly, ciphertext length equals plaintext length and a
//! decrypt can start at any byte offset.

use std::io::{self, Read, Take};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{ContextFormat, EngineConfig};
use crate::context::EncryptionContext;
use crate::crypto::{
    base_iv, generate_nonce, iv_for_offset, validate_key_len, KeyGenerator, SecureKey,
    AES_BLOCK_SIZE,
};
use crate::error::{EnvelopeError, Result};
use crate::keys::StoredDataEncryptionKey;
use crate::kms::KeyManagementClient;
use crate::range::ByteRange;
use crate::skip::OffsetSkipReader;
use crate::stream::CtrReader;
use crate::wrapper::{DataEncryptionKeyWrapper, EncryptionParameters};

/// Plaintext stream produced by [`EnvelopeEncryption::decrypt`]
pub type DecryptingReader<R> = OffsetSkipReader<CtrReader<R>>;

/// Plaintext stream limited to one requested range
pub type RangeReader<R> = Take<DecryptingReader<R>>;

pub struct EnvelopeEncryption<K: KeyManagementClient> {
    kms: Arc<K>,
    config: EngineConfig,
}

impl<K: KeyManagementClient> EnvelopeEncryption<K> {
    pub fn new(kms: Arc<K>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { kms, config })
    }

    pub fn with_defaults(kms: Arc<K>) -> Self {
        Self {
            kms,
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn kms(&self) -> &Arc<K> {
        &self.kms
    }

    /// Make sure the default key exists in the key management service
    pub fn init(&self) -> Result<()> {
        self.kms.create_key(&self.config.default_key_name)?;
        info!(key = %self.config.default_key_name, "Envelope encryption ready");
        Ok(())
    }

    /// Encrypt `plaintext` under a fresh data key wrapped by `key_name`
    ///
    /// Returns the ciphertext stream, which has the same length as the
    /// plaintext, and the encryption context to persist alongside it. No
    /// plaintext is read before the first read on the returned stream.
    pub fn encrypt<R: Read>(&self, plaintext: R, key_name: &str) -> Result<(CtrReader<R>, Vec<u8>)> {
        let dek = KeyGenerator::global().generate_key(self.config.key_len())?;
        let nonce = generate_nonce();

        self.kms.create_key(key_name)?;
        let encoded = Zeroizing::new(STANDARD.encode(dek.as_bytes()));
        let wrapped = self.kms.wrap(key_name, &encoded)?;

        let context =
            EncryptionContext::new(wrapped.into_bytes(), nonce).to_bytes(self.config.context_format)?;
        let stream = CtrReader::new(plaintext, &dek, &base_iv(&nonce)?)?;

        debug!(key = key_name, context_len = context.len(), "Encrypting content");
        Ok((stream, context))
    }

    /// [`encrypt`](Self::encrypt) with the configured default key
    pub fn encrypt_default<R: Read>(&self, plaintext: R) -> Result<(CtrReader<R>, Vec<u8>)> {
        self.encrypt(plaintext, &self.config.default_key_name)
    }

    /// Decrypt content starting at plaintext byte `offset`
    ///
    /// `ciphertext` must start at `block_start(offset)`, the beginning of the
    /// AES block containing `offset`. The returned stream yields the
    /// plaintext from `offset` to the end of `ciphertext`.
    ///
    /// With `offset == 0` the stream is in from-start mode, so a caller that
    /// did not range-fetch can still reach a later position with
    /// [`OffsetSkipReader::skip`].
    pub fn decrypt<R: Read>(
        &self,
        context: &[u8],
        ciphertext: R,
        offset: u64,
        key_name: &str,
    ) -> Result<DecryptingReader<R>> {
        let context = EncryptionContext::from_bytes(context, self.config.context_format)?;
        let wrapped = context.wrapped_key_str()?;

        let encoded = Zeroizing::new(self.kms.unwrap(key_name, wrapped)?);
        let dek = SecureKey::new(STANDARD.decode(encoded.as_bytes())?);
        validate_key_len(dek.len())?;

        debug!(key = key_name, offset, "Decrypting content");
        open_at(ciphertext, &dek, &base_iv(context.nonce())?, offset)
    }

    /// [`decrypt`](Self::decrypt) with the configured default key
    pub fn decrypt_default<R: Read>(
        &self,
        context: &[u8],
        ciphertext: R,
        offset: u64,
    ) -> Result<DecryptingReader<R>> {
        self.decrypt(context, ciphertext, offset, &self.config.default_key_name)
    }

    /// Rotate the wrapping key; existing contexts stay decryptable
    ///
    /// With a fixed context layout, later encrypts fail with
    /// [`EnvelopeError::Config`] once the new version makes the wrapped key
    /// longer than the layout allows.
    pub fn rotate(&self, key_name: &str) -> Result<()> {
        self.kms.rotate(key_name)?;
        info!(key = key_name, "Rotated wrapping key");

        if let ContextFormat::Fixed { wrapped_key_len } = self.config.context_format {
            warn!(
                key = key_name,
                wrapped_key_len,
                "Fixed context layout in use; encrypts fail if the rotated key wraps to another length"
            );
        }
        Ok(())
    }

    /// Encrypt `plaintext` with one data key stored once per wrapper
    ///
    /// Each wrapper produces its own [`StoredDataEncryptionKey`] for the same
    /// key and IV, so any one of them is enough to decrypt.
    pub fn encrypt_with_wrappers<R: Read>(
        &self,
        plaintext: R,
        wrappers: &[&dyn DataEncryptionKeyWrapper],
    ) -> Result<(CtrReader<R>, Vec<StoredDataEncryptionKey>)> {
        if wrappers.is_empty() {
            return Err(EnvelopeError::Config("No data key wrappers given".into()));
        }

        let params = EncryptionParameters::generate(self.config.key_len())?;
        let keys = wrappers
            .iter()
            .map(|wrapper| wrapper.wrap(&params))
            .collect::<Result<Vec<_>>>()?;
        let stream = CtrReader::new(plaintext, &params.key, &params.iv)?;

        debug!(keys = keys.len(), "Encrypting content with stored data keys");
        Ok((stream, keys))
    }

    /// Decrypt `range` of content encrypted by
    /// [`encrypt_with_wrappers`](Self::encrypt_with_wrappers)
    ///
    /// The first wrapper supporting one of `keys` unwraps it. `fetch` is then
    /// asked for the ciphertext covering the block-aligned range, and the
    /// returned stream yields exactly the requested plaintext bytes.
    pub fn decrypt_with_wrappers<R, F>(
        &self,
        keys: &[StoredDataEncryptionKey],
        wrappers: &[&dyn DataEncryptionKeyWrapper],
        range: ByteRange,
        fetch: F,
    ) -> Result<RangeReader<R>>
    where
        R: Read,
        F: FnOnce(ByteRange) -> io::Result<R>,
    {
        let (wrapper, key) = wrappers
            .iter()
            .find_map(|wrapper| {
                keys.iter()
                    .find(|key| wrapper.supports(key))
                    .map(|key| (wrapper, key))
            })
            .ok_or_else(|| {
                EnvelopeError::KeyManagement(format!(
                    "None of {} wrappers supports any of {} stored keys",
                    wrappers.len(),
                    keys.len()
                ))
            })?;

        let params = wrapper.unwrap(key)?;
        let ciphertext = fetch(range.block_aligned())?;

        debug!(range = %range, marker = %key.marker(), "Decrypting content range");
        let reader = open_at(ciphertext, &params.key, &params.iv, range.start)?;
        Ok(reader.take(range.len().unwrap_or(u64::MAX)))
    }
}

/// Decrypting stream for ciphertext that starts at the block containing
/// `offset`
fn open_at<R: Read>(
    ciphertext: R,
    key: &SecureKey,
    iv: &[u8; AES_BLOCK_SIZE],
    offset: u64,
) -> Result<DecryptingReader<R>> {
    let stream = CtrReader::new(ciphertext, key, &iv_for_offset(iv, offset))?;
    if offset == 0 {
        Ok(OffsetSkipReader::from_start(stream))
    } else {
        Ok(OffsetSkipReader::block_remainder(stream, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::block_start;
    use crate::kms::InMemoryTransit;
    use crate::wrapper::{TransitKeyWrapper, UnencryptedKeyWrapper};

    const GREETING: &[u8] = b"Hello Client-side encryption World!";

    fn engine() -> EnvelopeEncryption<InMemoryTransit> {
        let engine = EnvelopeEncryption::with_defaults(Arc::new(InMemoryTransit::new()));
        engine.init().unwrap();
        engine
    }

    fn encrypt_all(engine: &EnvelopeEncryption<InMemoryTransit>, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let (mut stream, context) = engine.encrypt_default(plaintext).unwrap();
        let mut ciphertext = Vec::new();
        stream.read_to_end(&mut ciphertext).unwrap();
        (ciphertext, context)
    }

    fn decrypt_from(
        engine: &EnvelopeEncryption<InMemoryTransit>,
        context: &[u8],
        ciphertext: &[u8],
        offset: u64,
    ) -> Vec<u8> {
        let start = block_start(offset) as usize;
        let mut reader = engine
            .decrypt_default(context, &ciphertext[start..], offset)
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_lengths() {
        let engine = engine();
        for len in [0usize, 1, 16, 40, 48] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let (ciphertext, context) = encrypt_all(&engine, &plaintext);
            assert_eq!(ciphertext.len(), len);
            assert_eq!(context.len(), 117);
            assert_eq!(decrypt_from(&engine, &context, &ciphertext, 0), plaintext);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let engine = engine();
        let (ciphertext, _) = encrypt_all(&engine, GREETING);
        assert_ne!(ciphertext, GREETING);
    }

    #[test]
    fn test_contexts_are_unique() {
        let engine = engine();
        let (first, ctx1) = encrypt_all(&engine, GREETING);
        let (second, ctx2) = encrypt_all(&engine, GREETING);
        assert_ne!(ctx1, ctx2);
        assert_ne!(first, second);
    }

    #[test]
    fn test_decrypt_every_offset() {
        let engine = engine();
        let plaintext: Vec<u8> = (0..40u8).collect();
        let (ciphertext, context) = encrypt_all(&engine, &plaintext);

        for offset in 0..=40u64 {
            let out = decrypt_from(&engine, &context, &ciphertext, offset);
            assert_eq!(out, &plaintext[offset as usize..], "offset {offset}");
        }
    }

    #[test]
    fn test_range_decrypt_mid_block() {
        let engine = engine();
        let (ciphertext, context) = encrypt_all(&engine, GREETING);

        let reader = engine.decrypt_default(&context, &ciphertext[16..], 18).unwrap();
        let mut word = Vec::new();
        reader.take(10).read_to_end(&mut word).unwrap();
        assert_eq!(word, b"encryption");
    }

    #[test]
    fn test_from_start_skip() {
        let engine = engine();
        let (ciphertext, context) = encrypt_all(&engine, GREETING);

        let mut reader = engine.decrypt_default(&context, ciphertext.as_slice(), 0).unwrap();
        assert_eq!(reader.skip(6).unwrap(), 6);
        let mut word = [0u8; 11];
        reader.read_exact(&mut word).unwrap();
        assert_eq!(&word, b"Client-side");
    }

    #[test]
    fn test_rotation_keeps_old_contexts() {
        let engine = engine();
        let (old_ct, old_ctx) = encrypt_all(&engine, GREETING);

        engine.rotate("shared-key").unwrap();
        let (new_ct, new_ctx) = encrypt_all(&engine, b"after rotation");

        assert_eq!(&old_ctx[..9], b"vault:v1:");
        assert_eq!(&new_ctx[..9], b"vault:v2:");
        assert_eq!(decrypt_from(&engine, &old_ctx, &old_ct, 0), GREETING);
        assert_eq!(decrypt_from(&engine, &new_ctx, &new_ct, 0), b"after rotation");
    }

    #[test]
    fn test_short_context_is_corrupt() {
        let engine = engine();
        let (ciphertext, context) = encrypt_all(&engine, GREETING);
        let result = engine.decrypt_default(&context[..context.len() - 1], ciphertext.as_slice(), 0);
        assert!(matches!(result, Err(EnvelopeError::CorruptedContext(_))));
    }

    #[test]
    fn test_unknown_key_fails_decrypt() {
        let engine = engine();
        let (ciphertext, context) = encrypt_all(&engine, GREETING);
        let result = engine.decrypt(&context, ciphertext.as_slice(), 0, "missing");
        assert!(matches!(result, Err(EnvelopeError::KeyManagement(_))));
    }

    #[test]
    fn test_fixed_layout_breaks_at_version_ten() {
        let engine = engine();
        for _ in 1..10 {
            engine.rotate("shared-key").unwrap();
        }
        let result = engine.encrypt_default(GREETING);
        assert!(matches!(result, Err(EnvelopeError::Config(_))));
    }

    #[test]
    fn test_length_prefixed_survives_version_ten() {
        let config = EngineConfig {
            context_format: ContextFormat::LengthPrefixed,
            ..EngineConfig::default()
        };
        let engine = EnvelopeEncryption::new(Arc::new(InMemoryTransit::new()), config).unwrap();
        engine.init().unwrap();
        for _ in 1..10 {
            engine.rotate("shared-key").unwrap();
        }

        let (ciphertext, context) = encrypt_all(&engine, GREETING);
        assert_eq!(&context[..4], &106u32.to_be_bytes());
        assert_eq!(decrypt_from(&engine, &context, &ciphertext, 7), &GREETING[7..]);
    }

    #[test]
    fn test_aes_128_keys() {
        let config = EngineConfig {
            key_size_bits: 128,
            context_format: ContextFormat::LengthPrefixed,
            ..EngineConfig::default()
        };
        let engine = EnvelopeEncryption::new(Arc::new(InMemoryTransit::new()), config).unwrap();
        let (ciphertext, context) = encrypt_all(&engine, GREETING);
        assert_eq!(decrypt_from(&engine, &context, &ciphertext, 20), &GREETING[20..]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            key_size_bits: 100,
            ..EngineConfig::default()
        };
        assert!(matches!(
            EnvelopeEncryption::new(Arc::new(InMemoryTransit::new()), config),
            Err(EnvelopeError::Config(_))
        ));
    }

    #[test]
    fn test_wrappers_range_decrypt() {
        let engine = engine();
        let kms = Arc::clone(engine.kms());
        let transit = TransitKeyWrapper::new(kms, "shared-key");
        let raw = UnencryptedKeyWrapper;

        let (mut stream, keys) = engine
            .encrypt_with_wrappers(GREETING, &[&transit, &raw])
            .unwrap();
        let mut ciphertext = Vec::new();
        stream.read_to_end(&mut ciphertext).unwrap();
        assert_eq!(keys.len(), 2);

        let range = ByteRange::parse("bytes=18-27", None).unwrap();
        let mut fetched = None;
        let mut reader = engine
            .decrypt_with_wrappers(&keys, &[&raw], range, |aligned| {
                fetched = Some(aligned);
                let end = aligned.end.map_or(ciphertext.len(), |e| e as usize + 1);
                Ok(&ciphertext[aligned.start as usize..end])
            })
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"encryption");
        assert_eq!(fetched, Some(ByteRange { start: 16, end: Some(27) }));
    }

    #[test]
    fn test_wrappers_open_ended_range() {
        let engine = engine();
        let transit = TransitKeyWrapper::new(Arc::clone(engine.kms()), "shared-key");

        let (mut stream, keys) = engine.encrypt_with_wrappers(GREETING, &[&transit]).unwrap();
        let mut ciphertext = Vec::new();
        stream.read_to_end(&mut ciphertext).unwrap();

        let mut reader = engine
            .decrypt_with_wrappers(&keys, &[&transit], ByteRange::starting_from(6), |aligned| {
                Ok(&ciphertext[aligned.start as usize..])
            })
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, &GREETING[6..]);
    }

    #[test]
    fn test_wrappers_unbounded_end() {
        let engine = engine();
        let (mut stream, keys) = engine
            .encrypt_with_wrappers(GREETING, &[&UnencryptedKeyWrapper])
            .unwrap();
        let mut ciphertext = Vec::new();
        stream.read_to_end(&mut ciphertext).unwrap();

        let range = ByteRange::parse("bytes=6-18446744073709551615", None).unwrap();
        let mut out = Vec::new();
        engine
            .decrypt_with_wrappers(&keys, &[&UnencryptedKeyWrapper], range, |aligned| {
                Ok(&ciphertext[aligned.start as usize..])
            })
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, &GREETING[6..]);
    }

    #[test]
    fn test_fixed_layout_rotation_up_to_version_nine() {
        let engine = engine();
        for _ in 1..9 {
            engine.rotate("shared-key").unwrap();
        }
        assert_eq!(engine.kms().key_version("shared-key"), Some(9));
        let (ciphertext, context) = encrypt_all(&engine, GREETING);
        assert_eq!(&context[..9], b"vault:v9:");
        assert_eq!(decrypt_from(&engine, &context, &ciphertext, 0), GREETING);

        engine.rotate("shared-key").unwrap();
        assert!(matches!(
            engine.encrypt_default(GREETING),
            Err(EnvelopeError::Config(_))
        ));
    }

    #[test]
    fn test_no_supporting_wrapper() {
        let engine = engine();
        let (_, keys) = engine
            .encrypt_with_wrappers(GREETING, &[&UnencryptedKeyWrapper])
            .unwrap();
        let transit = TransitKeyWrapper::new(Arc::clone(engine.kms()), "shared-key");

        let result = engine.decrypt_with_wrappers(&keys, &[&transit], ByteRange::full(), |_| {
            Ok(io::empty())
        });
        assert!(matches!(result, Err(EnvelopeError::KeyManagement(_))));
        assert!(engine.encrypt_with_wrappers(GREETING, &[]).is_err());
    }
}
