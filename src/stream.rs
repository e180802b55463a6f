//! Streaming AES-CTR
//!
//! CTR turns AES into a keystream, so the same reader both encrypts and
//! decrypts. Bytes are transformed as the caller pulls them; nothing is
//! buffered beyond the caller's own read buffer.

use std::io::{self, Read};

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::crypto::{validate_key_len, SecureKey, AES_BLOCK_SIZE};
use crate::error::{EnvelopeError, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES-CTR keystream with a full 128-bit big-endian counter
enum Keystream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl Keystream {
    fn new(key: &SecureKey, iv: &[u8]) -> Result<Self> {
        validate_key_len(key.len())?;
        if iv.len() != AES_BLOCK_SIZE {
            return Err(EnvelopeError::Config(format!(
                "Invalid IV size: expected {}, got {}",
                AES_BLOCK_SIZE,
                iv.len()
            )));
        }

        let init_err = |e: ctr::cipher::InvalidLength| {
            EnvelopeError::Config(format!("Cipher init error: {}", e))
        };
        let key = key.as_bytes();
        let keystream = match key.len() {
            16 => Keystream::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(init_err)?),
            24 => Keystream::Aes192(Aes192Ctr::new_from_slices(key, iv).map_err(init_err)?),
            _ => Keystream::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(init_err)?),
        };
        Ok(keystream)
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Aes128(c) => c.apply_keystream(buf),
            Keystream::Aes192(c) => c.apply_keystream(buf),
            Keystream::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Reader that XORs everything read from `inner` with an AES-CTR keystream
pub struct CtrReader<R> {
    inner: R,
    keystream: Keystream,
}

impl<R: Read> CtrReader<R> {
    /// Start the keystream at counter block `iv`
    ///
    /// Fails with a configuration error for key sizes other than 128, 192 or
    /// 256 bits, or an IV that is not exactly one block.
    pub fn new(inner: R, key: &SecureKey, iv: &[u8]) -> Result<Self> {
        Ok(Self {
            inner,
            keystream: Keystream::new(key, iv)?,
        })
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CtrReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.keystream.apply(&mut buf[..n]);
        Ok(n)
    }
}

impl<R> std::fmt::Debug for CtrReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrReader").finish_non_exhaustive()
    }
}
