//! Skipping over a decrypting stream
//!
//! A CTR reader cannot seek: jumping ahead in the ciphertext without running
//! the keystream forward leaves the counter misaligned. Skips are therefore
//! done by reading and discarding through a small scratch buffer.

use std::io::{self, ErrorKind, Read};

use crate::crypto::block_remainder;

/// Upper bound on the scratch buffer used to discard bytes
pub const MAX_SKIP_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipMode {
    /// Stream starts at plaintext offset 0; nothing is discarded up front
    FromStart,
    /// Stream starts at a block boundary; the given number of bytes is
    /// discarded before the first byte is handed out
    BlockRemainder(u64),
}

/// Reader that turns skips into bounded read-and-discard loops
#[derive(Debug)]
pub struct OffsetSkipReader<R> {
    inner: R,
    mode: SkipMode,
    pending: u64,
}

impl<R: Read> OffsetSkipReader<R> {
    pub fn from_start(inner: R) -> Self {
        Self {
            inner,
            mode: SkipMode::FromStart,
            pending: 0,
        }
    }

    /// Wrap a stream positioned at the start of the block containing
    /// `offset`, so that the first byte read is the byte at `offset`
    pub fn block_remainder(inner: R, offset: u64) -> Self {
        let remainder = block_remainder(offset);
        Self {
            inner,
            mode: SkipMode::BlockRemainder(remainder),
            pending: remainder,
        }
    }

    pub fn mode(&self) -> SkipMode {
        self.mode
    }

    /// Skip `n` bytes of the visible stream
    ///
    /// Returns how many bytes were actually skipped, which is less than `n`
    /// only when the stream ended first.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.discard_pending()?;
        discard(&mut self.inner, n)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        if self.pending > 0 {
            discard(&mut self.inner, self.pending)?;
            self.pending = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for OffsetSkipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.discard_pending()?;
        self.inner.read(buf)
    }
}

fn discard<R: Read>(reader: &mut R, n: u64) -> io::Result<u64> {
    if n == 0 {
        return Ok(0);
    }

    let size = n.min(MAX_SKIP_BUFFER_SIZE as u64) as usize;
    let mut scratch = vec![0u8; size];
    let mut remaining = n;

    while remaining > 0 {
        let want = remaining.min(size as u64) as usize;
        match reader.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(read) => remaining -= read as u64,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(n - remaining)
}
