//! Single byte-range requests over encrypted content

use std::fmt;

use crate::crypto::block_start;
use crate::error::{EnvelopeError, Result};

const UNIT_PREFIX: &str = "bytes=";

/// Plaintext byte range with an inclusive end; `end: None` runs to the end
/// of the content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self { start: 0, end: None }
    }

    pub fn starting_from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Bounded range `start..=end`
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(EnvelopeError::InvalidRange(format!(
                "Range end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Parse a `Range` header value
    ///
    /// Accepts `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`, which
    /// needs `content_len`. An empty value or `bytes=-` selects everything.
    pub fn parse(header: &str, content_len: Option<u64>) -> Result<Self> {
        let header = header.trim();
        if header.is_empty() {
            return Ok(Self::full());
        }

        let set = header
            .strip_prefix(UNIT_PREFIX)
            .ok_or_else(|| invalid(header, "expected a 'bytes=' range"))?;
        if set.contains(',') {
            return Err(invalid(header, "multiple ranges are not supported"));
        }
        let (first, last) = set
            .split_once('-')
            .ok_or_else(|| invalid(header, "missing '-'"))?;

        match (first.trim(), last.trim()) {
            ("", "") => Ok(Self::full()),
            ("", suffix) => {
                let suffix = parse_position(header, suffix)?;
                let len = content_len
                    .ok_or_else(|| invalid(header, "suffix range needs the content length"))?;
                Ok(Self::starting_from(len.saturating_sub(suffix)))
            }
            (start, "") => Ok(Self::starting_from(parse_position(header, start)?)),
            (start, end) => {
                let start = parse_position(header, start)?;
                let end = parse_position(header, end)?;
                Self::new(start, end).map_err(|_| invalid(header, "end precedes start"))
            }
        }
    }

    /// Number of bytes covered, if bounded
    ///
    /// Saturates at `u64::MAX` for `0..=u64::MAX`.
    pub fn len(&self) -> Option<u64> {
        self.end
            .and_then(|end| end.checked_sub(self.start))
            .map(|span| span.saturating_add(1))
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// The ciphertext range to fetch: starts on the enclosing block boundary
    pub fn block_aligned(&self) -> Self {
        Self {
            start: block_start(self.start),
            end: self.end,
        }
    }

    pub fn to_header(&self) -> String {
        self.to_string()
    }
}

impl Default for ByteRange {
    fn default() -> Self {
        Self::full()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}{}-{}", UNIT_PREFIX, self.start, end),
            None => write!(f, "{}{}-", UNIT_PREFIX, self.start),
        }
    }
}

fn parse_position(header: &str, digits: &str) -> Result<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(header, "positions must be decimal digits"));
    }
    digits
        .parse()
        .map_err(|_| invalid(header, "position out of range"))
}

fn invalid(header: &str, reason: &str) -> EnvelopeError {
    EnvelopeError::InvalidRange(format!("'{}': {}", header, reason))
}
