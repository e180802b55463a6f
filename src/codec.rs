//! Schema-driven binary codec for small fixed-shape records
//!
//! Record layout, all integers big-endian:
//!
//! ```text
//! marker:u16 | field_count:i32 | (length:i32 | bytes[length])*
//! ```
//!
//! The marker identifies the record shape, so several record types can share
//! one storage column and be told apart on read: decoding with the wrong
//! codec yields `Ok(None)` instead of an error.
//!
//! A field that writes or reads a different number of bytes than it declared
//! is a bug in the field definition, not bad input, and panics.

use crate::error::{EnvelopeError, Result};

const MARKER_SIZE: usize = 2;
const LENGTH_SIZE: usize = 4;

/// Marker of the list framing produced by [`ListCodec`]
pub const LIST_MARKER: char = 'L';

/// A value that can be stored as one length-prefixed field
pub trait FieldType: Sized {
    /// Number of bytes [`write`](Self::write) will emit
    fn encoded_len(&self) -> usize;

    fn write(&self, out: &mut Vec<u8>);

    /// Read a value of `len` bytes from the front of `input`, advancing it
    fn read(input: &mut &[u8], len: usize) -> Result<Self>;
}

impl FieldType for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn read(input: &mut &[u8], len: usize) -> Result<Self> {
        let (value, rest) = input.split_at(len);
        *input = rest;
        Ok(value.to_vec())
    }
}

impl FieldType for String {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn read(input: &mut &[u8], len: usize) -> Result<Self> {
        let bytes = Vec::<u8>::read(input, len)?;
        String::from_utf8(bytes)
            .map_err(|e| EnvelopeError::Codec(format!("Invalid UTF-8 in string field: {}", e)))
    }
}

type LenFn<D> = Box<dyn Fn(&D) -> usize + Send + Sync>;
type WriteFn<D> = Box<dyn Fn(&D, &mut Vec<u8>) + Send + Sync>;
type ReadFn<D> = Box<dyn Fn(&mut D, &mut &[u8], usize) -> Result<()> + Send + Sync>;

/// One field of a record schema
pub struct Field<D> {
    name: &'static str,
    encoded_len: LenFn<D>,
    write: WriteFn<D>,
    read: ReadFn<D>,
}

impl<D: 'static> Field<D> {
    pub fn new<T: FieldType + 'static>(
        name: &'static str,
        get: fn(&D) -> &T,
        set: fn(&mut D, T),
    ) -> Self {
        Self {
            name,
            encoded_len: Box::new(move |record: &D| get(record).encoded_len()),
            write: Box::new(move |record: &D, out: &mut Vec<u8>| get(record).write(out)),
            read: Box::new(move |record: &mut D, input: &mut &[u8], len: usize| {
                set(record, T::read(input, len)?);
                Ok(())
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Codec for one record shape, identified by its marker
pub struct RecordCodec<D> {
    marker: u16,
    fields: Vec<Field<D>>,
}

impl<D: Default> RecordCodec<D> {
    /// # Panics
    ///
    /// If `marker` does not fit in a single UTF-16 code unit.
    pub fn new(marker: char, fields: Vec<Field<D>>) -> Self {
        Self {
            marker: marker_code(marker),
            fields,
        }
    }

    pub fn marker(&self) -> char {
        char::from_u32(u32::from(self.marker)).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    /// Encode `record`; the same record always yields the same bytes
    pub fn encode(&self, record: &D) -> Vec<u8> {
        let body: usize = self
            .fields
            .iter()
            .map(|f| LENGTH_SIZE + (f.encoded_len)(record))
            .sum();

        let mut out = Vec::with_capacity(MARKER_SIZE + LENGTH_SIZE + body);
        out.extend_from_slice(&self.marker.to_be_bytes());
        out.extend_from_slice(&to_length(self.fields.len()).to_be_bytes());

        for field in &self.fields {
            let len = (field.encoded_len)(record);
            out.extend_from_slice(&to_length(len).to_be_bytes());

            let start = out.len();
            (field.write)(record, &mut out);
            let written = out.len() - start;
            assert_eq!(
                written, len,
                "field '{}' wrote {} bytes but declared {}",
                field.name, written, len
            );
        }

        out
    }

    /// Decode `bytes`, or return `Ok(None)` if they carry another marker
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<D>> {
        let mut input = bytes;
        if read_marker(&mut input)? != self.marker {
            return Ok(None);
        }

        let count = read_length(&mut input)?;
        if count != self.fields.len() {
            return Err(EnvelopeError::Codec(format!(
                "Record '{}' has {} fields, data declares {}",
                self.marker(),
                self.fields.len(),
                count
            )));
        }

        let mut record = D::default();
        for field in &self.fields {
            let len = read_length(&mut input)?;
            if len > input.len() {
                return Err(EnvelopeError::Codec(format!(
                    "Field '{}' declares {} bytes but only {} remain",
                    field.name,
                    len,
                    input.len()
                )));
            }

            let before = input.len();
            (field.read)(&mut record, &mut input, len)?;
            let consumed = before - input.len();
            assert_eq!(
                consumed, len,
                "field '{}' read {} bytes but declared {}",
                field.name, consumed, len
            );
        }

        if !input.is_empty() {
            return Err(EnvelopeError::Codec(format!(
                "{} trailing bytes after record '{}'",
                input.len(),
                self.marker()
            )));
        }

        Ok(Some(record))
    }
}

/// Frames a sequence of opaque blobs: `marker:u16 | (length:i32 | bytes[length])*`
///
/// There is no element count; the list ends where the buffer ends.
pub struct ListCodec;

impl ListCodec {
    pub fn encode<I, T>(items: I) -> Vec<u8>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut out = Vec::new();
        out.extend_from_slice(&marker_code(LIST_MARKER).to_be_bytes());
        for item in items {
            let item = item.as_ref();
            out.extend_from_slice(&to_length(item.len()).to_be_bytes());
            out.extend_from_slice(item);
        }
        out
    }

    /// Split a list back into its elements, or `Ok(None)` for a non-list marker
    pub fn decode(bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let mut input = bytes;
        if read_marker(&mut input)? != marker_code(LIST_MARKER) {
            return Ok(None);
        }

        let mut items = Vec::new();
        while !input.is_empty() {
            let len = read_length(&mut input)?;
            if len > input.len() {
                return Err(EnvelopeError::Codec(format!(
                    "List element declares {} bytes but only {} remain",
                    len,
                    input.len()
                )));
            }
            items.push(Vec::<u8>::read(&mut input, len)?);
        }
        Ok(Some(items))
    }
}

fn marker_code(marker: char) -> u16 {
    match u16::try_from(u32::from(marker)) {
        Ok(code) => code,
        Err(_) => panic!("marker '{}' does not fit in two bytes", marker),
    }
}

fn to_length(len: usize) -> i32 {
    match i32::try_from(len) {
        Ok(len) => len,
        Err(_) => panic!("length {} exceeds the codec's 32-bit limit", len),
    }
}

fn read_marker(input: &mut &[u8]) -> Result<u16> {
    if input.len() < MARKER_SIZE {
        return Err(EnvelopeError::Codec("Data too short for a marker".into()));
    }
    let (marker, rest) = input.split_at(MARKER_SIZE);
    *input = rest;
    Ok(u16::from_be_bytes([marker[0], marker[1]]))
}

fn read_length(input: &mut &[u8]) -> Result<usize> {
    if input.len() < LENGTH_SIZE {
        return Err(EnvelopeError::Codec("Data too short for a length".into()));
    }
    let (len, rest) = input.split_at(LENGTH_SIZE);
    *input = rest;
    let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]);
    usize::try_from(len).map_err(|_| EnvelopeError::Codec(format!("Negative length {}", len)))
}
