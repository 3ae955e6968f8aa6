#![forbid(unsafe_code)]
//! Big-endian byte channels used by the command codec and the command log.

use crate::types::{Result, SombraError};

/// Append-only big-endian writer.
#[derive(Default, Debug, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian i64.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends `1` or `0`.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Writes `len` as a u32 length or count prefix. Lengths that do not
    /// fit are rejected before anything is written.
    pub fn put_len(&mut self, len: usize, what: &str) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| {
            SombraError::InvalidOwned(format!("{what} length {len} exceeds {}", u32::MAX))
        })?;
        self.put_u32(len);
        Ok(())
    }

    /// Writes a u32 length prefix followed by the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_len(bytes.len(), "byte string")?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the written bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian reader over a borrowed slice.
///
/// Every getter fails with [`SombraError::Truncated`] when the slice ends
/// before the requested value, leaving the position unchanged.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `src`.
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    /// True when the reader has consumed every byte.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(SombraError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.src[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian u16.
    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian u32.
    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian u64.
    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Reads a big-endian i64.
    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Reads a boolean byte; anything but `0` or `1` is corruption.
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SombraError::Corruption("invalid boolean byte")),
        }
    }

    /// Reads a u32 length prefix and that many bytes.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let len = self.get_u32()? as usize;
        match self.take(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(err) => {
                self.pos = start;
                Err(err)
            }
        }
    }
}
