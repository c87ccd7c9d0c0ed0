//! # Little-Endian Wire Helpers
//!
//! Records are written field by field; we never reinterpret host memory, so
//! the output is identical on every build host.

use crate::ParseError;
use alloc::vec::Vec;

/// A fixed-size descriptor record.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the encoding of `self` (exactly [`SIZE`](Self::SIZE) bytes).
    fn encode(&self, enc: &mut Encoder<'_>);

    /// Decode one record from the decoder's current position.
    ///
    /// # Errors
    /// Fails if the input is too short or a field holds an unknown value.
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError>;
}

/// Appends little-endian fields to a byte buffer.
pub struct Encoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    #[must_use]
    pub const fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    /// Bytes written so far (including anything already in the buffer).
    #[must_use]
    pub fn position(&self) -> usize {
        self.out.len()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Encode one record, checking its size in debug builds.
    pub fn put_record<R: Record>(&mut self, record: &R) {
        let start = self.position();
        record.encode(self);
        debug_assert_eq!(self.position() - start, R::SIZE, "record size mismatch");
    }
}

/// Reads little-endian fields from a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Decoder positioned at `offset`.
    #[must_use]
    pub const fn at(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, pos: offset }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let end = self.pos.checked_add(N).ok_or(ParseError::TooShort {
            offset: self.pos,
            needed: N,
            available: self.remaining(),
        })?;
        let s = self.buf.get(self.pos..end).ok_or(ParseError::TooShort {
            offset: self.pos,
            needed: N,
            available: self.remaining(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        self.pos = end;
        Ok(out)
    }

    /// # Errors
    /// Fails if the input is exhausted.
    pub fn get_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take::<1>()?[0])
    }

    /// # Errors
    /// Fails if the input is exhausted.
    pub fn get_u16(&mut self) -> Result<u16, ParseError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// # Errors
    /// Fails if the input is exhausted.
    pub fn get_u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// # Errors
    /// Fails if the input is exhausted.
    pub fn get_u64(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    /// # Errors
    /// Fails if the input is exhausted.
    pub fn get_bytes<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        self.take()
    }

    /// Decode one record.
    ///
    /// # Errors
    /// Propagates the record's decode error.
    pub fn get_record<R: Record>(&mut self) -> Result<R, ParseError> {
        R::decode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_little_endian() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.put_u16(0x0102);
        enc.put_u32(0x0304_0506);
        enc.put_u64(0x0708_090a_0b0c_0d0e);
        assert_eq!(
            buf,
            [2, 1, 6, 5, 4, 3, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09, 0x08, 0x07]
        );

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.get_u16(), Ok(0x0102));
        assert_eq!(dec.get_u32(), Ok(0x0304_0506));
        assert_eq!(dec.get_u64(), Ok(0x0708_090a_0b0c_0d0e));
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn short_reads_report_offset() {
        let buf = [1u8, 2, 3];
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.get_u16(), Ok(0x0201));
        assert_eq!(
            dec.get_u32(),
            Err(ParseError::TooShort {
                offset: 2,
                needed: 4,
                available: 1
            })
        );
    }
}
