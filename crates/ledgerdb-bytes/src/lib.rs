#![forbid(unsafe_code)]
//! Small byte-string and cursor helpers shared by the serialization code
//! in `ledgerdb-objects`, `ledgerdb-btree` and `ledgerdb-pagedb`.
//!
//! None of this depends on `ledgerdb-types`: it is pure byte plumbing,
//! reusable the way the teacher's `sombra-bytes` is reused by every
//! pager-adjacent crate.

use smallvec::SmallVec;

/// A small, stack-favoring byte buffer used for keys and short-lived
/// encoded records (most B-tree keys and digests are well under 64 bytes).
pub type SmallBytes = SmallVec<[u8; 64]>;

/// Appends a LEB128-encoded unsigned varint to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Errors produced while decoding a length-prefixed or varint-prefixed record.
#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The buffer ended before the value was fully decoded.
    Truncated,
    /// A varint used more than 10 bytes (would overflow a `u64`).
    VarintTooLong,
}

/// A read cursor over a byte slice, used by every fixed-layout decoder
/// in the workspace instead of hand-rolled offset arithmetic at each
/// call site.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Wraps `buf` for sequential reading.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes remaining after the current position.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads exactly `n` bytes, advancing the cursor.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a LEB128-encoded unsigned varint, advancing the cursor.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if shift >= 70 {
                return Err(DecodeError::VarintTooLong);
            }
            let byte = *self.take(1)?.first().ok_or(DecodeError::Truncated)?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    /// Reads a varint-length-prefixed byte slice.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }
}

/// Appends `bytes` to `out`, prefixed with its length as a varint.
pub fn write_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}
