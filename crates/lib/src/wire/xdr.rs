//! Minimal External Data Representation primitives.
//!
//! Unsigned integers are 4 bytes big-endian. A string is its byte length as
//! an unsigned integer followed by the bytes, zero-padded to a multiple of
//! four. A list is its element count followed by the elements.

use super::{MAX_LIST_LEN, MAX_STRING_LEN, WireError};

/// Round `len` up to the next multiple of four.
fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pack_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn pack_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.pack_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + padded(bytes.len()) - bytes.len(), 0);
    }

    pub fn pack_list<T>(&mut self, items: &[T], mut pack_item: impl FnMut(&mut Self, &T)) {
        self.pack_u32(items.len() as u32);
        for item in items {
            pack_item(self, item);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based decoder over a borrowed buffer.
///
/// Every read checks that the bytes are present first and reports
/// [`WireError::Incomplete`] otherwise, leaving the position untouched.
#[derive(Debug)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < len {
            return Err(WireError::Incomplete {
                needed: len - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn unpack_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn unpack_string(&mut self) -> Result<String, WireError> {
        let start = self.pos;
        let len = self.unpack_u32()?;
        if len > MAX_STRING_LEN {
            return Err(WireError::Oversized {
                what: "string",
                len,
                limit: MAX_STRING_LEN,
            });
        }
        let body = match self.take(padded(len as usize)) {
            Ok(body) => body,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        String::from_utf8(body[..len as usize].to_vec())
            .map_err(|source| WireError::InvalidUtf8 { source })
    }

    pub fn unpack_list<T>(
        &mut self,
        mut unpack_item: impl FnMut(&mut Self) -> Result<T, WireError>,
    ) -> Result<Vec<T>, WireError> {
        let count = self.unpack_u32()?;
        if count > MAX_LIST_LEN {
            return Err(WireError::Oversized {
                what: "list",
                len: count,
                limit: MAX_LIST_LEN,
            });
        }
        let mut items = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            items.push(unpack_item(self)?);
        }
        Ok(items)
    }
}
