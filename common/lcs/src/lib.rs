// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical binary encoding for transactions and blocks (§6).
//!
//! The format is deliberately small and hand-written rather than derived
//! from `serde`: every field width is fixed (`u32`/`u64` little-endian,
//! ULEB128 varints for counts, length-prefixed byte strings) and the
//! encoding doubles as the hashing preimage, so there is no room for a
//! derive macro to pick a different layout than the one the network
//! agrees on.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chain_failure_ext::{format_err, ChainErrorKind, Result};
use std::io::Cursor;

/// Appends fields to a byte buffer using the canonical encoding.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.write_u32::<LittleEndian>(v).expect("Vec write is infallible");
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.write_u64::<LittleEndian>(v).expect("Vec write is infallible");
        self
    }

    /// ULEB128 varint, used for `n_inputs`/`n_outputs`/`n_txs` counts.
    pub fn write_varint(&mut self, mut v: u64) -> &mut Self {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
        self
    }

    pub fn write_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed byte string: `varint(len) || bytes`.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }
}

/// Reads fields back out of a canonically-encoded buffer.
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| ChainErrorKind::bad_request(format!("truncated u32: {}", e)))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| ChainErrorKind::bad_request(format!("truncated u64: {}", e)))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(ChainErrorKind::bad_request("varint too long"));
            }
            let byte = self
                .cursor
                .read_u8()
                .map_err(|e| ChainErrorKind::bad_request(format!("truncated varint: {}", e)))?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    pub fn read_fixed(&mut self, len: usize) -> Result<Vec<u8>> {
        let pos = self.cursor.position() as usize;
        let slice = self.cursor.get_ref();
        if pos + len > slice.len() {
            return Err(ChainErrorKind::bad_request("truncated fixed-length field"));
        }
        let out = slice[pos..pos + len].to_vec();
        self.cursor.set_position((pos + len) as u64);
        Ok(out)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        self.read_fixed(len)
    }

    pub fn expect_empty(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(format_err!(
                "{} trailing bytes after canonical decode",
                self.remaining()
            ));
        }
        Ok(())
    }
}

/// Implemented by every wire type that participates in the canonical
/// encoding (transactions, blocks, and their sub-fields).
pub trait CanonicalSerialize {
    fn write_canonical(&self, w: &mut Writer);

    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_canonical(&mut w);
        w.into_bytes()
    }
}

pub trait CanonicalDeserialize: Sized {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self>;

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let value = Self::read_canonical(&mut r)?;
        r.expect_empty()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips() {
        for v in [0u64, 1, 127, 128, 300, 16384, u64::MAX] {
            let mut w = Writer::new();
            w.write_varint(v);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_varint().unwrap(), v);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn bytes_field_round_trips() {
        let mut w = Writer::new();
        w.write_bytes(b"signature script");
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_bytes().unwrap(), b"signature script".to_vec());
    }

    #[test]
    fn truncated_input_is_a_bad_request() {
        let bytes = [0x80u8]; // continuation bit set, no following byte
        let mut r = Reader::new(&bytes);
        assert!(r.read_varint().is_err());
    }
}
