// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Script byte encoding. A script is a flat byte string; most bytes are
//! either a length-prefixed data push or a single-byte fixed opcode.
//! Bytes at or above [`RESERVED_BASE`] decode to [`Opcode::Reserved`],
//! which always fails on [`crate::CURRENT_VERSION`] (§9).

use chain_crypto::HashValue;
use chain_failure_ext::{ChainErrorKind, Result};
use std::convert::TryFrom;

/// One decoded script instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// Push an arbitrary byte string (length-prefixed in the encoding).
    Push(Vec<u8>),
    /// Push a small integer directly, with no length prefix.
    PushSmallInt(i64),
    Dup,
    Drop,
    Depth,
    /// Move the element `n` deep to the top.
    Roll(u8),
    /// Move the top element to depth `n`.
    Bury(u8),
    /// Reverse the top `n` elements in place.
    Reverse(u8),
    Add,
    Sub,
    Mul,
    Equal,
    GreaterThan,
    Sha256,
    Sha3256,
    CheckSig,
    CheckMultisig { required: u8, total: u8 },
    PayToContract { contract_hash: HashValue },
    /// Any opcode byte reserved for a future chain version.
    Reserved(u8),
}

const OP_PUSH_SMALL_INT_BASE: u8 = 0x00; // 0x00..=0x10 encode -... wait, see push_small_int below
const OP_DUP: u8 = 0x20;
const OP_DROP: u8 = 0x21;
const OP_DEPTH: u8 = 0x22;
const OP_ROLL: u8 = 0x23;
const OP_BURY: u8 = 0x24;
const OP_REVERSE: u8 = 0x25;
const OP_ADD: u8 = 0x30;
const OP_SUB: u8 = 0x31;
const OP_MUL: u8 = 0x32;
const OP_EQUAL: u8 = 0x33;
const OP_GREATER_THAN: u8 = 0x34;
const OP_SHA256: u8 = 0x40;
const OP_SHA3_256: u8 = 0x41;
const OP_CHECKSIG: u8 = 0x50;
const OP_CHECKMULTISIG: u8 = 0x51;
const OP_PAY_TO_CONTRACT: u8 = 0x60;
const OP_PUSH_DATA: u8 = 0x70;

/// Every byte at or above this value is reserved for future-version
/// opcodes and unconditionally fails under [`crate::CURRENT_VERSION`].
pub const RESERVED_BASE: u8 = 0x80;

/// Decodes one instruction starting at `script[pc]`, returning it along
/// with the number of bytes consumed.
pub fn decode(script: &[u8], pc: usize) -> Result<(Opcode, usize)> {
    let tag = script[pc];
    match tag {
        OP_PUSH_SMALL_INT_BASE..=0x1f => {
            // 0x01..=0x1f encode the small integers 1..=31; 0x00 encodes 0.
            Ok((Opcode::PushSmallInt(tag as i64), 1))
        }
        OP_DUP => Ok((Opcode::Dup, 1)),
        OP_DROP => Ok((Opcode::Drop, 1)),
        OP_DEPTH => Ok((Opcode::Depth, 1)),
        OP_ROLL => {
            let n = read_u8(script, pc + 1)?;
            Ok((Opcode::Roll(n), 2))
        }
        OP_BURY => {
            let n = read_u8(script, pc + 1)?;
            Ok((Opcode::Bury(n), 2))
        }
        OP_REVERSE => {
            let n = read_u8(script, pc + 1)?;
            Ok((Opcode::Reverse(n), 2))
        }
        OP_ADD => Ok((Opcode::Add, 1)),
        OP_SUB => Ok((Opcode::Sub, 1)),
        OP_MUL => Ok((Opcode::Mul, 1)),
        OP_EQUAL => Ok((Opcode::Equal, 1)),
        OP_GREATER_THAN => Ok((Opcode::GreaterThan, 1)),
        OP_SHA256 => Ok((Opcode::Sha256, 1)),
        OP_SHA3_256 => Ok((Opcode::Sha3256, 1)),
        OP_CHECKSIG => Ok((Opcode::CheckSig, 1)),
        OP_CHECKMULTISIG => {
            let required = read_u8(script, pc + 1)?;
            let total = read_u8(script, pc + 2)?;
            Ok((Opcode::CheckMultisig { required, total }, 3))
        }
        OP_PAY_TO_CONTRACT => {
            if pc + 33 > script.len() {
                return Err(ChainErrorKind::validation("truncated OP_PAY_TO_CONTRACT"));
            }
            let hash = HashValue::try_from(&script[pc + 1..pc + 33])?;
            Ok((Opcode::PayToContract { contract_hash: hash }, 33))
        }
        OP_PUSH_DATA => {
            let len = read_u8(script, pc + 1)? as usize;
            if pc + 2 + len > script.len() {
                return Err(ChainErrorKind::validation("truncated data push"));
            }
            let bytes = script[pc + 2..pc + 2 + len].to_vec();
            Ok((Opcode::Push(bytes), 2 + len))
        }
        other if other >= RESERVED_BASE => Ok((Opcode::Reserved(other), 1)),
        other => Err(ChainErrorKind::validation(format!(
            "unrecognized opcode byte 0x{:02x}",
            other
        ))),
    }
}

fn read_u8(script: &[u8], pos: usize) -> Result<u8> {
    script
        .get(pos)
        .copied()
        .ok_or_else(|| ChainErrorKind::validation("truncated script: missing opcode operand"))
}

/// Builds a script byte string instruction by instruction. Used by
/// callers assembling redeem/control scripts (signing templates, tests)
/// without hand-encoding opcode bytes.
#[derive(Default)]
pub struct ScriptBuilder {
    bytes: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        ScriptBuilder::default()
    }

    pub fn push(&mut self, data: Vec<u8>) -> &mut Self {
        assert!(data.len() <= 255, "script data push exceeds 255 bytes");
        self.bytes.push(OP_PUSH_DATA);
        self.bytes.push(data.len() as u8);
        self.bytes.extend_from_slice(&data);
        self
    }

    pub fn push_small_int(&mut self, v: i64) -> &mut Self {
        assert!((0..=31).contains(&v), "small int push out of range");
        self.bytes.push(v as u8);
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        match op {
            Opcode::Dup => self.bytes.push(OP_DUP),
            Opcode::Drop => self.bytes.push(OP_DROP),
            Opcode::Depth => self.bytes.push(OP_DEPTH),
            Opcode::Roll(n) => {
                self.bytes.push(OP_ROLL);
                self.bytes.push(n);
            }
            Opcode::Bury(n) => {
                self.bytes.push(OP_BURY);
                self.bytes.push(n);
            }
            Opcode::Reverse(n) => {
                self.bytes.push(OP_REVERSE);
                self.bytes.push(n);
            }
            Opcode::Add => self.bytes.push(OP_ADD),
            Opcode::Sub => self.bytes.push(OP_SUB),
            Opcode::Mul => self.bytes.push(OP_MUL),
            Opcode::Equal => self.bytes.push(OP_EQUAL),
            Opcode::GreaterThan => self.bytes.push(OP_GREATER_THAN),
            Opcode::Sha256 => self.bytes.push(OP_SHA256),
            Opcode::Sha3256 => self.bytes.push(OP_SHA3_256),
            Opcode::CheckSig => self.bytes.push(OP_CHECKSIG),
            Opcode::CheckMultisig { required, total } => {
                self.bytes.push(OP_CHECKMULTISIG);
                self.bytes.push(required);
                self.bytes.push(total);
            }
            Opcode::PayToContract { contract_hash } => {
                self.bytes.push(OP_PAY_TO_CONTRACT);
                self.bytes.extend_from_slice(contract_hash.as_bytes());
            }
            Opcode::Push(data) => return self.push(data),
            Opcode::PushSmallInt(v) => return self.push_small_int(v),
            Opcode::Reserved(code) => self.bytes.push(code),
        }
        self
    }

    pub fn into_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_round_trips_through_decode() {
        let script = ScriptBuilder::new().push(b"hello".to_vec()).into_bytes();
        let (op, consumed) = decode(&script, 0).unwrap();
        assert_eq!(op, Opcode::Push(b"hello".to_vec()));
        assert_eq!(consumed, script.len());
    }

    #[test]
    fn small_int_zero_is_distinct_byte_from_one() {
        let script = ScriptBuilder::new().push_small_int(0).into_bytes();
        assert_eq!(decode(&script, 0).unwrap().0, Opcode::PushSmallInt(0));
    }

    #[test]
    fn reserved_byte_decodes_but_is_flagged() {
        let (op, consumed) = decode(&[RESERVED_BASE], 0).unwrap();
        assert_eq!(op, Opcode::Reserved(RESERVED_BASE));
        assert_eq!(consumed, 1);
    }
}
