// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::transaction::Transaction;
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::Result;
use serde::{Deserialize, Serialize};

/// `(version, height, previous_block_hash, tx_merkle_root,
/// state_merkle_root, timestamp_seconds, signature_script,
/// output_script)` (§3 "Block", §6 "Block binary format").
///
/// `output_script` of block N declares the predicate block N+1's
/// `signature_script` must satisfy; `signature_script` of block N
/// satisfies block N-1's predicate.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    pub previous_block_hash: HashValue,
    pub tx_merkle_root: HashValue,
    pub state_merkle_root: HashValue,
    pub timestamp_seconds: u64,
    pub signature_script: Vec<u8>,
    pub output_script: Vec<u8>,
}

impl BlockHeader {
    fn write_raw(&self, w: &mut Writer, for_sig: bool) {
        w.write_u32(self.version);
        w.write_u64(self.height);
        w.write_fixed(self.previous_block_hash.as_bytes());
        w.write_fixed(self.tx_merkle_root.as_bytes());
        w.write_fixed(self.state_merkle_root.as_bytes());
        w.write_u64(self.timestamp_seconds);
        if for_sig {
            w.write_bytes(&[]);
        } else {
            w.write_bytes(&self.signature_script);
        }
        w.write_bytes(&self.output_script);
    }

    /// The block's identity hash, used as the next block's
    /// `previous_block_hash` and as the leaf key in `GetBlock`.
    pub fn hash(&self) -> HashValue {
        let mut w = Writer::new();
        self.write_raw(&mut w, false);
        HashValue::sha3_256_of(w.as_bytes())
    }

    /// The message the previous block's `output_script` predicate must
    /// accept, with this header's own `signature_script` blanked out so
    /// the signature does not sign itself (§6).
    pub fn hash_for_sig(&self) -> HashValue {
        let mut w = Writer::new();
        self.write_raw(&mut w, true);
        HashValue::sha3_256_of(w.as_bytes())
    }
}

impl CanonicalSerialize for BlockHeader {
    fn write_canonical(&self, w: &mut Writer) {
        self.write_raw(w, false);
    }
}

impl CanonicalDeserialize for BlockHeader {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.read_u32()?;
        let height = r.read_u64()?;
        let previous_block_hash = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let tx_merkle_root = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let state_merkle_root = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let timestamp_seconds = r.read_u64()?;
        let signature_script = r.read_bytes()?;
        let output_script = r.read_bytes()?;
        Ok(BlockHeader {
            version,
            height,
            previous_block_hash,
            tx_merkle_root,
            state_merkle_root,
            timestamp_seconds,
            signature_script,
            output_script,
        })
    }
}

/// `(header, transactions[])` (§3 "Block").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block { header, transactions }
    }

    pub fn hash(&self) -> HashValue {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }
}

impl CanonicalSerialize for Block {
    fn write_canonical(&self, w: &mut Writer) {
        self.header.write_canonical(w);
        w.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_canonical(w);
        }
    }
}

impl CanonicalDeserialize for Block {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::read_canonical(r)?;
        let n_txs = r.read_varint()?;
        let mut transactions = Vec::with_capacity(n_txs as usize);
        for _ in 0..n_txs {
            transactions.push(Transaction::read_canonical(r)?);
        }
        Ok(Block { header, transactions })
    }
}

use std::convert::TryFrom;
