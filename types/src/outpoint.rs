// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::Result;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Sentinel `previous.index` marking an issuance input, which spends no
/// prior output (§3 "Outpoint").
pub const ISSUANCE_INDEX: u32 = 0xffff_ffff;

/// `(tx_hash, index)` pair uniquely identifying one output anywhere in
/// history.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub hash: HashValue,
    pub index: u32,
}

impl Outpoint {
    pub fn new(hash: HashValue, index: u32) -> Self {
        Outpoint { hash, index }
    }

    /// The distinguished outpoint carried by an issuance transaction's
    /// single input; it spends no prior output.
    pub fn issuance(hash: HashValue) -> Self {
        Outpoint {
            hash,
            index: ISSUANCE_INDEX,
        }
    }

    pub fn is_issuance(&self) -> bool {
        self.index == ISSUANCE_INDEX
    }
}

impl fmt::Debug for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Outpoint({}:{})", self.hash, self.index)
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

impl CanonicalSerialize for Outpoint {
    fn write_canonical(&self, w: &mut Writer) {
        w.write_fixed(self.hash.as_bytes());
        w.write_u32(self.index);
    }
}

impl CanonicalDeserialize for Outpoint {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let hash_bytes = r.read_fixed(32)?;
        let hash = HashValue::try_from(hash_bytes.as_slice())?;
        let index = r.read_u32()?;
        Ok(Outpoint { hash, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuance_outpoint_is_recognized() {
        let op = Outpoint::issuance(HashValue::sha3_256_of(b"genesis"));
        assert!(op.is_issuance());
        assert!(!Outpoint::new(op.hash, 0).is_issuance());
    }

    #[test]
    fn canonical_round_trips() {
        let op = Outpoint::new(HashValue::sha3_256_of(b"tx"), 3);
        let bytes = op.to_canonical_bytes();
        let back = Outpoint::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(op, back);
    }
}
