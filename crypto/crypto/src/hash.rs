// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! 32-byte hashes, used throughout §3 for block hashes, transaction
//! hashes, and asset IDs.

use chain_failure_ext::{ChainErrorKind, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as Sha2Digest;
use sha3::Digest as Sha3Digest;
use std::convert::TryFrom;
use std::fmt;

pub const HASH_LENGTH: usize = 32;

/// A placeholder hash used as the "previous hash" of the genesis block
/// and as the seed for empty Merkle accumulators.
pub const ZERO_HASH: HashValue = HashValue([0u8; HASH_LENGTH]);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct HashValue([u8; HASH_LENGTH]);

impl HashValue {
    pub fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        HashValue(bytes)
    }

    pub fn zero() -> Self {
        ZERO_HASH
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ChainErrorKind::bad_request(format!("invalid hex hash: {}", e)))?;
        Self::try_from(bytes.as_slice())
    }

    /// SHA3-256, used for transaction/block field pruning hashes (§6) and
    /// general-purpose content hashing.
    pub fn sha3_256_of(data: &[u8]) -> Self {
        let mut hasher = sha3::Sha3_256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest);
        HashValue(bytes)
    }

    /// SHA-256, exposed to the script VM's `OP_SHA256`.
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(&digest);
        HashValue(bytes)
    }
}

impl TryFrom<&[u8]> for HashValue {
    type Error = chain_failure_ext::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH_LENGTH {
            return Err(ChainErrorKind::bad_request(format!(
                "hash must be {} bytes, got {}",
                HASH_LENGTH,
                bytes.len()
            )));
        }
        let mut out = [0u8; HASH_LENGTH];
        out.copy_from_slice(bytes);
        Ok(HashValue(out))
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({})", self.to_hex())
    }
}

#[cfg(feature = "fuzzing")]
impl proptest::arbitrary::Arbitrary for HashValue {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        use proptest::prelude::*;
        proptest::collection::vec(any::<u8>(), HASH_LENGTH)
            .prop_map(|bytes| {
                let mut out = [0u8; HASH_LENGTH];
                out.copy_from_slice(&bytes);
                HashValue(out)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_is_deterministic() {
        assert_eq!(
            HashValue::sha3_256_of(b"chain"),
            HashValue::sha3_256_of(b"chain")
        );
        assert_ne!(HashValue::sha3_256_of(b"chain"), HashValue::sha3_256_of(b"core"));
    }

    #[test]
    fn hex_round_trips() {
        let h = HashValue::sha3_256_of(b"round trip");
        let hex = h.to_hex();
        assert_eq!(HashValue::from_hex(&hex).unwrap(), h);
    }
}
