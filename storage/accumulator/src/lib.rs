// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Merkle root computation over a list of leaf hashes, used for a
//! block's `tx_merkle_root` (hashes of its transactions) and
//! `state_merkle_root` (§3 "Block", §8 "Merkle root").
//!
//! The empty accumulator's root is the zero hash. An odd level is
//! completed by duplicating its last node, the common
//! Merkle-tree-with-an-odd-leaf-count convention.

use chain_crypto::HashValue;

const LEAF_DOMAIN_TAG: &[u8] = b"chain-core::accumulator::leaf";
const NODE_DOMAIN_TAG: &[u8] = b"chain-core::accumulator::node";

/// Hashes a leaf value into the accumulator's domain, distinguishing a
/// leaf hash from an internal-node hash so an attacker cannot pass an
/// internal node off as a leaf (classic second-preimage defense).
fn hash_leaf(leaf: &HashValue) -> HashValue {
    let mut bytes = Vec::with_capacity(LEAF_DOMAIN_TAG.len() + 32);
    bytes.extend_from_slice(LEAF_DOMAIN_TAG);
    bytes.extend_from_slice(leaf.as_bytes());
    HashValue::sha3_256_of(&bytes)
}

fn hash_node(left: &HashValue, right: &HashValue) -> HashValue {
    let mut bytes = Vec::with_capacity(NODE_DOMAIN_TAG.len() + 64);
    bytes.extend_from_slice(NODE_DOMAIN_TAG);
    bytes.extend_from_slice(left.as_bytes());
    bytes.extend_from_slice(right.as_bytes());
    HashValue::sha3_256_of(&bytes)
}

/// Computes the Merkle root over `leaves` in order. Returns
/// [`HashValue::zero`] for an empty leaf set.
pub fn compute_root(leaves: &[HashValue]) -> HashValue {
    if leaves.is_empty() {
        return HashValue::zero();
    }
    let mut level: Vec<HashValue> = leaves.iter().map(hash_leaf).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks_exact(2)
            .map(|pair| hash_node(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(compute_root(&[]), HashValue::zero());
    }

    #[test]
    fn single_leaf_root_is_domain_separated_leaf_hash() {
        let leaf = HashValue::sha3_256_of(b"tx");
        assert_eq!(compute_root(&[leaf]), hash_leaf(&leaf));
    }

    #[test]
    fn root_is_order_sensitive() {
        let a = HashValue::sha3_256_of(b"a");
        let b = HashValue::sha3_256_of(b"b");
        assert_ne!(compute_root(&[a, b]), compute_root(&[b, a]));
    }

    #[test]
    fn odd_leaf_count_duplicates_last_leaf() {
        let a = HashValue::sha3_256_of(b"a");
        let b = HashValue::sha3_256_of(b"b");
        let c = HashValue::sha3_256_of(b"c");
        assert_eq!(compute_root(&[a, b, c]), compute_root(&[a, b, c, c]));
    }

    #[test]
    fn root_is_deterministic() {
        let leaves: Vec<HashValue> = (0..7u8).map(|i| HashValue::sha3_256_of(&[i])).collect();
        assert_eq!(compute_root(&leaves), compute_root(&leaves));
    }
}
