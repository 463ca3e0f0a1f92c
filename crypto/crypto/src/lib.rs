// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hashing and signature primitives shared by every component that needs
//! to identify or authenticate chain data: transaction and block hashes,
//! asset IDs, federation block signatures, and the script VM's signature
//! opcodes.

pub mod ed25519;
pub mod hash;

pub use ed25519::{verify_multisig, PrivateKey, PublicKey, Signature};
pub use hash::{HashValue, HASH_LENGTH, ZERO_HASH};
