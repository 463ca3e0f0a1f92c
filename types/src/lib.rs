// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The core data model (§3): hashes, outpoints, outputs, transactions,
//! blocks, asset-definition pointers, reservations, and the
//! multi-party signing template. Every other component crate builds on
//! these types; none of them talk to storage or the network directly.

pub mod asset;
pub mod block;
pub mod outpoint;
pub mod output;
pub mod reservation;
pub mod template;
pub mod transaction;

pub use asset::AssetDefinitionPointer;
pub use block::{Block, BlockHeader};
pub use outpoint::{Outpoint, ISSUANCE_INDEX};
pub use output::{AssetId, Output, OutputState, OutputWithState};
pub use reservation::{Reservation, DEFAULT_PERSISTENCE_THRESHOLD};
pub use template::{InputSigningState, OutputReceiver, TransactionTemplate};
pub use transaction::{Input, Transaction};

pub use chain_crypto::HashValue;

#[cfg(any(test, feature = "fuzzing"))]
pub mod proptest_types;
