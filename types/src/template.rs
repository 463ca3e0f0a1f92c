// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::output::AssetId;
use crate::transaction::Transaction;
use chain_crypto::HashValue;
use serde::{Deserialize, Serialize};

/// Per-input signing state carried by a [`TransactionTemplate`]: the
/// redeem script, the public keys whose signatures are required, each
/// signature's current DER value (possibly still empty), and the
/// precomputed sighash the signatures are over (§3 "Transaction
/// Template").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct InputSigningState {
    pub redeem_script: Vec<u8>,
    pub required_signatures: usize,
    /// Indexed the same way the redeem script expects signatures to be
    /// supplied; `None` where a party has not yet contributed theirs.
    pub signatures: Vec<Option<Vec<u8>>>,
    pub sighash: HashValue,
}

impl InputSigningState {
    pub fn new(redeem_script: Vec<u8>, required_signatures: usize, sighash: HashValue) -> Self {
        InputSigningState {
            redeem_script,
            required_signatures,
            signatures: vec![None; required_signatures],
            sighash,
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.signatures.iter().filter(|s| s.is_some()).count() >= self.required_signatures
    }
}

/// Account/address metadata a party attaches to an output so it can
/// later recognize which outputs of the finalized transaction are its
/// own change (§3 "Transaction Template").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct OutputReceiver {
    pub output_index: usize,
    pub account_id: String,
    pub asset_id: AssetId,
    pub is_change: bool,
}

/// `(unsigned_tx, per_input_signing_state[], per_output_receiver[])`
/// (§3 "Transaction Template"); assembled by the Builder across one or
/// more parties before being finalized into a signed [`Transaction`].
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TransactionTemplate {
    pub unsigned_tx: Transaction,
    pub signing_states: Vec<InputSigningState>,
    pub receivers: Vec<OutputReceiver>,
    /// Identifies the chain this template targets; templates being
    /// merged must agree on this (§4.6 "Merging rule").
    pub blockchain_id: HashValue,
}

impl TransactionTemplate {
    pub fn new(
        unsigned_tx: Transaction,
        signing_states: Vec<InputSigningState>,
        receivers: Vec<OutputReceiver>,
        blockchain_id: HashValue,
    ) -> Self {
        TransactionTemplate {
            unsigned_tx,
            signing_states,
            receivers,
            blockchain_id,
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.signing_states.iter().all(InputSigningState::is_fully_signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_state_reports_fully_signed() {
        let mut state = InputSigningState::new(vec![1, 2, 3], 2, HashValue::sha3_256_of(b"sighash"));
        assert!(!state.is_fully_signed());
        state.signatures[0] = Some(vec![0xAA]);
        assert!(!state.is_fully_signed());
        state.signatures[1] = Some(vec![0xBB]);
        assert!(state.is_fully_signed());
    }
}
