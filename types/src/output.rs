// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::outpoint::Outpoint;
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::Result;
use serde::{Deserialize, Serialize};

/// 32-byte identifier of an asset, derived from its issuance predicate
/// script plus the genesis-block hash (§3 "Asset ID").
pub type AssetId = HashValue;

/// `(asset_id, amount, control_script, metadata)` (§3 "Output").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Output {
    pub asset_id: AssetId,
    pub amount: u64,
    pub control_script: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl Output {
    pub fn new(asset_id: AssetId, amount: u64, control_script: Vec<u8>, metadata: Vec<u8>) -> Self {
        Output {
            asset_id,
            amount,
            control_script,
            metadata,
        }
    }
}

impl CanonicalSerialize for Output {
    fn write_canonical(&self, w: &mut Writer) {
        w.write_fixed(self.asset_id.as_bytes());
        w.write_u64(self.amount);
        w.write_bytes(&self.control_script);
        w.write_bytes(&self.metadata);
    }
}

impl CanonicalDeserialize for Output {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let asset_id = HashValue::try_from(r.read_fixed(32)?.as_slice())?;
        let amount = r.read_u64()?;
        let control_script = r.read_bytes()?;
        let metadata = r.read_bytes()?;
        Ok(Output {
            asset_id,
            amount,
            control_script,
            metadata,
        })
    }
}

/// The lifecycle state of an [`Output`] (§3 "Output" transitions).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum OutputState {
    Pending,
    ConfirmedUnspent,
    ConfirmedSpent,
}

/// An output paired with its outpoint and lifecycle state, the unit
/// the State Store and View pass around (§4.1, §4.2).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct OutputWithState {
    pub outpoint: Outpoint,
    pub output: Output,
    pub state: OutputState,
}

impl OutputWithState {
    pub fn new(outpoint: Outpoint, output: Output, state: OutputState) -> Self {
        OutputWithState {
            outpoint,
            output,
            state,
        }
    }

    pub fn is_spent(&self) -> bool {
        matches!(self.state, OutputState::ConfirmedSpent)
    }
}

use std::convert::TryFrom;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> Output {
        Output::new(
            HashValue::sha3_256_of(b"usd"),
            1_000,
            b"control".to_vec(),
            b"meta".to_vec(),
        )
    }

    #[test]
    fn canonical_round_trips() {
        let output = sample_output();
        let bytes = output.to_canonical_bytes();
        let back = Output::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(output, back);
    }

    #[test]
    fn confirmed_spent_reports_spent() {
        let with_state = OutputWithState::new(
            Outpoint::new(HashValue::sha3_256_of(b"tx"), 0),
            sample_output(),
            OutputState::ConfirmedSpent,
        );
        assert!(with_state.is_spent());
    }
}
