// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::output::Output;
use crate::outpoint::Outpoint;
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize, Reader, Writer};
use chain_crypto::HashValue;
use chain_failure_ext::{ChainErrorKind, Result};
use serde::{Deserialize, Serialize};

/// One spend in a [`Transaction`] (§3 "Transaction", §6 wire format).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Input {
    pub previous: Outpoint,
    pub signature_script: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Present only on issuance inputs that (re)publish an asset
    /// definition; absent otherwise.
    pub asset_definition: Option<Vec<u8>>,
}

impl Input {
    pub fn new(
        previous: Outpoint,
        signature_script: Vec<u8>,
        metadata: Vec<u8>,
        asset_definition: Option<Vec<u8>>,
    ) -> Self {
        Input {
            previous,
            signature_script,
            metadata,
            asset_definition,
        }
    }

    pub fn is_issuance(&self) -> bool {
        self.previous.is_issuance()
    }

    fn write_raw(&self, w: &mut Writer) {
        w.write_fixed(self.previous.hash.as_bytes());
        w.write_u32(self.previous.index);
        w.write_bytes(&self.signature_script);
        w.write_bytes(&self.metadata);
        w.write_bytes(self.asset_definition.as_deref().unwrap_or(&[]));
    }

    fn write_pruned(&self, w: &mut Writer) {
        w.write_fixed(self.previous.hash.as_bytes());
        w.write_u32(self.previous.index);
        w.write_bytes(HashValue::sha3_256_of(&self.signature_script).as_bytes());
        w.write_bytes(HashValue::sha3_256_of(&self.metadata).as_bytes());
        let asset_definition = self.asset_definition.as_deref().unwrap_or(&[]);
        w.write_bytes(HashValue::sha3_256_of(asset_definition).as_bytes());
    }

    fn read_raw(r: &mut Reader<'_>) -> Result<Self> {
        let previous = Outpoint::read_canonical(r)?;
        let signature_script = r.read_bytes()?;
        let metadata = r.read_bytes()?;
        let asset_definition_bytes = r.read_bytes()?;
        let asset_definition = if asset_definition_bytes.is_empty() {
            None
        } else {
            Some(asset_definition_bytes)
        };
        Ok(Input {
            previous,
            signature_script,
            metadata,
            asset_definition,
        })
    }
}

/// `(version, inputs[], outputs[], locktime, metadata)` (§3
/// "Transaction"). An issuance transaction has exactly one input whose
/// `previous.index` is the sentinel [`crate::outpoint::ISSUANCE_INDEX`].
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub locktime: u64,
    pub metadata: Vec<u8>,
}

impl Transaction {
    pub fn new(
        version: u32,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        locktime: u64,
        metadata: Vec<u8>,
    ) -> Self {
        Transaction {
            version,
            inputs,
            outputs,
            locktime,
            metadata,
        }
    }

    /// An issuance tx carries exactly one input and that input spends no
    /// prior output (§3, §4.4 well-formedness rule 1).
    pub fn is_issuance(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_issuance()
    }

    /// Validates the issuance-input shape without consulting a View;
    /// used by `ValidateTx` step 1 ("Well-formedness").
    pub fn check_well_formed_shape(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(ChainErrorKind::validation("transaction has no inputs"));
        }
        let issuance_inputs = self.inputs.iter().filter(|i| i.is_issuance()).count();
        if issuance_inputs > 0 && self.inputs.len() != 1 {
            return Err(ChainErrorKind::validation(
                "issuance transactions must have exactly one input",
            ));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input.previous) {
                return Err(ChainErrorKind::validation(
                    "transaction spends the same outpoint twice",
                ));
            }
        }
        if !self.is_issuance() {
            for output in &self.outputs {
                if output.amount == 0 {
                    return Err(ChainErrorKind::validation(
                        "zero-amount outputs are only permitted in issuance transactions",
                    ));
                }
            }
        }
        Ok(())
    }

    /// The full wire encoding used for RPC submission and storage (§6
    /// "Transaction binary format").
    fn write_raw(&self, w: &mut Writer) {
        w.write_u32(self.version);
        w.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_raw(w);
        }
        w.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_canonical(w);
        }
        w.write_u64(self.locktime);
        w.write_bytes(&self.metadata);
    }

    /// The hashing preimage: identical to [`Self::write_raw`] except that
    /// `signature_script`, every `metadata` field, and `asset_definition`
    /// are replaced by their SHA3-256 hash, so pruning signatures and
    /// large reference data never changes the transaction's identity
    /// (§3 "Transaction", §6).
    fn write_pruned(&self, w: &mut Writer) {
        w.write_u32(self.version);
        w.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_pruned(w);
        }
        w.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            w.write_fixed(output.asset_id.as_bytes());
            w.write_u64(output.amount);
            w.write_bytes(&output.control_script);
            w.write_bytes(HashValue::sha3_256_of(&output.metadata).as_bytes());
        }
        w.write_u64(self.locktime);
        w.write_bytes(HashValue::sha3_256_of(&self.metadata).as_bytes());
    }

    /// The transaction hash used as its identity everywhere: outpoints,
    /// the pool index, block Merkle leaves.
    pub fn hash(&self) -> HashValue {
        let mut w = Writer::new();
        self.write_pruned(&mut w);
        HashValue::sha3_256_of(w.as_bytes())
    }

    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_raw(&mut w);
        w.into_bytes()
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_canonical_bytes(bytes)
    }
}

impl CanonicalSerialize for Transaction {
    fn write_canonical(&self, w: &mut Writer) {
        self.write_raw(w);
    }
}

impl CanonicalDeserialize for Transaction {
    fn read_canonical(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.read_u32()?;
        let n_inputs = r.read_varint()?;
        let mut inputs = Vec::with_capacity(n_inputs as usize);
        for _ in 0..n_inputs {
            inputs.push(Input::read_raw(r)?);
        }
        let n_outputs = r.read_varint()?;
        let mut outputs = Vec::with_capacity(n_outputs as usize);
        for _ in 0..n_outputs {
            outputs.push(Output::read_canonical(r)?);
        }
        let locktime = r.read_u64()?;
        let metadata = r.read_bytes()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> Output {
        Output::new(HashValue::sha3_256_of(b"usd"), 100, b"ctrl".to_vec(), vec![])
    }

    fn sample_input() -> Input {
        Input::new(
            Outpoint::new(HashValue::sha3_256_of(b"prev-tx"), 0),
            b"sig".to_vec(),
            b"input-meta".to_vec(),
            None,
        )
    }

    #[test]
    fn wire_round_trips() {
        let tx = Transaction::new(1, vec![sample_input()], vec![sample_output()], 0, vec![]);
        let bytes = tx.to_wire_bytes();
        let back = Transaction::from_wire_bytes(&bytes).unwrap();
        assert_eq!(tx, back);
    }

    #[test]
    fn hash_is_stable_under_signature_script_pruning() {
        let mut tx = Transaction::new(1, vec![sample_input()], vec![sample_output()], 0, vec![]);
        let original_hash = tx.hash();
        tx.inputs[0].signature_script = vec![0xAB; 200];
        assert_eq!(tx.hash(), original_hash);
    }

    #[test]
    fn hash_changes_when_amount_changes() {
        let tx_a = Transaction::new(1, vec![sample_input()], vec![sample_output()], 0, vec![]);
        let mut other_output = sample_output();
        other_output.amount = 101;
        let tx_b = Transaction::new(1, vec![sample_input()], vec![other_output], 0, vec![]);
        assert_ne!(tx_a.hash(), tx_b.hash());
    }

    #[test]
    fn issuance_transaction_is_recognized() {
        let issuance_input = Input::new(
            Outpoint::issuance(HashValue::sha3_256_of(b"genesis")),
            b"sig".to_vec(),
            vec![],
            Some(b"definition".to_vec()),
        );
        let tx = Transaction::new(1, vec![issuance_input], vec![sample_output()], 0, vec![]);
        assert!(tx.is_issuance());
        assert!(tx.check_well_formed_shape().is_ok());
    }

    #[test]
    fn duplicate_outpoints_are_rejected() {
        let input = sample_input();
        let tx = Transaction::new(
            1,
            vec![input.clone(), input],
            vec![sample_output()],
            0,
            vec![],
        );
        assert!(tx.check_well_formed_shape().is_err());
    }

    #[test]
    fn zero_amount_output_rejected_outside_issuance() {
        let mut output = sample_output();
        output.amount = 0;
        let tx = Transaction::new(1, vec![sample_input()], vec![output], 0, vec![]);
        assert!(tx.check_well_formed_shape().is_err());
    }
}
