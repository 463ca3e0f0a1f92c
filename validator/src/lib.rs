// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a transaction or a block is acceptable given a View,
//! and computes the state deltas an accepted one produces (§4.4
//! "Validator").

use chain_crypto::HashValue;
use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use chain_script_vm::{self, RunLimit, DEFAULT_RUN_LIMIT};
use chain_types::{AssetDefinitionPointer, Block, OutputState, OutputWithState, Transaction};
use chain_view::{OutputDelta, View, ViewReader};
use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("validator");
}

/// The accumulated effect of applying one or more transactions: output
/// deltas (ready for `Store::apply_block`) plus any asset-definition
/// pointer updates issuance inputs produced (§4.4 "Apply").
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub output_deltas: Vec<OutputDelta>,
    pub adps: Vec<AssetDefinitionPointer>,
}

impl ApplyResult {
    fn merge(&mut self, other: ApplyResult) {
        self.output_deltas.extend(other.output_deltas);
        self.adps.extend(other.adps);
    }
}

/// Validates a single transaction against `view` (§4.4 `ValidateTx`):
/// well-formedness, locktime, and (for non-issuance transactions)
/// prevout resolution, per-asset balance, and script execution.
/// `genesis_hash` seeds the asset ID derivation for issuance inputs but
/// is not needed on this path; it is threaded through so callers always
/// validate and apply with the same genesis context.
pub fn validate_tx(view: &dyn ViewReader, tx: &Transaction, now: u64) -> Result<()> {
    validate_tx_with_limit(view, tx, now, RunLimit::new(DEFAULT_RUN_LIMIT))
}

pub fn validate_tx_with_limit(
    view: &dyn ViewReader,
    tx: &Transaction,
    now: u64,
    run_limit: RunLimit,
) -> Result<()> {
    tx.check_well_formed_shape()?;

    if tx.locktime > now {
        return Err(ChainErrorKind::validation(format!(
            "transaction locktime {} exceeds current time {}",
            tx.locktime, now
        )));
    }

    if tx.is_issuance() {
        OP_COUNTERS.inc("validate_tx", &["issuance", "ok"]);
        return Ok(());
    }

    let mut balances: HashMap<chain_types::AssetId, i128> = HashMap::new();
    for input in &tx.inputs {
        let prevout = view
            .output(&input.previous)?
            .ok_or_else(|| ChainErrorKind::validation(format!("unknown prevout {}", input.previous)))?;
        if prevout.is_spent() {
            return Err(ChainErrorKind::validation(format!(
                "prevout {} is already spent",
                input.previous
            )));
        }
        *balances.entry(prevout.output.asset_id).or_insert(0) += i128::from(prevout.output.amount);

        chain_script_vm::evaluate(
            &input.signature_script,
            &prevout.output.control_script,
            tx.hash(),
            run_limit,
        )
        .map_err(|e| {
            ChainErrorKind::validation(format!("input spending {} failed script: {}", input.previous, e))
        })?;
    }
    for output in &tx.outputs {
        *balances.entry(output.asset_id).or_insert(0) -= i128::from(output.amount);
    }
    if let Some((asset_id, _)) = balances.iter().find(|(_, delta)| **delta != 0) {
        OP_COUNTERS.inc("validate_tx", &["non_issuance", "imbalanced"]);
        return Err(ChainErrorKind::validation(format!(
            "per-asset conservation violated for asset {}",
            asset_id
        )));
    }

    OP_COUNTERS.inc("validate_tx", &["non_issuance", "ok"]);
    Ok(())
}

/// Applies an already-validated transaction into `view`: marks spent
/// prevouts, inserts new outputs, and derives an ADP update for issuance
/// inputs that carry an asset definition (§4.4 "Apply", `ApplyTx`).
/// `confirmed` selects the [`OutputState`] newly-created outputs are
/// recorded under: `true` for outputs becoming part of the confirmed
/// chain (block apply), `false` for outputs only entering the pending
/// pool (`AddTx`).
pub fn apply_tx(
    view: &mut dyn View,
    tx: &Transaction,
    genesis_hash: HashValue,
    confirmed: bool,
) -> Result<ApplyResult> {
    let mut result = ApplyResult::default();
    let tx_hash = tx.hash();

    if tx.is_issuance() {
        let input = &tx.inputs[0];
        if let Some(definition) = &input.asset_definition {
            let asset_id = derive_asset_id(&input.signature_script, genesis_hash);
            let adp = AssetDefinitionPointer::new(asset_id, HashValue::sha3_256_of(definition));
            view.save_asset_definition_pointer(adp);
            result.adps.push(adp);
        }
    } else {
        for input in &tx.inputs {
            let prevout = view
                .output(&input.previous)?
                .ok_or_else(|| ChainErrorKind::internal(format!("apply_tx: missing prevout {}", input.previous)))?;
            view.save_output(OutputWithState::new(
                input.previous,
                prevout.output,
                OutputState::ConfirmedSpent,
            ));
            result.output_deltas.push(OutputDelta::Spend(input.previous));
        }
    }

    let state = if confirmed {
        OutputState::ConfirmedUnspent
    } else {
        OutputState::Pending
    };
    for (index, output) in tx.outputs.iter().enumerate() {
        let outpoint = chain_types::Outpoint::new(tx_hash, index as u32);
        view.save_output(OutputWithState::new(outpoint, output.clone(), state));
        if confirmed {
            result.output_deltas.push(OutputDelta::Insert(outpoint, output.clone()));
        }
    }

    Ok(result)
}

/// Derives an issuance's asset ID from its issuance predicate script
/// (carried in the sole input's `signature_script`) and the genesis
/// block hash (§3 "Asset ID").
pub fn derive_asset_id(issuance_predicate_script: &[u8], genesis_hash: HashValue) -> chain_types::AssetId {
    let mut preimage = issuance_predicate_script.to_vec();
    preimage.extend_from_slice(genesis_hash.as_bytes());
    HashValue::sha3_256_of(&preimage)
}

/// Header-chaining and structural checks shared by both the pre-signing
/// and full validation paths (§4.4 "Block validation", steps 1-2).
fn validate_header_and_merkle_root(block: &Block, prev: &Block) -> Result<()> {
    if block.header.height != prev.header.height + 1 {
        return Err(ChainErrorKind::validation(format!(
            "block height {} does not follow {}",
            block.header.height, prev.header.height
        )));
    }
    if block.header.previous_block_hash != prev.hash() {
        return Err(ChainErrorKind::validation(
            "block's previous_block_hash does not match the actual predecessor",
        ));
    }
    if block.header.timestamp_seconds < prev.header.timestamp_seconds {
        return Err(ChainErrorKind::validation(
            "block timestamp precedes its predecessor",
        ));
    }
    let leaves: Vec<HashValue> = block.transactions.iter().map(Transaction::hash).collect();
    let expected_root = chain_accumulator::compute_root(&leaves);
    if block.header.tx_merkle_root != expected_root {
        return Err(ChainErrorKind::validation("tx_merkle_root does not match block transactions"));
    }
    Ok(())
}

/// Validates a candidate block well enough to be signed: header
/// chaining, Merkle root, and per-transaction validation against a
/// block-local view layered over `base_view` (§4.4 "Block validation",
/// steps 1-3). Does not check the block signature itself (§4.4 step 4).
pub fn validate_block_for_sig(
    base_view: &dyn ViewReader,
    block: &Block,
    prev: &Block,
    now: u64,
    genesis_hash: HashValue,
) -> Result<ApplyResult> {
    validate_header_and_merkle_root(block, prev)?;

    let mut overlay = chain_view::Compose::new(vec![base_view]);
    let mut result = ApplyResult::default();
    for tx in &block.transactions {
        validate_tx(&overlay, tx, now)?;
        let delta = apply_tx(&mut overlay, tx, genesis_hash, true)?;
        result.merge(delta);
    }
    Ok(result)
}

/// Validates the previous block's `output_script` against the
/// candidate's `signature_script` (§4.4 step 4, "Block signature").
pub fn validate_block_signature(block: &Block, prev: &Block, run_limit: RunLimit) -> Result<()> {
    chain_script_vm::evaluate(
        &block.header.signature_script,
        &prev.header.output_script,
        block.header.hash_for_sig(),
        run_limit,
    )
    .map_err(|e| ChainErrorKind::validation(format!("block signature rejected: {}", e)))
}

/// Full block validation and apply (§4.4 `ValidateAndApplyBlock`):
/// everything `validate_block_for_sig` checks, plus the block signature,
/// unless `trusted` is set — the "trusted apply" optimization that
/// skips per-input script re-execution (but never header chaining, the
/// Merkle root, or the balance check) for blocks signed by a known
/// federation key.
pub fn validate_and_apply_block(
    base_view: &dyn ViewReader,
    block: &Block,
    prev: &Block,
    now: u64,
    genesis_hash: HashValue,
    trusted: bool,
    run_limit: RunLimit,
) -> Result<ApplyResult> {
    validate_header_and_merkle_root(block, prev)?;

    let mut overlay = chain_view::Compose::new(vec![base_view]);
    let mut result = ApplyResult::default();
    for tx in &block.transactions {
        if trusted {
            validate_tx_balance_only(&overlay, tx, now)?;
        } else {
            validate_tx(&overlay, tx, now)?;
        }
        let delta = apply_tx(&mut overlay, tx, genesis_hash, true)?;
        result.merge(delta);
    }

    if !trusted {
        validate_block_signature(block, prev, run_limit)?;
    } else {
        debug!("trusted-apply: skipping block signature re-verification"; "height" => block.header.height);
    }

    OP_COUNTERS.inc("validate_and_apply_block", &[if trusted { "trusted" } else { "full" }]);
    Ok(result)
}

/// Everything `validate_tx` checks except per-input script execution:
/// well-formedness, locktime, prevout resolution, and per-asset
/// conservation. Used on the trusted-apply path, which still enforces
/// the balance check (§4.4 "trusted apply... never... the balance
/// check").
fn validate_tx_balance_only(view: &dyn ViewReader, tx: &Transaction, now: u64) -> Result<()> {
    tx.check_well_formed_shape()?;
    if tx.locktime > now {
        return Err(ChainErrorKind::validation("transaction locktime exceeds current time"));
    }
    if tx.is_issuance() {
        return Ok(());
    }
    let mut balances: HashMap<chain_types::AssetId, i128> = HashMap::new();
    for input in &tx.inputs {
        let prevout = view
            .output(&input.previous)?
            .ok_or_else(|| ChainErrorKind::validation(format!("unknown prevout {}", input.previous)))?;
        if prevout.is_spent() {
            return Err(ChainErrorKind::validation(format!("prevout {} is already spent", input.previous)));
        }
        *balances.entry(prevout.output.asset_id).or_insert(0) += i128::from(prevout.output.amount);
    }
    for output in &tx.outputs {
        *balances.entry(output.asset_id).or_insert(0) -= i128::from(output.amount);
    }
    if balances.values().any(|delta| *delta != 0) {
        return Err(ChainErrorKind::validation("per-asset conservation violated"));
    }
    Ok(())
}

/// Whether a pool transaction whose inputs referenced `view` remains
/// spendable: every input's prevout must resolve and be unspent. Used by
/// the block generator's pool-reconciliation pass (§4.7 step 3, §8
/// "Pool coherence").
pub fn still_valid_against(view: &dyn ViewReader, tx: &Transaction, now: u64) -> bool {
    validate_tx(view, tx, now).is_ok()
}
