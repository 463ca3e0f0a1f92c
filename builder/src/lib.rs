// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Assembles a multi-party [`TransactionTemplate`] from reservations and
//! destinations, merges partial templates, and finalizes signatures into
//! a spendable [`Transaction`] (§4.6 "Builder").
//!
//! The Builder is polymorphic over two capability sets rather than
//! hard-wired to a concrete allocator: a [`ReservationSource`] (given a
//! request and a TTL, yields reservation items and an optional change
//! record) and a [`ChangeReceiver`] (given an asset and amount, yields a
//! control script and metadata for the change output). Account-based,
//! order-book, or voting-token reservers all plug in by implementing
//! [`ReservationSource`]; the Builder never inspects the concrete
//! allocator (§9 "Polymorphism over receivers and reservers").

use chain_failure_ext::{ChainErrorKind, Result};
use chain_script_vm::opcode::ScriptBuilder;
use chain_types::{
    AssetId, HashValue, Input, InputSigningState, Outpoint, Output, OutputReceiver, Transaction,
    TransactionTemplate,
};
use std::time::Duration;

/// One party's request for inputs of a given asset (§3 "Source" /
/// §4.5/§4.6's `inputs[]`). `redeem_script` and `required_signatures`
/// describe how the eventual signature script must be assembled for
/// every output this request reserves.
#[derive(Clone, Debug)]
pub struct Source {
    pub account_id: String,
    pub asset_id: AssetId,
    pub amount: u64,
    pub tx_hash_constraint: Option<HashValue>,
    pub client_token: Option<String>,
    pub redeem_script: Vec<u8>,
    pub required_signatures: usize,
}

/// One requested output of the assembled transaction (§3
/// "destinations[]").
#[derive(Clone, Debug)]
pub struct Destination {
    pub asset_id: AssetId,
    pub amount: u64,
    pub control_script: Vec<u8>,
    pub metadata: Vec<u8>,
    pub receiver_account_id: String,
}

/// What a [`ReservationSource`] hands back for one [`Source`]: the
/// outputs it reserved, plus any leftover value routed back to the same
/// account/asset as change.
pub struct ReservationOutcome {
    pub reserved: Vec<(Outpoint, Output)>,
    pub change: Option<(String, AssetId, u64)>,
}

/// Abstracts over a reservation allocator (§9 "a Reserver: given a
/// request and TTL, yield reservation items and an optional change
/// destination"). [`chain_reserver::Reserver`] implements this for any
/// `CandidateSource` via the blanket impl below.
pub trait ReservationSource {
    fn reserve(&self, source: &Source, ttl: Duration, now: u64) -> Result<ReservationOutcome>;
    fn cancel(&self, outpoints: &[Outpoint]);
}

impl<S: chain_reserver::CandidateSource> ReservationSource for chain_reserver::Reserver<S> {
    fn reserve(&self, source: &Source, ttl: Duration, now: u64) -> Result<ReservationOutcome> {
        let request = chain_reserver::ReserveRequest {
            account_id: source.account_id.clone(),
            asset_id: source.asset_id,
            amount: source.amount,
            tx_hash_constraint: source.tx_hash_constraint,
            client_token: source.client_token.clone(),
        };
        let outcome = chain_reserver::Reserver::reserve(self, &[request], ttl, now)?
            .into_iter()
            .next()
            .expect("reserve of a single request returns exactly one outcome");
        Ok(ReservationOutcome {
            reserved: outcome.reserved,
            change: outcome.change.map(|c| (c.account_id, c.asset_id, c.amount)),
        })
    }

    fn cancel(&self, outpoints: &[Outpoint]) {
        chain_reserver::Reserver::cancel(self, outpoints)
    }
}

/// Abstracts over "given this asset and amount, yield a control script
/// and metadata" (§9 "a Receiver"), used to materialize change outputs
/// for sources that over-reserved.
pub trait ChangeReceiver {
    fn control_script_and_metadata(&self, account_id: &str, asset_id: AssetId, amount: u64) -> (Vec<u8>, Vec<u8>);
}

/// Assembles transaction templates from [`Source`]s and
/// [`Destination`]s (§4.6 "Builder").
pub struct Builder<R: ReservationSource, C: ChangeReceiver> {
    reservation_source: R,
    change_receiver: C,
}

impl<R: ReservationSource, C: ChangeReceiver> Builder<R, C> {
    pub fn new(reservation_source: R, change_receiver: C) -> Self {
        Builder { reservation_source, change_receiver }
    }

    /// Reserves inputs for every source, appends outputs for every
    /// destination plus a change destination for every source that
    /// yielded one, merges with `previous_template` if given, and
    /// caches each input's signing hash against the assembled unsigned
    /// transaction (§4.6 `Build`).
    pub fn build(
        &self,
        previous_template: Option<TransactionTemplate>,
        sources: &[Source],
        destinations: &[Destination],
        metadata: Vec<u8>,
        locktime: u64,
        ttl: Duration,
        blockchain_id: HashValue,
        now: u64,
    ) -> Result<TransactionTemplate> {
        if let Some(prev) = &previous_template {
            if prev.blockchain_id != blockchain_id {
                return Err(ChainErrorKind::bad_request(
                    "cannot merge templates targeting different blockchains",
                ));
            }
        }

        let mut inputs = Vec::new();
        let mut signing_states = Vec::new();
        let mut outputs = Vec::new();
        let mut receivers = Vec::new();

        for dest in destinations {
            let output_index = outputs.len();
            outputs.push(Output::new(dest.asset_id, dest.amount, dest.control_script.clone(), dest.metadata.clone()));
            receivers.push(OutputReceiver {
                output_index,
                account_id: dest.receiver_account_id.clone(),
                asset_id: dest.asset_id,
                is_change: false,
            });
        }

        for source in sources {
            let outcome = self.reservation_source.reserve(source, ttl, now)?;
            for (outpoint, _) in &outcome.reserved {
                inputs.push(Input::new(*outpoint, Vec::new(), Vec::new(), None));
                signing_states.push(InputSigningState::new(
                    source.redeem_script.clone(),
                    source.required_signatures,
                    HashValue::zero(), // filled in once the unsigned tx is assembled below
                ));
            }
            if let Some((account_id, asset_id, amount)) = outcome.change {
                let (control_script, change_metadata) =
                    self.change_receiver.control_script_and_metadata(&account_id, asset_id, amount);
                let output_index = outputs.len();
                outputs.push(Output::new(asset_id, amount, control_script, change_metadata));
                receivers.push(OutputReceiver { output_index, account_id, asset_id, is_change: true });
            }
        }

        let (inputs, mut signing_states, outputs, receivers) = if let Some(prev) = previous_template {
            merge(prev, inputs, signing_states, outputs, receivers)
        } else {
            (inputs, signing_states, outputs, receivers)
        };

        let unsigned_tx = Transaction::new(1, inputs, outputs, locktime, metadata);
        let sighash = unsigned_tx.hash();
        for state in &mut signing_states {
            if state.sighash == HashValue::zero() {
                state.sighash = sighash;
            }
        }

        Ok(TransactionTemplate::new(unsigned_tx, signing_states, receivers, blockchain_id))
    }

    /// Concatenates each input's accumulated signatures (exactly
    /// `required_signatures` of them for a threshold redeem script),
    /// appends the redeem script, and writes the result as the input's
    /// signature script (§4.6 `AssembleSignatures`). Fails if any input
    /// is not yet fully signed.
    pub fn assemble_signatures(&self, template: &TransactionTemplate) -> Result<Transaction> {
        if !template.is_fully_signed() {
            return Err(ChainErrorKind::validation("template has inputs missing required signatures"));
        }
        let mut tx = template.unsigned_tx.clone();
        for (input, state) in tx.inputs.iter_mut().zip(&template.signing_states) {
            let mut script = ScriptBuilder::new();
            for sig in state.signatures.iter().flatten() {
                script.push(sig.clone());
            }
            script.push(state.redeem_script.clone());
            input.signature_script = script.into_bytes();
        }
        Ok(tx)
    }

    /// Delegates to the underlying [`ReservationSource`] (§4.6
    /// `CancelReservations`).
    pub fn cancel_reservations(&self, outpoints: &[Outpoint]) {
        self.reservation_source.cancel(outpoints);
    }
}

/// Combines a previous template's inputs/outputs/signing-states/receivers
/// with newly assembled ones. Per-input signature lists are unioned by
/// position; sighashes are never recomputed for inputs already frozen
/// into `prev` (§4.6 "Merging rule").
fn merge(
    prev: TransactionTemplate,
    new_inputs: Vec<Input>,
    new_signing_states: Vec<InputSigningState>,
    new_outputs: Vec<Output>,
    new_receivers: Vec<OutputReceiver>,
) -> (Vec<Input>, Vec<InputSigningState>, Vec<Output>, Vec<OutputReceiver>) {
    let output_offset = prev.unsigned_tx.outputs.len();

    let mut inputs = prev.unsigned_tx.inputs;
    inputs.extend(new_inputs);

    let mut signing_states = prev.signing_states;
    signing_states.extend(new_signing_states);

    let mut outputs = prev.unsigned_tx.outputs;
    outputs.extend(new_outputs);

    let mut receivers = prev.receivers;
    receivers.extend(new_receivers.into_iter().map(|mut r| {
        r.output_index += output_offset;
        r
    }));

    (inputs, signing_states, outputs, receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_reserver::{CandidateSource, Reserver};
    use chain_types::Output as TOutput;

    struct FixedSource(Vec<(Outpoint, TOutput)>);

    impl CandidateSource for FixedSource {
        fn load(&self, _account_id: &str, _asset_id: &AssetId) -> Result<Vec<(Outpoint, TOutput)>> {
            Ok(self.0.clone())
        }
    }

    struct NullReceiver;

    impl ChangeReceiver for NullReceiver {
        fn control_script_and_metadata(&self, _account_id: &str, _asset_id: AssetId, _amount: u64) -> (Vec<u8>, Vec<u8>) {
            (vec![1], vec![])
        }
    }

    fn source(amount: u64) -> Source {
        Source {
            account_id: "acct-1".to_string(),
            asset_id: HashValue::sha3_256_of(b"usd"),
            amount,
            tx_hash_constraint: None,
            client_token: None,
            redeem_script: vec![0xAB],
            required_signatures: 1,
        }
    }

    fn destination(amount: u64) -> Destination {
        Destination {
            asset_id: HashValue::sha3_256_of(b"usd"),
            amount,
            control_script: vec![0xCD],
            metadata: vec![],
            receiver_account_id: "acct-2".to_string(),
        }
    }

    #[test]
    fn build_reserves_inputs_and_adds_a_change_output() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let candidate = TOutput::new(HashValue::sha3_256_of(b"usd"), 100, vec![], vec![]);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, candidate)]));
        let builder = Builder::new(reserver, NullReceiver);

        let template = builder
            .build(
                None,
                &[source(40)],
                &[destination(40)],
                vec![],
                0,
                Duration::from_secs(60),
                HashValue::sha3_256_of(b"chain"),
                0,
            )
            .unwrap();

        assert_eq!(template.unsigned_tx.inputs.len(), 1);
        // one requested destination plus one change output for the 60 leftover
        assert_eq!(template.unsigned_tx.outputs.len(), 2);
        assert_eq!(template.signing_states.len(), 1);
        assert_ne!(template.signing_states[0].sighash, HashValue::zero());
    }

    #[test]
    fn assemble_signatures_fails_when_not_fully_signed() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let candidate = TOutput::new(HashValue::sha3_256_of(b"usd"), 100, vec![], vec![]);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, candidate)]));
        let builder = Builder::new(reserver, NullReceiver);

        let template = builder
            .build(
                None,
                &[source(40)],
                &[destination(40)],
                vec![],
                0,
                Duration::from_secs(60),
                HashValue::sha3_256_of(b"chain"),
                0,
            )
            .unwrap();

        assert!(builder.assemble_signatures(&template).is_err());
    }

    #[test]
    fn assemble_signatures_writes_sigs_then_redeem_script() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let candidate = TOutput::new(HashValue::sha3_256_of(b"usd"), 40, vec![], vec![]);
        let reserver = Reserver::new(FixedSource(vec![(outpoint, candidate)]));
        let builder = Builder::new(reserver, NullReceiver);

        let mut template = builder
            .build(
                None,
                &[source(40)],
                &[destination(40)],
                vec![],
                0,
                Duration::from_secs(60),
                HashValue::sha3_256_of(b"chain"),
                0,
            )
            .unwrap();
        template.signing_states[0].signatures[0] = Some(vec![0xEE; 64]);

        let signed = builder.assemble_signatures(&template).unwrap();
        assert!(!signed.inputs[0].signature_script.is_empty());
    }
}
