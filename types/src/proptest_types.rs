// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `Arbitrary` strategies for the core data types, used by the
//! property-based tests in this crate and downstream ones (§8).

use crate::asset::AssetDefinitionPointer;
use crate::block::{Block, BlockHeader};
use crate::outpoint::Outpoint;
use crate::output::Output;
use crate::transaction::{Input, Transaction};
use chain_crypto::HashValue;
use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;

prop_compose! {
    pub fn arb_outpoint()(hash in any::<HashValue>(), index in any::<u32>()) -> Outpoint {
        Outpoint::new(hash, index)
    }
}

impl Arbitrary for Outpoint {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        arb_outpoint().boxed()
    }
}

prop_compose! {
    pub fn arb_output()(
        asset_id in any::<HashValue>(),
        amount in any::<u64>(),
        control_script in vec(any::<u8>(), 0..32),
        metadata in vec(any::<u8>(), 0..16),
    ) -> Output {
        Output::new(asset_id, amount, control_script, metadata)
    }
}

impl Arbitrary for Output {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        arb_output().boxed()
    }
}

impl Input {
    /// A spending (non-issuance) input over an arbitrary previous
    /// outpoint.
    pub fn spend_strategy() -> impl Strategy<Value = Input> {
        (
            any::<Outpoint>(),
            vec(any::<u8>(), 0..32),
            vec(any::<u8>(), 0..16),
        )
            .prop_map(|(previous, signature_script, metadata)| {
                Input::new(previous, signature_script, metadata, None)
            })
    }

    /// An issuance input, whose `previous.index` is the sentinel value.
    pub fn issuance_strategy() -> impl Strategy<Value = Input> {
        (
            any::<HashValue>(),
            vec(any::<u8>(), 0..32),
            option::of(vec(any::<u8>(), 0..32)),
        )
            .prop_map(|(genesis_hash, signature_script, asset_definition)| {
                Input::new(
                    Outpoint::issuance(genesis_hash),
                    signature_script,
                    vec![],
                    asset_definition,
                )
            })
    }
}

impl Arbitrary for Input {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![2 => Self::spend_strategy(), 1 => Self::issuance_strategy()].boxed()
    }
}

impl Transaction {
    /// A well-formed non-issuance transaction: 1-4 distinct spending
    /// inputs, 1-4 outputs, none of which have a zero amount.
    pub fn spend_strategy() -> impl Strategy<Value = Transaction> {
        (
            vec(Input::spend_strategy(), 1..4),
            vec(Output::arbitrary().prop_filter("amount must be nonzero", |o| o.amount > 0), 1..4),
            any::<u64>(),
            vec(any::<u8>(), 0..16),
        )
            .prop_map(|(mut inputs, outputs, locktime, metadata)| {
                dedupe_by_outpoint(&mut inputs);
                Transaction::new(1, inputs, outputs, locktime, metadata)
            })
    }

    /// A well-formed issuance transaction: exactly one issuance input.
    pub fn issuance_strategy() -> impl Strategy<Value = Transaction> {
        (
            Input::issuance_strategy(),
            vec(any::<Output>(), 1..4),
            any::<u64>(),
            vec(any::<u8>(), 0..16),
        )
            .prop_map(|(input, outputs, locktime, metadata)| {
                Transaction::new(1, vec![input], outputs, locktime, metadata)
            })
    }
}

fn dedupe_by_outpoint(inputs: &mut Vec<Input>) {
    let mut seen = std::collections::HashSet::new();
    inputs.retain(|input| seen.insert(input.previous));
    if inputs.is_empty() {
        inputs.push(Input::new(
            Outpoint::new(HashValue::sha3_256_of(b"fallback"), 0),
            vec![],
            vec![],
            None,
        ));
    }
}

impl Arbitrary for Transaction {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![3 => Self::spend_strategy(), 1 => Self::issuance_strategy()].boxed()
    }
}

prop_compose! {
    pub fn arb_asset_definition_pointer()(
        asset_id in any::<HashValue>(),
        definition_hash in any::<HashValue>(),
    ) -> AssetDefinitionPointer {
        AssetDefinitionPointer::new(asset_id, definition_hash)
    }
}

impl Arbitrary for AssetDefinitionPointer {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        arb_asset_definition_pointer().boxed()
    }
}

prop_compose! {
    pub fn arb_block_header()(
        version in any::<u32>(),
        height in any::<u64>(),
        previous_block_hash in any::<HashValue>(),
        tx_merkle_root in any::<HashValue>(),
        state_merkle_root in any::<HashValue>(),
        timestamp_seconds in any::<u64>(),
        signature_script in vec(any::<u8>(), 0..32),
        output_script in vec(any::<u8>(), 0..32),
    ) -> BlockHeader {
        BlockHeader {
            version,
            height,
            previous_block_hash,
            tx_merkle_root,
            state_merkle_root,
            timestamp_seconds,
            signature_script,
            output_script,
        }
    }
}

impl Arbitrary for BlockHeader {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        arb_block_header().boxed()
    }
}

impl Arbitrary for Block {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (any::<BlockHeader>(), vec(any::<Transaction>(), 0..8))
            .prop_map(|(header, transactions)| Block::new(header, transactions))
            .boxed()
    }
}
