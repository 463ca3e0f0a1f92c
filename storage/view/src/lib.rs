// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-through, write-capturing overlays over the state store (§4.2
//! "View"). A `View` is not thread-safe; callers construct one per
//! validation scope (a single transaction or a single block) and
//! discard it afterward.

use chain_failure_ext::Result;
use chain_types::{AssetDefinitionPointer, AssetId, Output, Outpoint, OutputWithState};
use std::collections::HashMap;

/// A single confirmed-state change produced by applying a transaction or
/// block: either a newly-confirmed output or the spending of a
/// previously unspent one (§4.1 `ApplyBlock`'s `output_deltas`
/// argument). Shared by the validator (which computes these) and the
/// state store (which persists them).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputDelta {
    Insert(Outpoint, Output),
    Spend(Outpoint),
}

/// Read-only access to outputs and asset-definition pointers. The State
/// Store itself implements this (backed by RocksDB); so does
/// [`MemoryView`] (backed by a `HashMap`), so in-memory overlays and the
/// durable store are interchangeable to anything that only reads.
pub trait ViewReader {
    /// Returns the output at `outpoint`, or `None` if this reader has no
    /// knowledge of it (§4.2 "`Output(outpoint)`").
    fn output(&self, outpoint: &Outpoint) -> Result<Option<OutputWithState>>;

    fn asset_definition_pointer(&self, asset_id: &AssetId) -> Result<Option<AssetDefinitionPointer>>;
}

/// A [`ViewReader`] that also captures writes, accumulated for later
/// application by the caller (the validator commits them via
/// `ApplyBlock`/`ApplyTx`; it never writes straight through).
pub trait View: ViewReader {
    fn save_output(&mut self, output: OutputWithState);
    fn save_asset_definition_pointer(&mut self, adp: AssetDefinitionPointer);
}

/// An in-memory, writable view with no underlying reader: every read
/// only sees what has already been saved into it. Used standalone in
/// tests, and as the writable layer inside [`Compose`].
#[derive(Default)]
pub struct MemoryView {
    outputs: HashMap<Outpoint, OutputWithState>,
    adps: HashMap<AssetId, AssetDefinitionPointer>,
}

impl MemoryView {
    pub fn new() -> Self {
        MemoryView::default()
    }

    pub fn saved_outputs(&self) -> impl Iterator<Item = &OutputWithState> {
        self.outputs.values()
    }

    pub fn saved_asset_definition_pointers(&self) -> impl Iterator<Item = &AssetDefinitionPointer> {
        self.adps.values()
    }
}

impl ViewReader for MemoryView {
    fn output(&self, outpoint: &Outpoint) -> Result<Option<OutputWithState>> {
        Ok(self.outputs.get(outpoint).cloned())
    }

    fn asset_definition_pointer(&self, asset_id: &AssetId) -> Result<Option<AssetDefinitionPointer>> {
        Ok(self.adps.get(asset_id).cloned())
    }
}

impl View for MemoryView {
    fn save_output(&mut self, output: OutputWithState) {
        self.outputs.insert(output.outpoint, output);
    }

    fn save_asset_definition_pointer(&mut self, adp: AssetDefinitionPointer) {
        self.adps.insert(adp.asset_id, adp);
    }
}

/// Chains read-only views, returning the first non-`None` result (§4.2
/// "MultiReader"). Used e.g. to check a block-local pending overlay
/// before falling back to the confirmed blockchain view.
pub struct MultiReader<'a> {
    readers: Vec<&'a dyn ViewReader>,
}

impl<'a> MultiReader<'a> {
    pub fn new(readers: Vec<&'a dyn ViewReader>) -> Self {
        MultiReader { readers }
    }
}

impl<'a> ViewReader for MultiReader<'a> {
    fn output(&self, outpoint: &Outpoint) -> Result<Option<OutputWithState>> {
        for reader in &self.readers {
            if let Some(output) = reader.output(outpoint)? {
                return Ok(Some(output));
            }
        }
        Ok(None)
    }

    fn asset_definition_pointer(&self, asset_id: &AssetId) -> Result<Option<AssetDefinitionPointer>> {
        for reader in &self.readers {
            if let Some(adp) = reader.asset_definition_pointer(asset_id)? {
                return Ok(Some(adp));
            }
        }
        Ok(None)
    }
}

/// Layers a writable memory view atop one or more read-only views, for
/// use while validating a transaction or an entire block (§4.2
/// "Compose"): writes accumulate in the memory layer only; reads
/// consult the memory overlay first, then the underlying readers in
/// order.
pub struct Compose<'a> {
    memory: MemoryView,
    underlying: MultiReader<'a>,
}

impl<'a> Compose<'a> {
    pub fn new(underlying: Vec<&'a dyn ViewReader>) -> Self {
        Compose {
            memory: MemoryView::new(),
            underlying: MultiReader::new(underlying),
        }
    }

    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }
}

impl<'a> ViewReader for Compose<'a> {
    fn output(&self, outpoint: &Outpoint) -> Result<Option<OutputWithState>> {
        if let Some(output) = self.memory.output(outpoint)? {
            return Ok(Some(output));
        }
        self.underlying.output(outpoint)
    }

    fn asset_definition_pointer(&self, asset_id: &AssetId) -> Result<Option<AssetDefinitionPointer>> {
        if let Some(adp) = self.memory.asset_definition_pointer(asset_id)? {
            return Ok(Some(adp));
        }
        self.underlying.asset_definition_pointer(asset_id)
    }
}

impl<'a> View for Compose<'a> {
    fn save_output(&mut self, output: OutputWithState) {
        self.memory.save_output(output);
    }

    fn save_asset_definition_pointer(&mut self, adp: AssetDefinitionPointer) {
        self.memory.save_asset_definition_pointer(adp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_crypto::HashValue;
    use chain_types::{Output, OutputState};

    fn sample_output(outpoint: Outpoint, state: OutputState) -> OutputWithState {
        OutputWithState::new(
            outpoint,
            Output::new(HashValue::sha3_256_of(b"usd"), 10, vec![], vec![]),
            state,
        )
    }

    #[test]
    fn memory_view_only_sees_saved_outputs() {
        let mut view = MemoryView::new();
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        assert!(view.output(&outpoint).unwrap().is_none());
        view.save_output(sample_output(outpoint, OutputState::ConfirmedUnspent));
        assert!(view.output(&outpoint).unwrap().is_some());
    }

    #[test]
    fn multi_reader_falls_through_in_order() {
        let outpoint_a = Outpoint::new(HashValue::sha3_256_of(b"a"), 0);
        let outpoint_b = Outpoint::new(HashValue::sha3_256_of(b"b"), 0);
        let mut first = MemoryView::new();
        first.save_output(sample_output(outpoint_a, OutputState::Pending));
        let mut second = MemoryView::new();
        second.save_output(sample_output(outpoint_b, OutputState::ConfirmedUnspent));

        let chained = MultiReader::new(vec![&first, &second]);
        assert!(chained.output(&outpoint_a).unwrap().is_some());
        assert!(chained.output(&outpoint_b).unwrap().is_some());
        assert!(chained
            .output(&Outpoint::new(HashValue::sha3_256_of(b"c"), 0))
            .unwrap()
            .is_none());
    }

    #[test]
    fn compose_prefers_memory_overlay_over_underlying() {
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let mut underlying = MemoryView::new();
        underlying.save_output(sample_output(outpoint, OutputState::ConfirmedUnspent));

        let mut compose = Compose::new(vec![&underlying]);
        assert_eq!(
            compose.output(&outpoint).unwrap().unwrap().state,
            OutputState::ConfirmedUnspent
        );

        compose.save_output(sample_output(outpoint, OutputState::ConfirmedSpent));
        assert_eq!(
            compose.output(&outpoint).unwrap().unwrap().state,
            OutputState::ConfirmedSpent
        );
    }
}
