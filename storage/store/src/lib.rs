// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable record of blocks, confirmed outputs, the pending pool, asset
//! definitions, and asset-definition pointers (§4.1 "State Store").
//! Every mutation that touches more than one row goes through
//! [`Store::atomically`], which binds a [`StoreTxn`] to a single
//! `SchemaBatch` so it commits or fails as a unit.

pub mod schema;

use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_schemadb::{SchemaBatch, SchemaDB};
use chain_types::{
    AssetDefinitionPointer, AssetId, Block, HashValue, Outpoint, Output, OutputState,
    OutputWithState, Reservation, Transaction,
};
use chain_view::{MemoryView, View, ViewReader};
pub use chain_view::OutputDelta;
use schema::{
    AssetDefinitionPointerSchema, AssetDefinitionSchema, BlockHeightIndexSchema, BlockSchema,
    ConfirmedOutputSchema, HeightLockSchema, PoolEntry, PoolTxSchema, ReservationSchema,
    ALL_COLUMN_FAMILIES,
};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// The durable state store: one RocksDB instance with one column family
/// per [`schema::Schema`].
pub struct Store {
    db: SchemaDB,
    pool_seq: AtomicU64,
    // Serializes read-modify-write sequences (lock acquisition, pool
    // sequence allocation) that SchemaDB's per-call atomicity alone
    // does not cover.
    write_lock: Mutex<()>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = SchemaDB::open(path, ALL_COLUMN_FAMILIES)?;
        let pool_seq = AtomicU64::new(Self::recover_pool_seq(&db)?);
        Ok(Store {
            db,
            pool_seq,
            write_lock: Mutex::new(()),
        })
    }

    fn recover_pool_seq(db: &SchemaDB) -> Result<u64> {
        let rows = db.iter::<PoolTxSchema>()?;
        Ok(rows.iter().map(|(_, entry)| entry.seq + 1).max().unwrap_or(0))
    }

    /// Runs `f` against a fresh [`StoreTxn`] and commits its accumulated
    /// batch in one atomic RocksDB write if `f` succeeds; the batch is
    /// discarded on error. This is the "primitive to bind a context to
    /// an open atomic transaction" §4.1 requires.
    pub fn atomically<T>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock().expect("store lock poisoned");
        let mut txn = StoreTxn {
            db: &self.db,
            batch: SchemaBatch::new(),
        };
        let result = f(&mut txn)?;
        self.db.write(txn.batch)?;
        Ok(result)
    }

    pub fn latest_block(&self) -> Result<Block> {
        let rows = self.db.iter::<BlockHeightIndexSchema>()?;
        let (_, hash) = rows
            .into_iter()
            .max_by_key(|(height, _)| *height)
            .ok_or_else(|| ChainErrorKind::not_found("empty chain"))?;
        self.get_block(&hash)
    }

    pub fn get_block(&self, hash: &HashValue) -> Result<Block> {
        self.db
            .get::<BlockSchema>(hash)?
            .ok_or_else(|| ChainErrorKind::not_found(format!("block {}", hash)))
    }

    /// Descending-height page of blocks, `prev_cursor` being the height
    /// string of the last block already returned (`None` starts at the
    /// tip).
    pub fn list_blocks(&self, prev_cursor: Option<u64>, limit: usize) -> Result<Vec<Block>> {
        let mut rows = self.db.iter::<BlockHeightIndexSchema>()?;
        rows.sort_by(|(a, _), (b, _)| b.cmp(a));
        let start = match prev_cursor {
            Some(cursor) => rows.iter().position(|(h, _)| *h < cursor).unwrap_or(rows.len()),
            None => 0,
        };
        rows.into_iter()
            .skip(start)
            .take(limit)
            .map(|(_, hash)| self.get_block(&hash))
            .collect()
    }

    pub fn insert_block(&self, block: &Block) -> Result<()> {
        self.atomically(|txn| txn.insert_block(block))
    }

    /// All pool transactions in a stable topological order: a tx whose
    /// inputs spend another pool tx's output is ordered after it (§4.1
    /// `PoolTxs`).
    pub fn pool_txs(&self) -> Result<Vec<Transaction>> {
        let mut entries = self.db.iter::<PoolTxSchema>()?.into_iter().map(|(_, v)| v).collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        topological_sort(entries)
    }

    pub fn add_pool_tx(&self, tx: &Transaction) -> Result<()> {
        self.atomically(|txn| txn.add_pool_tx(tx, &self.pool_seq))
    }

    pub fn remove_pool_txs(&self, confirmed: &[HashValue], conflicted: &[HashValue]) -> Result<()> {
        self.atomically(|txn| txn.remove_pool_txs(confirmed, conflicted))
    }

    pub fn apply_block(
        &self,
        block: &Block,
        adps: &[AssetDefinitionPointer],
        output_deltas: &[OutputDelta],
    ) -> Result<HashSet<HashValue>> {
        self.atomically(|txn| txn.apply_block(block, adps, output_deltas))
    }

    /// A [`ViewReader`] over the confirmed chain, scoped to exactly the
    /// outpoints `txs` reference, so callers never load the whole UTXO
    /// set (§4.1 `NewViewForPrevouts`).
    pub fn new_view_for_prevouts(&self, txs: &[Transaction]) -> Result<MemoryView> {
        let mut view = MemoryView::new();
        for outpoint in referenced_outpoints(txs) {
            if let Some(output) = self.db.get::<ConfirmedOutputSchema>(&outpoint)? {
                view.save_output(OutputWithState::new(outpoint, output, OutputState::ConfirmedUnspent));
            }
        }
        Ok(view)
    }

    /// As [`Self::new_view_for_prevouts`], but also exposes outputs
    /// created by transactions currently sitting in the pool, so a
    /// chain of unconfirmed spends can validate against each other
    /// (§4.1 `NewPoolViewForPrevouts`). Both layers are materialized
    /// into one owned [`MemoryView`] rather than chained through
    /// [`MultiReader`], since the pool layer only exists for the
    /// duration of this call.
    pub fn new_pool_view_for_prevouts(&self, txs: &[Transaction]) -> Result<MemoryView> {
        let mut pool_outputs = self.db.iter::<PoolTxSchema>()?;
        pool_outputs.sort_by_key(|(_, e)| e.seq);
        let wanted = referenced_outpoints(txs);
        let mut view = self.new_view_for_prevouts(txs)?;
        for (_, entry) in &pool_outputs {
            let tx_hash = entry.tx.hash();
            for (index, output) in entry.tx.outputs.iter().enumerate() {
                let outpoint = Outpoint::new(tx_hash, index as u32);
                if wanted.contains(&outpoint) {
                    view.save_output(OutputWithState::new(outpoint, output.clone(), OutputState::Pending));
                }
            }
        }
        Ok(view)
    }

    pub fn lock_block_height(&self, block: &Block) -> Result<()> {
        self.atomically(|txn| txn.lock_block_height(block))
    }

    pub fn insert_asset_definitions(&self, block: &Block) -> Result<()> {
        self.atomically(|txn| txn.insert_asset_definitions(block))
    }

    pub fn insert_asset_definition_pointers(&self, adps: &[AssetDefinitionPointer]) -> Result<()> {
        self.atomically(|txn| txn.insert_asset_definition_pointers(adps))
    }

    /// Durably records a reservation whose TTL exceeds the reserver's
    /// persistence threshold (§4.5 "Persistence").
    pub fn put_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.atomically(|txn| txn.put_reservation(reservation))
    }

    /// Removes a persisted reservation, e.g. once it is cancelled,
    /// consumed, or expires.
    pub fn remove_reservation(&self, outpoint: &Outpoint) -> Result<()> {
        self.atomically(|txn| txn.remove_reservation(outpoint))
    }

    /// Every persisted reservation, read back at startup to reseed a
    /// fresh `Reserver`'s in-memory state (§4.5 "Persistence").
    pub fn list_reservations(&self) -> Result<Vec<Reservation>> {
        Ok(self.db.iter::<ReservationSchema>()?.into_iter().map(|(_, r)| r).collect())
    }
}

impl ViewReader for Store {
    fn output(&self, outpoint: &Outpoint) -> Result<Option<OutputWithState>> {
        Ok(self
            .db
            .get::<ConfirmedOutputSchema>(outpoint)?
            .map(|output| OutputWithState::new(*outpoint, output, OutputState::ConfirmedUnspent)))
    }

    fn asset_definition_pointer(&self, asset_id: &AssetId) -> Result<Option<AssetDefinitionPointer>> {
        self.db.get::<AssetDefinitionPointerSchema>(asset_id)
    }
}

fn referenced_outpoints(txs: &[Transaction]) -> HashSet<Outpoint> {
    txs.iter()
        .flat_map(|tx| tx.inputs.iter())
        .filter(|input| !input.is_issuance())
        .map(|input| input.previous)
        .collect()
}

/// Orders pool entries so that any entry spending another pool entry's
/// output appears after it, using a stable (insertion-order-preserving
/// among entries with no relative constraint) Kahn's-algorithm pass.
fn topological_sort(entries: Vec<PoolEntry>) -> Result<Vec<Transaction>> {
    let index_of: std::collections::HashMap<HashValue, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.tx.hash(), i))
        .collect();

    let mut in_degree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        for input in &entry.tx.inputs {
            if let Some(&dep_index) = index_of.get(&input.previous.hash) {
                in_degree[i] += 1;
                dependents[dep_index].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &dep in &dependents[i] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                ready.push_back(dep);
            }
        }
    }
    if order.len() != entries.len() {
        return Err(ChainErrorKind::internal("pool contains a dependency cycle"));
    }
    Ok(order.into_iter().map(|i| entries[i].tx.clone()).collect())
}

/// An open atomic transaction against the store: every call accumulates
/// into one [`SchemaBatch`], committed by [`Store::atomically`] when the
/// enclosing closure returns `Ok`.
pub struct StoreTxn<'a> {
    db: &'a SchemaDB,
    batch: SchemaBatch,
}

impl<'a> StoreTxn<'a> {
    pub fn insert_block(&mut self, block: &Block) -> Result<()> {
        let height = block.height();
        if self.db.get::<BlockHeightIndexSchema>(&height)?.is_some() {
            return Err(ChainErrorKind::validation(format!(
                "block already exists at height {}",
                height
            )));
        }
        let hash = block.hash();
        self.batch.put_in::<BlockSchema>(self.db, &hash, block)?;
        self.batch.put_in::<BlockHeightIndexSchema>(self.db, &height, &hash)?;
        Ok(())
    }

    pub fn add_pool_tx(&mut self, tx: &Transaction, pool_seq: &AtomicU64) -> Result<()> {
        let hash = tx.hash();
        if self.db.get::<PoolTxSchema>(&hash)?.is_some() {
            debug!("pool tx {} already present, ignoring duplicate add", hash);
            return Ok(());
        }
        let seq = pool_seq.fetch_add(1, Ordering::SeqCst);
        self.batch
            .put_in::<PoolTxSchema>(self.db, &hash, &PoolEntry { seq, tx: tx.clone() })?;
        Ok(())
    }

    pub fn remove_pool_txs(&mut self, confirmed: &[HashValue], conflicted: &[HashValue]) -> Result<()> {
        for hash in confirmed.iter().chain(conflicted.iter()) {
            self.batch.delete_in::<PoolTxSchema>(self.db, hash)?;
        }
        Ok(())
    }

    /// Confirms `block`: writes the block and its tx index, applies the
    /// given output deltas and ADPs, and removes the block's own
    /// transactions from the pool. Returns the subset of the block's
    /// transactions that were not already present in the pool, i.e.
    /// newly observed by this node.
    pub fn apply_block(
        &mut self,
        block: &Block,
        adps: &[AssetDefinitionPointer],
        output_deltas: &[OutputDelta],
    ) -> Result<HashSet<HashValue>> {
        self.insert_block(block)?;

        let mut newly_known = HashSet::new();
        for tx in &block.transactions {
            let hash = tx.hash();
            if self.db.get::<PoolTxSchema>(&hash)?.is_none() {
                newly_known.insert(hash);
            }
            self.batch.delete_in::<PoolTxSchema>(self.db, &hash)?;
        }

        for delta in output_deltas {
            match delta {
                OutputDelta::Insert(outpoint, output) => {
                    self.batch.put_in::<ConfirmedOutputSchema>(self.db, outpoint, output)?;
                }
                OutputDelta::Spend(outpoint) => {
                    self.batch.delete_in::<ConfirmedOutputSchema>(self.db, outpoint)?;
                }
            }
        }
        self.insert_asset_definition_pointers_inner(adps)?;
        Ok(newly_known)
    }

    pub fn lock_block_height(&mut self, block: &Block) -> Result<()> {
        let height = block.height();
        if self.db.get::<HeightLockSchema>(&height)?.is_some() {
            return Err(ChainErrorKind::validation(format!(
                "height {} already locked by a competing block",
                height
            )));
        }
        self.batch.put_in::<HeightLockSchema>(self.db, &height, &())?;
        Ok(())
    }

    pub fn insert_asset_definitions(&mut self, block: &Block) -> Result<()> {
        for tx in &block.transactions {
            for input in &tx.inputs {
                if let Some(definition) = &input.asset_definition {
                    let hash = HashValue::sha3_256_of(definition);
                    if self.db.get::<AssetDefinitionSchema>(&hash)?.is_none() {
                        self.batch.put_in::<AssetDefinitionSchema>(self.db, &hash, definition)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn insert_asset_definition_pointers(&mut self, adps: &[AssetDefinitionPointer]) -> Result<()> {
        self.insert_asset_definition_pointers_inner(adps)
    }

    fn insert_asset_definition_pointers_inner(&mut self, adps: &[AssetDefinitionPointer]) -> Result<()> {
        for adp in adps {
            self.batch
                .put_in::<AssetDefinitionPointerSchema>(self.db, &adp.asset_id, adp)?;
        }
        Ok(())
    }

    pub fn put_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.batch
            .put_in::<ReservationSchema>(self.db, &reservation.outpoint, reservation)?;
        Ok(())
    }

    pub fn remove_reservation(&mut self, outpoint: &Outpoint) -> Result<()> {
        self.batch.delete_in::<ReservationSchema>(self.db, outpoint)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::Input;
    use tempfile::tempdir;

    fn sample_output(asset: &str, amount: u64) -> Output {
        Output::new(HashValue::sha3_256_of(asset.as_bytes()), amount, vec![], vec![])
    }

    fn issuance_tx(seed: &str) -> Transaction {
        let input = Input::new(
            Outpoint::issuance(HashValue::sha3_256_of(seed.as_bytes())),
            vec![],
            vec![],
            Some(b"definition".to_vec()),
        );
        Transaction::new(1, vec![input], vec![sample_output("usd", 10)], 0, vec![])
    }

    fn genesis_block() -> Block {
        use chain_types::BlockHeader;
        Block::new(
            BlockHeader {
                version: 1,
                height: 0,
                previous_block_hash: HashValue::zero(),
                tx_merkle_root: HashValue::zero(),
                state_merkle_root: HashValue::zero(),
                timestamp_seconds: 1,
                signature_script: vec![],
                output_script: vec![],
            },
            vec![],
        )
    }

    #[test]
    fn latest_block_errors_on_empty_chain() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.latest_block().is_err());
    }

    #[test]
    fn insert_block_then_get_and_latest() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let block = genesis_block();
        store.insert_block(&block).unwrap();
        assert_eq!(store.get_block(&block.hash()).unwrap(), block);
        assert_eq!(store.latest_block().unwrap(), block);
    }

    #[test]
    fn insert_block_rejects_duplicate_height() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.insert_block(&genesis_block()).unwrap();
        assert!(store.insert_block(&genesis_block()).is_err());
    }

    #[test]
    fn add_pool_tx_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tx = issuance_tx("a");
        store.add_pool_tx(&tx).unwrap();
        store.add_pool_tx(&tx).unwrap();
        assert_eq!(store.pool_txs().unwrap(), vec![tx]);
    }

    #[test]
    fn pool_txs_orders_dependents_after_their_parent() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let parent = issuance_tx("parent");
        let child_input = Input::new(
            Outpoint::new(parent.hash(), 0),
            vec![],
            vec![],
            None,
        );
        let child = Transaction::new(1, vec![child_input], vec![sample_output("usd", 5)], 0, vec![]);

        // Insert child first to prove ordering is not insertion order.
        store.add_pool_tx(&child).unwrap();
        store.add_pool_tx(&parent).unwrap();

        let ordered = store.pool_txs().unwrap();
        let parent_pos = ordered.iter().position(|t| t == &parent).unwrap();
        let child_pos = ordered.iter().position(|t| t == &child).unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn remove_pool_txs_deletes_confirmed_and_conflicted() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let confirmed = issuance_tx("confirmed");
        let conflicted = issuance_tx("conflicted");
        store.add_pool_tx(&confirmed).unwrap();
        store.add_pool_tx(&conflicted).unwrap();
        store
            .remove_pool_txs(&[confirmed.hash()], &[conflicted.hash()])
            .unwrap();
        assert!(store.pool_txs().unwrap().is_empty());
    }

    #[test]
    fn apply_block_inserts_outputs_and_reports_newly_known_txs() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tx = issuance_tx("apply");
        let block = {
            use chain_types::BlockHeader;
            Block::new(
                BlockHeader {
                    version: 1,
                    height: 0,
                    previous_block_hash: HashValue::zero(),
                    tx_merkle_root: HashValue::zero(),
                    state_merkle_root: HashValue::zero(),
                    timestamp_seconds: 1,
                    signature_script: vec![],
                    output_script: vec![],
                },
                vec![tx.clone()],
            )
        };
        let outpoint = Outpoint::new(tx.hash(), 0);
        let delta = OutputDelta::Insert(outpoint, tx.outputs[0].clone());
        let newly_known = store.apply_block(&block, &[], &[delta]).unwrap();
        assert!(newly_known.contains(&tx.hash()));
        assert!(store.output(&outpoint).unwrap().is_some());
    }

    #[test]
    fn lock_block_height_rejects_second_lock_at_same_height() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let block = genesis_block();
        store.lock_block_height(&block).unwrap();
        assert!(store.lock_block_height(&block).is_err());
    }

    #[test]
    fn insert_asset_definition_pointers_is_idempotent_and_readable() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let adp = AssetDefinitionPointer::new(
            HashValue::sha3_256_of(b"asset"),
            HashValue::sha3_256_of(b"definition"),
        );
        store.insert_asset_definition_pointers(&[adp]).unwrap();
        store.insert_asset_definition_pointers(&[adp]).unwrap();
        assert_eq!(
            store.asset_definition_pointer(&adp.asset_id).unwrap(),
            Some(adp)
        );
    }

    #[test]
    fn new_view_for_prevouts_only_sees_referenced_outpoints() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let tx = issuance_tx("scope");
        let outpoint = Outpoint::new(tx.hash(), 0);
        let delta = OutputDelta::Insert(outpoint, tx.outputs[0].clone());
        let block = {
            use chain_types::BlockHeader;
            Block::new(
                BlockHeader {
                    version: 1,
                    height: 0,
                    previous_block_hash: HashValue::zero(),
                    tx_merkle_root: HashValue::zero(),
                    state_merkle_root: HashValue::zero(),
                    timestamp_seconds: 1,
                    signature_script: vec![],
                    output_script: vec![],
                },
                vec![tx.clone()],
            )
        };
        store.apply_block(&block, &[], &[delta]).unwrap();

        let spend_input = Input::new(outpoint, vec![], vec![], None);
        let spend_tx = Transaction::new(1, vec![spend_input], vec![sample_output("usd", 3)], 0, vec![]);
        let view = store.new_view_for_prevouts(&[spend_tx]).unwrap();
        assert!(view.output(&outpoint).unwrap().is_some());
    }

    #[test]
    fn reservation_persists_and_can_be_listed_then_removed() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let outpoint = Outpoint::new(HashValue::sha3_256_of(b"tx"), 0);
        let reservation = Reservation::new(
            outpoint,
            "acct-1".to_string(),
            HashValue::sha3_256_of(b"usd"),
            1_000,
            None,
        );
        store.put_reservation(&reservation).unwrap();
        assert_eq!(store.list_reservations().unwrap(), vec![reservation]);

        store.remove_reservation(&outpoint).unwrap();
        assert!(store.list_reservations().unwrap().is_empty());
    }
}
