// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The pending transaction pool: admits new transactions, dispatches
//! registered callbacks when one is confirmed, and reconciles itself
//! against a freshly applied block (§4.7 "Pool / Block Generator", steps
//! 3 and 5). The durable pool rows themselves live in [`chain_store`];
//! this crate is the validation and notification layer around them.

use chain_crypto::HashValue;
use chain_failure_ext::Result;
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use chain_store::Store;
use chain_types::Transaction;
use chain_view::ViewReader;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("pool");
}

type TxCallback = Box<dyn Fn(&Transaction) + Send + Sync>;

/// Owns the set of registered tx callbacks and mediates pool admission
/// and reconciliation through a shared [`Store`].
pub struct Pool {
    store: Arc<Store>,
    tx_callbacks: Mutex<Vec<TxCallback>>,
}

impl Pool {
    pub fn new(store: Arc<Store>) -> Self {
        Pool {
            store,
            tx_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Validates `tx` against a view scoped to its own prevouts (which
    /// also exposes other pool transactions it may chain off of) and, if
    /// valid, admits it into the durable pool (§4.1 `AddPoolTx`, §5 "A
    /// transaction's AddTx either returns error or makes its outputs
    /// visible to subsequent PoolTxs() reads").
    pub fn add_tx(&self, tx: &Transaction, now: u64) -> Result<()> {
        let view = self.store.new_pool_view_for_prevouts(std::slice::from_ref(tx))?;
        chain_validator::validate_tx(&view, tx, now)?;
        self.store.add_pool_tx(tx)?;
        OP_COUNTERS.inc("add_tx", &["ok"]);
        Ok(())
    }

    /// All pool transactions in dependency order, capped at `limit`
    /// (§4.7 step 2, `MaxBlockTxs`).
    pub fn pending(&self, limit: usize) -> Result<Vec<Transaction>> {
        let mut txs = self.store.pool_txs()?;
        txs.truncate(limit);
        Ok(txs)
    }

    /// Re-runs validation for every pool transaction not already in
    /// `confirmed` against the post-apply `view`; anything that no
    /// longer validates is a conflict. Removes both the confirmed and
    /// conflicted sets from the durable pool atomically (§4.7 step 3).
    pub fn reconcile(
        &self,
        confirmed: &[HashValue],
        view: &dyn ViewReader,
        now: u64,
    ) -> Result<Vec<HashValue>> {
        let confirmed_set: std::collections::HashSet<HashValue> = confirmed.iter().copied().collect();
        let mut conflicted = Vec::new();
        for tx in self.store.pool_txs()? {
            let hash = tx.hash();
            if confirmed_set.contains(&hash) {
                continue;
            }
            if !chain_validator::still_valid_against(view, &tx, now) {
                conflicted.push(hash);
            }
        }
        self.store.remove_pool_txs(confirmed, &conflicted)?;
        if !conflicted.is_empty() {
            debug!("pool reconciliation evicted {} conflicting transactions", conflicted.len());
        }
        OP_COUNTERS.inc("reconcile", &["ok"]);
        Ok(conflicted)
    }

    pub fn register_tx_callback(&self, callback: impl Fn(&Transaction) + Send + Sync + 'static) {
        self.tx_callbacks.lock().expect("tx callback list poisoned").push(Box::new(callback));
    }

    /// Fires every registered tx callback for `tx`, in registration order
    /// (§4.7 step 5).
    pub fn notify_applied(&self, tx: &Transaction) {
        for callback in self.tx_callbacks.lock().expect("tx callback list poisoned").iter() {
            callback(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_types::{Block, BlockHeader, Input, Outpoint, Output};
    use chain_view::OutputDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn issuance_tx(seed: &str, amount: u64) -> Transaction {
        let input = Input::new(Outpoint::issuance(HashValue::sha3_256_of(seed.as_bytes())), vec![], vec![], None);
        let output = Output::new(HashValue::sha3_256_of(b"usd"), amount, vec![], vec![]);
        Transaction::new(1, vec![input], vec![output], 0, vec![])
    }

    fn block_with(height: u64, prev_hash: HashValue, txs: Vec<Transaction>) -> Block {
        Block::new(
            BlockHeader {
                version: 1,
                height,
                previous_block_hash: prev_hash,
                tx_merkle_root: chain_accumulator::compute_root(&txs.iter().map(Transaction::hash).collect::<Vec<_>>()),
                state_merkle_root: HashValue::zero(),
                timestamp_seconds: 1,
                signature_script: vec![],
                output_script: vec![],
            },
            txs,
        )
    }

    #[test]
    fn add_tx_admits_a_valid_issuance() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let pool = Pool::new(store.clone());
        let tx = issuance_tx("a", 10);
        pool.add_tx(&tx, 0).unwrap();
        assert_eq!(pool.pending(10).unwrap(), vec![tx]);
    }

    #[test]
    fn add_tx_rejects_an_invalid_spend() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let pool = Pool::new(store);
        let bogus_input = Input::new(Outpoint::new(HashValue::sha3_256_of(b"nowhere"), 0), vec![], vec![], None);
        let spend = Transaction::new(1, vec![bogus_input], vec![], 0, vec![]);
        assert!(pool.add_tx(&spend, 0).is_err());
    }

    #[test]
    fn reconcile_evicts_conflicting_pool_transactions() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let pool = Pool::new(store.clone());

        let issuance = issuance_tx("conflict-seed", 10);
        let issuance_outpoint = Outpoint::new(issuance.hash(), 0);
        let spend_a = Transaction::new(
            1,
            vec![Input::new(issuance_outpoint, vec![], vec![], None)],
            vec![Output::new(HashValue::sha3_256_of(b"usd"), 10, vec![], vec![])],
            0,
            vec![1],
        );
        let spend_b = Transaction::new(
            1,
            vec![Input::new(issuance_outpoint, vec![], vec![], None)],
            vec![Output::new(HashValue::sha3_256_of(b"usd"), 10, vec![], vec![])],
            0,
            vec![2],
        );

        let delta = OutputDelta::Insert(issuance_outpoint, issuance.outputs[0].clone());
        let genesis = block_with(0, HashValue::zero(), vec![]);
        store.insert_block(&genesis).unwrap();
        let block_a = block_with(1, genesis.hash(), vec![issuance.clone()]);
        store.apply_block(&block_a, &[], &[delta]).unwrap();

        store.add_pool_tx(&spend_a).unwrap();
        store.add_pool_tx(&spend_b).unwrap();

        let spend_delta = OutputDelta::Spend(issuance_outpoint);
        let block_b = block_with(2, block_a.hash(), vec![spend_a.clone()]);
        store.apply_block(&block_b, &[], &[spend_delta]).unwrap();

        let conflicted = pool.reconcile(&[spend_a.hash()], store.as_ref(), 0).unwrap();
        assert_eq!(conflicted, vec![spend_b.hash()]);
        assert!(pool.pending(10).unwrap().is_empty());
    }

    #[test]
    fn notify_applied_fires_every_registered_callback() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let pool = Pool::new(store);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        pool.register_tx_callback(move |_tx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.notify_applied(&issuance_tx("notify", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
