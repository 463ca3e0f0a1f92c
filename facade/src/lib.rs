// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wires the State Store, Pool, Executor, Reserver, and Builder into one
//! API surface (§4.8 "Chain Facade"): `AddTx`, `AddBlock`,
//! `GenerateBlock`, `LatestBlock`, `ValidateBlockForSig`,
//! `UpsertGenesisBlock`, tx/block callback registration, and
//! `WaitForBlock`. Also owns the concurrency this core leaves to its
//! embedder: the periodic generator loop (`GenerateBlock -> sign ->
//! AddBlock`, panic-isolated per iteration) and a follower's pull-sync
//! loop against a peer's RPC server.

use async_trait::async_trait;
use chain_builder::{Builder, ChangeReceiver, ReservationSource};
use chain_crypto::{HashValue, PrivateKey, Signature};
use chain_executor::{AddBlockOutcome, Executor};
use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use chain_reserver::{CandidateSource, OutputOwner, Reserver};
use chain_script_vm::opcode::{Opcode, ScriptBuilder};
use chain_types::{AssetId, Block, BlockHeader, Input, Output, Outpoint, Transaction};
use lazy_static::lazy_static;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("facade");
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// Forwards to the blanket `ReservationSource` impl on
/// `chain_reserver::Reserver<S>` through a shared reference, so the
/// facade and the builder can both hold a handle onto the same reserver
/// (§9 "Polymorphism over receivers and reservers").
struct SharedReserver<S: CandidateSource>(Arc<Reserver<S>>);

impl<S: CandidateSource> ReservationSource for SharedReserver<S> {
    fn reserve(
        &self,
        source: &chain_builder::Source,
        ttl: Duration,
        now: u64,
    ) -> Result<chain_builder::ReservationOutcome> {
        <Reserver<S> as ReservationSource>::reserve(&self.0, source, ttl, now)
    }

    fn cancel(&self, outpoints: &[chain_types::Outpoint]) {
        <Reserver<S> as ReservationSource>::cancel(&self.0, outpoints)
    }
}

type BlockCallback = Box<dyn Fn(&Block, &[HashValue]) + Send + Sync>;

/// The federation's `CheckSig` output script: a single public key pushed
/// ahead of the opcode, satisfied by one signature over
/// [`Executor::hash_for_sig`] in the next block's `signature_script`
/// (§4.3 "Federation multisig", SPEC_FULL §C "genesis bootstrap").
pub fn federation_output_script(public_key_bytes: [u8; 32]) -> Vec<u8> {
    ScriptBuilder::new().push(public_key_bytes.to_vec()).op(Opcode::CheckSig).into_bytes()
}

/// Builds the height-0 block a fresh chain starts from: a federation
/// multisig `output_script` (so the first real block can be signed by
/// the federation key) and a single issuance transaction crediting
/// `root_account_control_script` with `root_account_amount` of
/// `root_account_asset_id`, standing in for the "root account" `chain
/// bootdb` seeds (SPEC_FULL §B "chain-node bootdb", §C "genesis
/// bootstrap"). Does not touch any store; pass the result to
/// [`Facade::upsert_genesis_block`].
pub fn build_genesis_block(
    federation_public_key_bytes: [u8; 32],
    root_account_asset_id: AssetId,
    root_account_amount: u64,
    root_account_control_script: Vec<u8>,
) -> Block {
    let issuance = Transaction::new(
        1,
        vec![Input::new(Outpoint::issuance(HashValue::sha3_256_of(b"genesis-root-account")), vec![], vec![], None)],
        vec![Output::new(root_account_asset_id, root_account_amount, root_account_control_script, vec![])],
        0,
        vec![],
    );
    let tx_hashes = vec![issuance.hash()];
    let header = BlockHeader {
        version: 1,
        height: 0,
        previous_block_hash: HashValue::zero(),
        tx_merkle_root: chain_accumulator::compute_root(&tx_hashes),
        state_merkle_root: HashValue::zero(),
        timestamp_seconds: 0,
        signature_script: Vec::new(),
        output_script: federation_output_script(federation_public_key_bytes),
    };
    Block::new(header, vec![issuance])
}

/// The single entry point an embedder (the RPC server, the CLI, tests)
/// talks to. Generic over the account index (`S`) and change-output
/// policy (`C`) the caller's [`chain_reserver::Reserver`] and
/// [`chain_builder::Builder`] are built with, since this crate has no
/// opinion on either (§9).
pub struct Facade<
    S: CandidateSource + Send + Sync + 'static,
    C: ChangeReceiver + Send + Sync + 'static,
    O: OutputOwner + Send + Sync + 'static,
> {
    executor: Executor,
    reserver: Arc<Reserver<S>>,
    builder: Builder<SharedReserver<S>, C>,
    output_owner: O,
    genesis_hash: HashValue,
    signer: Option<PrivateKey>,
    height: Mutex<u64>,
    height_cv: Condvar,
    block_callbacks: Mutex<Vec<BlockCallback>>,
}

impl<S, C, O> Facade<S, C, O>
where
    S: CandidateSource + Send + Sync + 'static,
    C: ChangeReceiver + Send + Sync + 'static,
    O: OutputOwner + Send + Sync + 'static,
{
    pub fn new(
        executor: Executor,
        reserver: Arc<Reserver<S>>,
        change_receiver: C,
        output_owner: O,
        genesis_hash: HashValue,
        signer: Option<PrivateKey>,
    ) -> Self {
        let height = executor.store().latest_block().map(|b| b.height()).unwrap_or(0);
        let builder = Builder::new(SharedReserver(reserver.clone()), change_receiver);
        Facade {
            executor,
            reserver,
            builder,
            output_owner,
            genesis_hash,
            signer,
            height: Mutex::new(height),
            height_cv: Condvar::new(),
            block_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn reserver(&self) -> &Arc<Reserver<S>> {
        &self.reserver
    }

    pub fn builder(&self) -> &Builder<SharedReserver<S>, C> {
        &self.builder
    }

    /// Inserts `genesis` if this node's store is empty; otherwise a
    /// no-op, so a node can safely call this on every startup (§6
    /// bootstrap, SPEC_FULL §C "genesis bootstrap via
    /// `UpsertGenesisBlock`").
    pub fn upsert_genesis_block(&self, genesis: Block) -> Result<()> {
        if genesis.header.height != 0 {
            return Err(ChainErrorKind::bad_request("genesis block must be at height 0"));
        }
        match self.executor.store().latest_block() {
            Ok(_) => Ok(()),
            Err(_) => {
                self.executor.store().insert_block(&genesis)?;
                *self.height.lock().expect("height lock poisoned") = 0;
                self.height_cv.notify_all();
                info!("inserted genesis block {}", genesis.hash());
                Ok(())
            }
        }
    }

    pub fn latest_block(&self) -> Result<Block> {
        self.executor.store().latest_block()
    }

    /// Validates and admits `tx` into the pool (§4.1 `AddTx`).
    pub fn add_tx(&self, tx: &Transaction, now: u64) -> Result<()> {
        self.executor.pool().add_tx(tx, now)
    }

    pub fn register_tx_callback(&self, callback: impl Fn(&Transaction) + Send + Sync + 'static) {
        self.executor.pool().register_tx_callback(callback);
    }

    pub fn register_block_callback(&self, callback: impl Fn(&Block, &[HashValue]) + Send + Sync + 'static) {
        self.block_callbacks
            .lock()
            .expect("block callback list poisoned")
            .push(Box::new(callback));
    }

    pub fn generate_block(&self, now: u64) -> Result<(Block, Block)> {
        self.executor.generate_block(now)
    }

    /// Validates `candidate` well enough to sign and returns the hash its
    /// predecessor's `output_script` must accept (§4.4
    /// `ValidateBlockForSig`).
    pub fn validate_block_for_sig(&self, candidate: &Block, prev: &Block, now: u64) -> Result<HashValue> {
        chain_validator::validate_block_for_sig(
            self.executor.store().as_ref(),
            candidate,
            prev,
            now,
            self.genesis_hash,
        )?;
        Ok(Executor::hash_for_sig(candidate))
    }

    pub fn add_signatures_to_block(&self, block: Block, signatures: &[Signature]) -> Block {
        self.executor.add_signatures_to_block(block, signatures)
    }

    /// Applies `block`, reconciles the pool, advances the height lock
    /// (waking any [`Self::wait_for_block`] callers), and fires every
    /// registered tx/block callback (§4.7 `AddBlock` steps 4-6).
    pub fn add_block(&self, block: &Block, now: u64, trusted: bool) -> Result<AddBlockOutcome> {
        self.executor.store().lock_block_height(block)?;
        let outcome = self.executor.add_block(block, now, trusted)?;

        self.reserver
            .apply(&outcome.apply.output_deltas, |outpoint, output| self.output_owner.owner(outpoint, output));

        for tx in &block.transactions {
            self.executor.pool().notify_applied(tx);
        }

        {
            let mut height = self.height.lock().expect("height lock poisoned");
            *height = block.header.height;
        }
        self.height_cv.notify_all();

        for callback in self.block_callbacks.lock().expect("block callback list poisoned").iter() {
            callback(block, &outcome.conflicts);
        }

        OP_COUNTERS.set("height", &[], block.header.height as i64);
        Ok(outcome)
    }

    /// Blocks the calling thread until the confirmed chain reaches
    /// `height` or `timeout` elapses (§5 "WaitForBlock... a mutex plus
    /// condition variable").
    pub fn wait_for_block(&self, height: u64, timeout: Duration) -> Result<u64> {
        let guard = self.height.lock().expect("height lock poisoned");
        let (guard, result) = self
            .height_cv
            .wait_timeout_while(guard, timeout, |current| *current < height)
            .expect("height condvar wait poisoned");
        if result.timed_out() && *guard < height {
            return Err(ChainErrorKind::not_found(format!(
                "timed out waiting for height {} (currently at {})",
                height, *guard
            )));
        }
        Ok(*guard)
    }

    fn generate_sign_and_add(&self, now: u64) -> Result<()> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| ChainErrorKind::internal("generator loop requires a signing key"))?;
        let (candidate, _prev) = self.generate_block(now)?;
        let signature = signer.sign(Executor::hash_for_sig(&candidate).as_bytes());
        let signed = self.add_signatures_to_block(candidate, &[signature]);
        self.add_block(&signed, now, true)?;
        Ok(())
    }

    /// Runs `GenerateBlock -> sign -> AddBlock` on a fixed cadence,
    /// forever, isolating each iteration's panics so one bad tick never
    /// brings the node down (§4.7 "Generator loop", §7). Intended to be
    /// `tokio::spawn`ed once at node startup on generator-role nodes.
    pub async fn run_generator_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let facade = self.clone();
            let now = now_seconds();
            match chain_crash_handler::catch_and_log("generator loop tick", move || facade.generate_sign_and_add(now)) {
                Some(Ok(())) => {}
                Some(Err(err)) => warn!("generator loop tick failed"; "error" => %err),
                None => {}
            }
        }
    }

    /// Pulls and trusted-applies every block the peer reports past this
    /// node's tip, in order (§6 "Peer RPC", follower role). Returns how
    /// many blocks were applied.
    pub async fn sync_from_peer(&self, client: &chain_rpc::PeerClient, now: u64) -> Result<usize> {
        let since_height = self.executor.store().latest_block().ok().map(|b| b.height());
        let blocks = client.get_blocks(since_height).await?;
        let mut applied = 0;
        for block in blocks {
            self.add_block(&block, now, true)?;
            applied += 1;
        }
        if applied > 0 {
            debug!("follower sync applied {} blocks from peer", applied);
        }
        Ok(applied)
    }

    fn blocks_since(&self, since_height: Option<u64>) -> Result<Vec<Block>> {
        let store = self.executor.store();
        let tip = match store.latest_block() {
            Ok(block) => block.height(),
            Err(_) => return Ok(Vec::new()),
        };
        let start = since_height.map(|h| h + 1).unwrap_or(0);
        if start > tip {
            return Ok(Vec::new());
        }
        let mut blocks = store.list_blocks(None, (tip - start + 1) as usize)?;
        blocks.retain(|b| b.height() >= start);
        blocks.sort_by_key(|b| b.height());
        Ok(blocks)
    }
}

/// Lets an RPC server dispatch directly into a [`Facade`] (§6 "Peer
/// RPC"): submitting a transaction admits it into the pool; fetching
/// blocks serves the follower sync path above.
#[async_trait]
impl<S, C, O> chain_rpc::GeneratorRpc for Facade<S, C, O>
where
    S: CandidateSource + Send + Sync + 'static,
    C: ChangeReceiver + Send + Sync + 'static,
    O: OutputOwner + Send + Sync + 'static,
{
    async fn submit_tx(&self, tx: Transaction) -> Result<()> {
        self.add_tx(&tx, now_seconds())
    }

    async fn get_blocks(&self, since_height: Option<u64>) -> Result<Vec<Block>> {
        self.blocks_since(since_height)
    }
}
