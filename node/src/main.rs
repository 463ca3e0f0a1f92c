// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `chain-node`: a thin CLI wrapper around [`chain_facade`]. Carries no
//! business logic of its own (§1 non-goals) — it loads a
//! [`chain_config::NodeConfig`], wires the state store, pool, executor,
//! a no-op reserver/change-receiver pair (the account index and payout
//! policy are this core's caller's responsibility, per §9
//! "polymorphism over receivers and reservers"), and the RPC server,
//! then runs the generator loop or the follower sync loop depending on
//! `config.role`.

use chain_builder::ChangeReceiver;
use chain_crash_handler::set_panic_hook;
use chain_executor::Executor;
use chain_facade::Facade;
use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_logger::LogFormat;
use chain_reserver::{CandidateSource, OutputOwner, Reserver};
use chain_types::{AssetId, Block, HashValue, Output, Outpoint};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chain-node", about = "Permissioned blockchain core node")]
struct Cli {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "node.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the node: opens the store, starts the RPC server, and
    /// either the generator loop or the follower sync loop.
    Run {
        /// Path to a canonically-serialized genesis block, inserted via
        /// `UpsertGenesisBlock` if the store is still empty.
        #[arg(long)]
        genesis: Option<PathBuf>,
    },
    /// Opens (creating if absent) the RocksDB store at `db_url`,
    /// generates a federation keypair if the config doesn't already have
    /// one, and inserts a genesis block with a root account; use before
    /// `run` to separate provisioning from serving.
    Bootdb,
    /// Operator maintenance commands that rewrite the config file.
    Corectl {
        #[command(subcommand)]
        action: CorectlAction,
    },
}

#[derive(Subcommand)]
enum CorectlAction {
    /// Sets `role` to `generator` or `follower`.
    SetRole { role: String },
    /// Sets the `blockchain_id` every peer RPC call is checked against.
    SetBlockchainId { id: String },
}

struct NoCandidates;
impl CandidateSource for NoCandidates {
    fn load(&self, _account_id: &str, _asset_id: &AssetId) -> Result<Vec<(Outpoint, Output)>> {
        Ok(Vec::new())
    }
}

struct NullChangeReceiver;
impl ChangeReceiver for NullChangeReceiver {
    fn control_script_and_metadata(&self, _account_id: &str, _asset_id: AssetId, _amount: u64) -> (Vec<u8>, Vec<u8>) {
        (Vec::new(), Vec::new())
    }
}

/// No account-index integration is wired into this core; every confirmed
/// output is treated as untracked by any reservation pool until a caller
/// supplies a real [`OutputOwner`] (§9 "polymorphism over receivers and
/// reservers").
struct NullOutputOwner;
impl OutputOwner for NullOutputOwner {
    fn owner(&self, _outpoint: &Outpoint, _output: &Output) -> Option<(String, AssetId)> {
        None
    }
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// The genesis block is this chain's own identity seed (`derive_asset_id`
/// scopes every issued asset ID to it), so it must be known before
/// anything else can run. Prefers a freshly supplied `--genesis` file;
/// falls back to whatever height-0 block the store already has from a
/// previous run.
fn resolve_genesis_hash(store: &chain_store::Store, genesis_path: &Option<PathBuf>) -> Result<HashValue> {
    if let Some(path) = genesis_path {
        let bytes = std::fs::read(path)
            .map_err(|e| ChainErrorKind::io(format!("reading genesis block {}: {}", path.display(), e)))?;
        let genesis = Block::from_canonical_bytes(&bytes)?;
        if store.latest_block().is_err() {
            store.insert_block(&genesis)?;
        }
        return Ok(genesis.hash());
    }
    let candidates = store.list_blocks(None, usize::MAX)?;
    candidates
        .into_iter()
        .find(|b| b.height() == 0)
        .map(|b| b.hash())
        .ok_or_else(|| ChainErrorKind::not_found("no genesis block found; pass --genesis on first run"))
}

async fn run(config_path: PathBuf, genesis_path: Option<PathBuf>) -> Result<()> {
    let config = chain_config::NodeConfig::load(&config_path)?;
    chain_logger::init("chain-node", LogFormat::Compact);
    set_panic_hook();

    let store = Arc::new(chain_store::Store::open(&config.db_url)?);
    let genesis_hash = resolve_genesis_hash(&store, &genesis_path)?;
    let pool = Arc::new(chain_pool::Pool::new(store.clone()));
    let reserver: Arc<Reserver<NoCandidates>> = Arc::new(Reserver::with_store(
        NoCandidates,
        Duration::from_secs(config.reserver.persistence_threshold_seconds),
        store.clone(),
    ));
    reserver.restore_persisted_reservations()?;
    let executor = Executor::with_limits(
        store,
        pool,
        genesis_hash,
        config.generator.max_block_txs,
        chain_script_vm::RunLimit::new(chain_script_vm::DEFAULT_RUN_LIMIT),
    );
    let signer = match config.role {
        chain_config::NodeRole::Generator => Some(config.block_key()?),
        chain_config::NodeRole::Follower => None,
    };

    let facade = Arc::new(Facade::new(
        executor,
        reserver,
        NullChangeReceiver,
        NullOutputOwner,
        genesis_hash,
        signer,
    ));

    let basic_auth = config
        .rpc
        .basic_auth_user
        .clone()
        .zip(config.rpc.basic_auth_password.clone());
    let rpc_handler: Arc<dyn chain_rpc::GeneratorRpc> = facade.clone();
    let routes = chain_rpc::routes(rpc_handler, config.blockchain_id.clone(), basic_auth);
    let metrics_route = warp::path("metrics").map(|| {
        chain_metrics::encode_text().unwrap_or_else(|e| format!("error encoding metrics: {}", e))
    });
    let server_routes = routes.or(metrics_route);
    let addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| ChainErrorKind::bad_request(format!("invalid listen_addr {}: {}", config.listen_addr, e)))?;

    info!("chain-node starting"; "role" => format!("{:?}", config.role), "listen_addr" => %addr);
    let server = tokio::spawn(warp::serve(server_routes).run(addr));

    match config.role {
        chain_config::NodeRole::Generator => {
            let period = Duration::from_secs(config.generator.period_seconds);
            tokio::spawn(facade.clone().run_generator_loop(period));
        }
        chain_config::NodeRole::Follower => {
            let peer_url = config.rpc.generator_url.clone().expect("validated by NodeConfig::validate");
            let client = chain_rpc::PeerClient::new(chain_rpc::RpcClientConfig {
                base_url: peer_url,
                basic_auth_user: config.rpc.basic_auth_user.clone(),
                basic_auth_password: config.rpc.basic_auth_password.clone(),
                process_name: "chain-node".to_string(),
                build_tag: env!("CARGO_PKG_VERSION").to_string(),
                blockchain_id: config.blockchain_id.clone(),
                request_timeout: Duration::from_secs(config.rpc.request_timeout_seconds),
                max_retries: config.rpc.max_retries,
            })?;
            let facade = facade.clone();
            let period = Duration::from_secs(config.generator.period_seconds);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let now = now_seconds();
                    if let Err(err) = facade.sync_from_peer(&client, now).await {
                        warn!("follower sync tick failed"; "error" => %err);
                    }
                }
            });
        }
    }

    server.await.map_err(|e| ChainErrorKind::internal(format!("RPC server task failed: {}", e)))?;
    Ok(())
}

/// Provisions a fresh node: opens (creating if absent) the state store,
/// generates a federation keypair if the config does not already carry
/// one, and inserts a genesis block crediting a root account under a
/// trivially-satisfiable control script — using only facade-exposed
/// operations (SPEC_FULL §B "chain-node bootdb", §C "genesis
/// bootstrap").
fn bootdb(config_path: PathBuf) -> Result<()> {
    let mut config = chain_config::NodeConfig::load(&config_path)?;
    let store = chain_store::Store::open(&config.db_url)?;

    let federation_key = match &config.block_key_hex {
        Some(_) => config.block_key()?,
        None => {
            let (private_hex, public_hex) = chain_config::generate_keypair_hex();
            config.block_key_hex = Some(private_hex);
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| ChainErrorKind::internal(format!("serializing config: {}", e)))?;
            std::fs::write(&config_path, rendered)
                .map_err(|e| ChainErrorKind::io(format!("writing config {}: {}", config_path.display(), e)))?;
            println!("generated federation keypair; public key: {}", public_hex);
            config.block_key()?
        }
    };

    let root_control_script = chain_script_vm::opcode::ScriptBuilder::new().push_small_int(1).into_bytes();
    let genesis = chain_facade::build_genesis_block(
        federation_key.public_key().to_bytes(),
        HashValue::sha3_256_of(b"root-account"),
        0,
        root_control_script,
    );

    let store = Arc::new(store);
    let pool = Arc::new(chain_pool::Pool::new(store.clone()));
    let executor = Executor::new(store, pool, genesis.hash());
    let reserver: Arc<Reserver<NoCandidates>> = Arc::new(Reserver::new(NoCandidates));
    let facade = Facade::new(executor, reserver, NullChangeReceiver, NullOutputOwner, genesis.hash(), None);
    facade.upsert_genesis_block(genesis)?;

    println!("opened state store at {}", config.db_url);
    Ok(())
}

fn corectl(config_path: PathBuf, action: CorectlAction) -> Result<()> {
    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| ChainErrorKind::io(format!("reading config {}: {}", config_path.display(), e)))?;
    let mut config: chain_config::NodeConfig = toml::from_str(&contents)
        .map_err(|e| ChainErrorKind::bad_request(format!("invalid config TOML: {}", e)))?;

    match action {
        CorectlAction::SetRole { role } => {
            config.role = match role.to_ascii_lowercase().as_str() {
                "generator" => chain_config::NodeRole::Generator,
                "follower" => chain_config::NodeRole::Follower,
                other => return Err(ChainErrorKind::bad_request(format!("unknown role '{}'", other))),
            };
        }
        CorectlAction::SetBlockchainId { id } => {
            config.blockchain_id = id;
        }
    }

    config.validate()?;
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| ChainErrorKind::internal(format!("serializing config: {}", e)))?;
    std::fs::write(&config_path, rendered)
        .map_err(|e| ChainErrorKind::io(format!("writing config {}: {}", config_path.display(), e)))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { genesis } => run(cli.config, genesis).await,
        Command::Bootdb => bootdb(cli.config),
        Command::Corectl { action } => corectl(cli.config, action),
    };
    if let Err(err) = result {
        eprintln!("chain-node: {}", err);
        std::process::exit(1);
    }
}
