// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node configuration: a [`NodeConfig`] loaded from a TOML file with
//! environment overrides, validated at startup, and handed by value to
//! every component constructor rather than read from globals (§6 "CLI
//! surface", §9 "No persistent graph cycles").

use chain_crypto::PrivateKey;
use chain_failure_ext::{ChainErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::path::Path;

/// Whether this node runs the block-generation cadence or only follows
/// the generator via RPC (§4.7, §6 `corectl set-role`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Generator,
    Follower,
}

/// The period on which the generator node runs `GenerateBlock -> sign ->
/// AddBlock` (§4.7 "Generator loop").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockGeneratorConfig {
    pub period_seconds: u64,
    pub max_block_txs: usize,
}

impl Default for BlockGeneratorConfig {
    fn default() -> Self {
        BlockGeneratorConfig {
            period_seconds: 1,
            max_block_txs: 10_000,
        }
    }
}

/// `Reserve`'s default TTL and the threshold above which a reservation
/// is persisted to the store rather than kept only in memory (§3
/// "Reservation", §4.5 "Persistence", SPEC_FULL §C).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReserverConfig {
    pub default_ttl_seconds: u64,
    pub persistence_threshold_seconds: u64,
}

impl Default for ReserverConfig {
    fn default() -> Self {
        ReserverConfig {
            default_ttl_seconds: 300,
            persistence_threshold_seconds: chain_types::DEFAULT_PERSISTENCE_THRESHOLD.as_secs(),
        }
    }
}

/// On a follower node, the peer this node pulls blocks from (§6 "Peer
/// RPC").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    pub generator_url: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            generator_url: None,
            basic_auth_user: None,
            basic_auth_password: None,
            request_timeout_seconds: 10,
            max_retries: 3,
        }
    }
}

/// The node's full, validated configuration, loaded once at startup and
/// passed by value into every component constructor (§9 "Ambient
/// database transactions", "No persistent graph cycles").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub blockchain_id: String,
    /// Connection string for the state store (`DB_URL`).
    pub db_url: String,
    /// Hex-encoded federation signing key, present only on generator
    /// nodes (`BLOCK_KEY`).
    pub block_key_hex: Option<String>,
    pub generator: BlockGeneratorConfig,
    pub reserver: ReserverConfig,
    pub rpc: RpcConfig,
    /// Address `chain-node run` binds its own peer RPC server to (§6
    /// "CLI surface").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            role: NodeRole::Follower,
            blockchain_id: String::new(),
            db_url: "chain-data".to_string(),
            block_key_hex: None,
            generator: BlockGeneratorConfig::default(),
            reserver: ReserverConfig::default(),
            rpc: RpcConfig::default(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl NodeConfig {
    /// Loads a TOML file from `path`, then applies the environment
    /// overrides named in §6: `DB_URL`, `BLOCK_KEY`, `GENERATOR_URL`,
    /// `NODE_ROLE`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ChainErrorKind::io(format!("reading config {}: {}", path.as_ref().display(), e))
        })?;
        let mut config: NodeConfig = toml::from_str(&contents)
            .map_err(|e| ChainErrorKind::bad_request(format!("invalid config TOML: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_url) = std::env::var("DB_URL") {
            self.db_url = db_url;
        }
        if let Ok(block_key) = std::env::var("BLOCK_KEY") {
            self.block_key_hex = Some(block_key);
        }
        if let Ok(generator_url) = std::env::var("GENERATOR_URL") {
            self.rpc.generator_url = Some(generator_url);
        }
        if let Ok(role) = std::env::var("NODE_ROLE") {
            if let Some(parsed) = parse_role(&role) {
                self.role = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.blockchain_id.is_empty() {
            return Err(ChainErrorKind::bad_request("blockchain_id must not be empty"));
        }
        match self.role {
            NodeRole::Generator if self.block_key_hex.is_none() => {
                return Err(ChainErrorKind::bad_request(
                    "generator nodes require BLOCK_KEY / block_key_hex",
                ));
            }
            NodeRole::Follower if self.rpc.generator_url.is_none() => {
                return Err(ChainErrorKind::bad_request(
                    "follower nodes require GENERATOR_URL / rpc.generator_url",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Decodes [`Self::block_key_hex`] into a signing key, for generator
    /// nodes only.
    pub fn block_key(&self) -> Result<PrivateKey> {
        let hex_str = self
            .block_key_hex
            .as_ref()
            .ok_or_else(|| ChainErrorKind::bad_request("no BLOCK_KEY configured"))?;
        let bytes = hex::decode(hex_str)
            .map_err(|e| ChainErrorKind::bad_request(format!("BLOCK_KEY is not valid hex: {}", e)))?;
        PrivateKey::try_from(bytes.as_slice())
    }
}

fn parse_role(s: &str) -> Option<NodeRole> {
    match s.to_ascii_lowercase().as_str() {
        "generator" => Some(NodeRole::Generator),
        "follower" | "non-generator" | "non_generator" => Some(NodeRole::Follower),
        _ => None,
    }
}

/// Generates a fresh Ed25519 keypair and returns its hex encoding,
/// standing in for the out-of-scope `bootdb`/`generate-keypair` tools
/// (§6, SPEC_FULL §B "Configuration"). The node's own CLI (`chain-node
/// bootdb`) calls this rather than shelling out to a separate binary.
pub fn generate_keypair_hex() -> (String, String) {
    let private_key = PrivateKey::generate();
    let public_key = private_key.public_key();
    (hex::encode(private_key.to_bytes()), hex::encode(public_key.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> String {
        r#"
            role = "follower"
            blockchain_id = "test-net"
            db_url = "chain-data"

            [generator]
            period_seconds = 1
            max_block_txs = 10000

            [reserver]
            default_ttl_seconds = 300
            persistence_threshold_seconds = 120

            [rpc]
            generator_url = "http://generator.local"
            request_timeout_seconds = 10
            max_retries = 3
        "#
        .to_string()
    }

    #[test]
    fn loads_and_validates_a_well_formed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", sample_toml()).unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.role, NodeRole::Follower);
        assert_eq!(config.blockchain_id, "test-net");
    }

    #[test]
    fn generator_role_without_block_key_fails_validation() {
        let config = NodeConfig {
            role: NodeRole::Generator,
            blockchain_id: "test-net".to_string(),
            block_key_hex: None,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_wins_over_file_value() {
        std::env::set_var("DB_URL", "overridden-db");
        let mut config = NodeConfig {
            blockchain_id: "test-net".to_string(),
            rpc: RpcConfig {
                generator_url: Some("http://x".to_string()),
                ..RpcConfig::default()
            },
            ..NodeConfig::default()
        };
        config.apply_env_overrides();
        assert_eq!(config.db_url, "overridden-db");
        std::env::remove_var("DB_URL");
    }

    #[test]
    fn generate_keypair_hex_round_trips_through_private_key() {
        let (private_hex, _public_hex) = generate_keypair_hex();
        let bytes = hex::decode(private_hex).unwrap();
        assert!(PrivateKey::try_from(bytes.as_slice()).is_ok());
    }
}
