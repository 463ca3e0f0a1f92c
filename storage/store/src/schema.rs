// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Column-family [`Schema`] definitions backing the state store. Every
//! entity named in §3 gets one, keyed and valued through
//! `chain-canonical-serialization` so the on-disk layout matches the
//! same encoding used for hashing and RPC.

use byteorder::{BigEndian, ByteOrder};
use chain_canonical_serialization::{CanonicalDeserialize, CanonicalSerialize};
use chain_crypto::HashValue;
use chain_failure_ext::{ChainErrorKind, Result};
use chain_schemadb::Schema;
use chain_types::{AssetDefinitionPointer, AssetId, Block, Outpoint, Output, Reservation, Transaction};
use std::convert::TryFrom;

fn encode_hash(hash: &HashValue) -> Vec<u8> {
    hash.to_vec()
}

fn decode_hash(bytes: &[u8]) -> Result<HashValue> {
    HashValue::try_from(bytes)
}

fn encode_height(height: u64) -> Vec<u8> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, height);
    buf.to_vec()
}

fn decode_height(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(ChainErrorKind::internal("malformed height key"));
    }
    Ok(BigEndian::read_u64(bytes))
}

/// `hash -> Block`, the immutable block history (§4.1 `InsertBlock`,
/// `GetBlock`).
pub struct BlockSchema;

impl Schema for BlockSchema {
    const COLUMN_FAMILY_NAME: &'static str = "block";
    type Key = HashValue;
    type Value = Block;

    fn encode_key(key: &HashValue) -> Vec<u8> {
        encode_hash(key)
    }
    fn decode_key(bytes: &[u8]) -> Result<HashValue> {
        decode_hash(bytes)
    }
    fn encode_value(value: &Block) -> Vec<u8> {
        value.to_canonical_bytes()
    }
    fn decode_value(bytes: &[u8]) -> Result<Block> {
        Block::from_canonical_bytes(bytes)
    }
}

/// `height -> hash`, supporting `LatestBlock`/`ListBlocks` without
/// scanning the whole block column family.
pub struct BlockHeightIndexSchema;

impl Schema for BlockHeightIndexSchema {
    const COLUMN_FAMILY_NAME: &'static str = "block_height_index";
    type Key = u64;
    type Value = HashValue;

    fn encode_key(key: &u64) -> Vec<u8> {
        encode_height(*key)
    }
    fn decode_key(bytes: &[u8]) -> Result<u64> {
        decode_height(bytes)
    }
    fn encode_value(value: &HashValue) -> Vec<u8> {
        encode_hash(value)
    }
    fn decode_value(bytes: &[u8]) -> Result<HashValue> {
        decode_hash(bytes)
    }
}

/// `height -> ()` (presence only); `LockBlockHeight`'s lock table (§4.1,
/// §6 "a block lock table keyed by height").
pub struct HeightLockSchema;

impl Schema for HeightLockSchema {
    const COLUMN_FAMILY_NAME: &'static str = "height_lock";
    type Key = u64;
    type Value = ();

    fn encode_key(key: &u64) -> Vec<u8> {
        encode_height(*key)
    }
    fn decode_key(bytes: &[u8]) -> Result<u64> {
        decode_height(bytes)
    }
    fn encode_value(_value: &()) -> Vec<u8> {
        Vec::new()
    }
    fn decode_value(_bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// `outpoint -> output`, the confirmed-unspent UTXO set. A row's
/// presence means confirmed-unspent; spending deletes the row (§3
/// "Output" lifecycle, §4.1 `ApplyBlock`).
pub struct ConfirmedOutputSchema;

impl Schema for ConfirmedOutputSchema {
    const COLUMN_FAMILY_NAME: &'static str = "confirmed_output";
    type Key = Outpoint;
    type Value = Output;

    fn encode_key(key: &Outpoint) -> Vec<u8> {
        key.to_canonical_bytes()
    }
    fn decode_key(bytes: &[u8]) -> Result<Outpoint> {
        Outpoint::from_canonical_bytes(bytes)
    }
    fn encode_value(value: &Output) -> Vec<u8> {
        value.to_canonical_bytes()
    }
    fn decode_value(bytes: &[u8]) -> Result<Output> {
        Output::from_canonical_bytes(bytes)
    }
}

/// A pool transaction paired with the monotonically increasing sequence
/// number it was inserted under, used to recover insertion order before
/// the topological pass in [`crate::Store::pool_txs`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PoolEntry {
    pub seq: u64,
    pub tx: Transaction,
}

/// `tx_hash -> (seq, tx)`, the pending pool (§4.1 `PoolTxs`,
/// `AddPoolTx`, `RemovePoolTxs`).
pub struct PoolTxSchema;

impl Schema for PoolTxSchema {
    const COLUMN_FAMILY_NAME: &'static str = "pool_tx";
    type Key = HashValue;
    type Value = PoolEntry;

    fn encode_key(key: &HashValue) -> Vec<u8> {
        encode_hash(key)
    }
    fn decode_key(bytes: &[u8]) -> Result<HashValue> {
        decode_hash(bytes)
    }
    fn encode_value(value: &PoolEntry) -> Vec<u8> {
        let mut buf = encode_height(value.seq);
        buf.extend_from_slice(&value.tx.to_canonical_bytes());
        buf
    }
    fn decode_value(bytes: &[u8]) -> Result<PoolEntry> {
        if bytes.len() < 8 {
            return Err(ChainErrorKind::internal("malformed pool entry"));
        }
        let seq = decode_height(&bytes[..8])?;
        let tx = Transaction::from_canonical_bytes(&bytes[8..])?;
        Ok(PoolEntry { seq, tx })
    }
}

/// `definition_hash -> definition blob`, keyed by content hash so
/// republishing the identical definition is naturally idempotent (§4.1
/// `InsertAssetDefinitions`).
pub struct AssetDefinitionSchema;

impl Schema for AssetDefinitionSchema {
    const COLUMN_FAMILY_NAME: &'static str = "asset_definition";
    type Key = HashValue;
    type Value = Vec<u8>;

    fn encode_key(key: &HashValue) -> Vec<u8> {
        encode_hash(key)
    }
    fn decode_key(bytes: &[u8]) -> Result<HashValue> {
        decode_hash(bytes)
    }
    fn encode_value(value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }
    fn decode_value(bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// `asset_id -> ADP`, the latest asset-definition pointer per asset
/// (§3 "Asset Definition Pointer (ADP)").
pub struct AssetDefinitionPointerSchema;

impl Schema for AssetDefinitionPointerSchema {
    const COLUMN_FAMILY_NAME: &'static str = "asset_definition_pointer";
    type Key = AssetId;
    type Value = AssetDefinitionPointer;

    fn encode_key(key: &AssetId) -> Vec<u8> {
        encode_hash(key)
    }
    fn decode_key(bytes: &[u8]) -> Result<AssetId> {
        decode_hash(bytes)
    }
    fn encode_value(value: &AssetDefinitionPointer) -> Vec<u8> {
        value.to_canonical_bytes()
    }
    fn decode_value(bytes: &[u8]) -> Result<AssetDefinitionPointer> {
        AssetDefinitionPointer::from_canonical_bytes(bytes)
    }
}

/// `outpoint -> reservation`, the subset of live reservations whose TTL
/// exceeds the configured persistence threshold, so a process restart
/// does not silently release them (§3 "Reservation", §4.5
/// "Persistence").
pub struct ReservationSchema;

impl Schema for ReservationSchema {
    const COLUMN_FAMILY_NAME: &'static str = "reservation";
    type Key = Outpoint;
    type Value = Reservation;

    fn encode_key(key: &Outpoint) -> Vec<u8> {
        key.to_canonical_bytes()
    }
    fn decode_key(bytes: &[u8]) -> Result<Outpoint> {
        Outpoint::from_canonical_bytes(bytes)
    }
    fn encode_value(value: &Reservation) -> Vec<u8> {
        value.to_canonical_bytes()
    }
    fn decode_value(bytes: &[u8]) -> Result<Reservation> {
        Reservation::from_canonical_bytes(bytes)
    }
}

pub const ALL_COLUMN_FAMILIES: &[&str] = &[
    BlockSchema::COLUMN_FAMILY_NAME,
    BlockHeightIndexSchema::COLUMN_FAMILY_NAME,
    HeightLockSchema::COLUMN_FAMILY_NAME,
    ConfirmedOutputSchema::COLUMN_FAMILY_NAME,
    PoolTxSchema::COLUMN_FAMILY_NAME,
    AssetDefinitionSchema::COLUMN_FAMILY_NAME,
    AssetDefinitionPointerSchema::COLUMN_FAMILY_NAME,
    ReservationSchema::COLUMN_FAMILY_NAME,
];
