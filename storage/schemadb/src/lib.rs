// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! A thin, typed layer over RocksDB column families (§4.1 "State
//! Store"). Each entity in the data model (blocks, confirmed outputs,
//! pool outputs, asset definitions, ADPs, height locks) gets its own
//! [`Schema`] and column family; [`SchemaBatch`] groups writes across
//! column families into one atomic `WriteBatch` so multi-row mutations
//! commit or roll back as a unit, as required by §4.1's "atomic
//! multi-statement transactions."

use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use lazy_static::lazy_static;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("schemadb");
}

/// A typed column family: a stable name plus the byte encoding for its
/// keys and values. Implementors live in `chain-store`, one per entity.
pub trait Schema {
    const COLUMN_FAMILY_NAME: &'static str;

    type Key;
    type Value;

    fn encode_key(key: &Self::Key) -> Vec<u8>;
    fn decode_key(bytes: &[u8]) -> Result<Self::Key>;
    fn encode_value(value: &Self::Value) -> Vec<u8>;
    fn decode_value(bytes: &[u8]) -> Result<Self::Value>;
}

/// Opens (creating if absent) a RocksDB instance with one column family
/// per name in `column_families`.
pub struct SchemaDB {
    db: DB,
}

impl SchemaDB {
    pub fn open(path: impl AsRef<Path>, column_families: &[&str]) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors: Vec<ColumnFamilyDescriptor> = column_families
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)
            .map_err(|e| ChainErrorKind::io(format!("failed to open state store: {}", e)))?;
        info!("opened state store with {} column families", column_families.len());
        Ok(SchemaDB { db })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainErrorKind::internal(format!("unknown column family: {}", name)))
    }

    pub fn get<S: Schema>(&self, key: &S::Key) -> Result<Option<S::Value>> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        OP_COUNTERS.inc("get", &[S::COLUMN_FAMILY_NAME]);
        let raw = self
            .db
            .get_cf(cf, S::encode_key(key))
            .map_err(|e| ChainErrorKind::io(format!("get failed: {}", e)))?;
        raw.map(|bytes| S::decode_value(&bytes)).transpose()
    }

    pub fn put<S: Schema>(&self, key: &S::Key, value: &S::Value) -> Result<()> {
        let mut batch = SchemaBatch::new();
        batch.put_in::<S>(self, key, value)?;
        self.write(batch)
    }

    /// Iterates every entry in `S`'s column family in key order. Used
    /// for `ListBlocks`-style cursor pagination in `chain-store`.
    pub fn iter<S: Schema>(&self) -> Result<Vec<(S::Key, S::Value)>> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key_bytes, value_bytes) =
                item.map_err(|e| ChainErrorKind::io(format!("iteration failed: {}", e)))?;
            out.push((S::decode_key(&key_bytes)?, S::decode_value(&value_bytes)?));
        }
        Ok(out)
    }

    /// Commits every put/delete accumulated in `batch` as a single
    /// atomic RocksDB write.
    pub fn write(&self, batch: SchemaBatch) -> Result<()> {
        let count = batch.inner.len();
        self.db
            .write(batch.inner)
            .map_err(|e| ChainErrorKind::io(format!("atomic write failed: {}", e)))?;
        OP_COUNTERS.observe("write_batch_rows", &[], count as f64);
        Ok(())
    }
}

/// Accumulates puts/deletes across one or more [`Schema`]s for a single
/// atomic commit via [`SchemaDB::write`]. This is the primitive §4.1
/// calls "bind a context to an open atomic transaction."
pub struct SchemaBatch {
    inner: rocksdb::WriteBatch,
}

impl Default for SchemaBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBatch {
    pub fn new() -> Self {
        SchemaBatch {
            inner: rocksdb::WriteBatch::default(),
        }
    }

    /// Adds a put against a specific, already-open `db`'s column family.
    /// `SchemaDB::put` uses this internally; batches spanning multiple
    /// schemas call it once per schema before a single [`SchemaDB::write`].
    pub fn put_in<S: Schema>(&mut self, db: &SchemaDB, key: &S::Key, value: &S::Value) -> Result<()> {
        let cf = db.cf_handle(S::COLUMN_FAMILY_NAME)?;
        self.inner.put_cf(cf, S::encode_key(key), S::encode_value(value));
        Ok(())
    }

    pub fn delete_in<S: Schema>(&mut self, db: &SchemaDB, key: &S::Key) -> Result<()> {
        let cf = db.cf_handle(S::COLUMN_FAMILY_NAME)?;
        self.inner.delete_cf(cf, S::encode_key(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use tempfile::tempdir;

    struct TestSchema;

    impl Schema for TestSchema {
        const COLUMN_FAMILY_NAME: &'static str = "test";
        type Key = u64;
        type Value = String;

        fn encode_key(key: &u64) -> Vec<u8> {
            key.to_be_bytes().to_vec()
        }

        fn decode_key(bytes: &[u8]) -> Result<u64> {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| ChainErrorKind::internal("bad key"))?;
            Ok(u64::from_be_bytes(arr))
        }

        fn encode_value(value: &String) -> Vec<u8> {
            value.as_bytes().to_vec()
        }

        fn decode_value(bytes: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(bytes).to_string())
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let db = SchemaDB::open(dir.path(), &["test"]).unwrap();
        db.put::<TestSchema>(&1, &"alpha".to_string()).unwrap();
        assert_eq!(db.get::<TestSchema>(&1).unwrap(), Some("alpha".to_string()));
        assert_eq!(db.get::<TestSchema>(&2).unwrap(), None);
    }

    #[test]
    fn batch_commits_atomically_across_keys() {
        let dir = tempdir().unwrap();
        let db = SchemaDB::open(dir.path(), &["test"]).unwrap();
        let mut batch = SchemaBatch::new();
        batch.put_in::<TestSchema>(&db, &1, &"a".to_string()).unwrap();
        batch.put_in::<TestSchema>(&db, &2, &"b".to_string()).unwrap();
        db.write(batch).unwrap();
        assert_eq!(db.get::<TestSchema>(&1).unwrap(), Some("a".to_string()));
        assert_eq!(db.get::<TestSchema>(&2).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn iter_returns_all_rows_in_key_order() {
        let dir = tempdir().unwrap();
        let db = SchemaDB::open(dir.path(), &["test"]).unwrap();
        db.put::<TestSchema>(&2, &"b".to_string()).unwrap();
        db.put::<TestSchema>(&1, &"a".to_string()).unwrap();
        let rows = db.iter::<TestSchema>().unwrap();
        assert_eq!(rows, vec![(1, "a".to_string()), (2, "b".to_string())]);
    }
}
