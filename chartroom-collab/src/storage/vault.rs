//! RocksDB-backed document vault.
//!
//! Column families:
//! - `snapshots` — full document state per doc (LZ4 compressed)
//! - `ops`       — update tail since the last snapshot (LZ4, keyed by
//!   `doc_id:seq`)
//! - `meta`      — per-document metadata
//!
//! The vault is the durability collaborator behind [`SnapshotStore`]: the
//! engine fetches a snapshot on open, appends each accepted update to the
//! op tail, and periodically folds the tail into a fresh snapshot.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::identity::epoch_secs;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS, CF_META];

/// Vault configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false, batched instead)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chartroom_docs"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl VaultConfig {
    /// Small caches for tests against a temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: Uuid,
    /// Highest op sequence persisted for the document.
    pub op_seq: u64,
    /// Ops currently in the persisted tail.
    pub op_count: u64,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes.
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMeta {
    fn new(doc_id: Uuid) -> Self {
        let now = epoch_secs();
        Self {
            doc_id,
            op_seq: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(Uuid),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durability boundary for the document engine. All other replication is
/// peer to peer over the bus.
pub trait SnapshotStore: Send + Sync {
    /// Full state of a document, or `None` when it has never been flushed.
    fn fetch_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;
    /// Replace the stored snapshot atomically.
    fn store_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError>;
    /// Append one update to the document's persisted tail.
    fn store_op(&self, doc_id: Uuid, seq: u64, op: &[u8]) -> Result<(), StoreError>;
    /// Tail ops with sequence strictly greater than `after_seq`, in order.
    fn load_ops_since(&self, doc_id: Uuid, after_seq: u64)
        -> Result<Vec<(u64, Vec<u8>)>, StoreError>;
    /// Drop tail ops up to and including `through_seq` once a snapshot
    /// covers them. Returns how many were removed.
    fn compact_ops(&self, doc_id: Uuid, through_seq: u64) -> Result<u64, StoreError>;
    /// Every document the store knows about, for startup recovery.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// RocksDB-backed [`SnapshotStore`].
pub struct DocumentVault {
    /// Single-threaded mode; concurrency is handled above via tokio.
    db: DBWithThreadMode<SingleThreaded>,
    config: VaultConfig,
}

impl DocumentVault {
    /// Open the vault, creating the database and column families as
    /// needed.
    pub fn open(config: VaultConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(available_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &VaultConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, infrequent updates, point lookups only.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                // Many small writes, prefix-scanned by doc id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    /// Key format: `<doc_id:16><seq:8 big-endian>` so a doc's ops sort
    /// together in sequence order.
    fn op_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub fn load_meta(&self, doc_id: Uuid) -> Result<DocumentMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMeta::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl SnapshotStore for DocumentVault {
    fn fetch_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn store_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_meta(doc_id)
            .unwrap_or_else(|_| DocumentMeta::new(doc_id));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = epoch_secs();

        // Snapshot and metadata land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, doc_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn store_op(&self, doc_id: Uuid, seq: u64, op: &[u8]) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(op);

        let mut meta = self
            .load_meta(doc_id)
            .unwrap_or_else(|_| DocumentMeta::new(doc_id));
        meta.op_seq = seq;
        meta.op_count += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, Self::op_key(doc_id, seq), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_ops_since(
        &self,
        doc_id: Uuid,
        after_seq: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let start_key = Self::op_key(doc_id, after_seq.saturating_add(1));

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            // Stop once past this document's key prefix.
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[16..24]);
            let seq = u64::from_be_bytes(seq_buf);

            let op = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            ops.push((seq, op));
        }
        Ok(ops)
    }

    fn compact_ops(&self, doc_id: Uuid, through_seq: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let start_key = Self::op_key(doc_id, 0);
        let end_key = Self::op_key(doc_id, through_seq.saturating_add(1));

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(cf, &key);
            removed += 1;
        }

        if removed > 0 {
            let cf_meta = self.cf(CF_META)?;
            let mut meta = self
                .load_meta(doc_id)
                .unwrap_or_else(|_| DocumentMeta::new(doc_id));
            meta.op_count = meta.op_count.saturating_sub(removed);
            meta.updated_at = epoch_secs();
            batch.put_cf(cf_meta, doc_id.as_bytes(), &meta.encode()?);
            self.db.write(batch)?;
        }
        Ok(removed)
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut doc_ids = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Deserialization("invalid doc key".into()))?,
                );
                doc_ids.push(id);
            }
        }
        Ok(doc_ids)
    }
}

fn available_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_vault(dir: &tempfile::TempDir) -> DocumentVault {
        DocumentVault::open(VaultConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_fetch_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        assert!(vault.fetch_snapshot(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_id = Uuid::new_v4();

        let snapshot = b"progress note: patient stable overnight, vitals within range.";
        vault.store_snapshot(doc_id, snapshot).unwrap();

        let loaded = vault.fetch_snapshot(doc_id).unwrap().unwrap();
        assert_eq!(loaded, snapshot);

        let meta = vault.load_meta(doc_id).unwrap();
        assert_eq!(meta.snapshot_size, snapshot.len() as u64);
        assert!(meta.compressed_size > 0);
    }

    #[test]
    fn test_snapshot_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_id = Uuid::new_v4();

        vault.store_snapshot(doc_id, b"first").unwrap();
        vault.store_snapshot(doc_id, b"second").unwrap();
        assert_eq!(vault.fetch_snapshot(doc_id).unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_ops_tail_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_id = Uuid::new_v4();

        for seq in 1..=5u64 {
            vault
                .store_op(doc_id, seq, format!("op_{seq}").as_bytes())
                .unwrap();
        }

        let all = vault.load_ops_since(doc_id, 0).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0], (1, b"op_1".to_vec()));
        assert_eq!(all[4], (5, b"op_5".to_vec()));

        let later = vault.load_ops_since(doc_id, 3).unwrap();
        assert_eq!(later.len(), 2);
        assert_eq!(later[0].0, 4);
    }

    #[test]
    fn test_ops_isolated_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        vault.store_op(doc_a, 1, b"a1").unwrap();
        vault.store_op(doc_b, 1, b"b1").unwrap();
        vault.store_op(doc_a, 2, b"a2").unwrap();

        let a_ops = vault.load_ops_since(doc_a, 0).unwrap();
        assert_eq!(a_ops.len(), 2);
        assert!(a_ops.iter().all(|(_, op)| op.starts_with(b"a")));
    }

    #[test]
    fn test_compact_ops() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_id = Uuid::new_v4();

        for seq in 1..=10u64 {
            vault.store_op(doc_id, seq, b"edit").unwrap();
        }
        let removed = vault.compact_ops(doc_id, 7).unwrap();
        assert_eq!(removed, 7);

        let remaining = vault.load_ops_since(doc_id, 0).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].0, 8);
        assert_eq!(vault.load_meta(doc_id).unwrap().op_count, 3);
    }

    #[test]
    fn test_list_documents() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        vault.store_snapshot(doc_a, b"a").unwrap();
        vault.store_op(doc_b, 1, b"b").unwrap();

        let docs = vault.list_documents().unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.contains(&doc_a));
        assert!(docs.contains(&doc_b));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = Uuid::new_v4();
        let path = dir.path().join("db");

        {
            let vault = DocumentVault::open(VaultConfig::for_testing(&path)).unwrap();
            vault.store_snapshot(doc_id, b"persisted across reopen").unwrap();
            vault.store_op(doc_id, 1, b"tail op").unwrap();
        }

        let vault = DocumentVault::open(VaultConfig::for_testing(&path)).unwrap();
        assert_eq!(
            vault.fetch_snapshot(doc_id).unwrap().unwrap(),
            b"persisted across reopen"
        );
        assert_eq!(vault.load_ops_since(doc_id, 0).unwrap().len(), 1);
    }
}
