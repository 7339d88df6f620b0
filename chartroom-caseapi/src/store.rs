//! Version-stamped case store.
//!
//! Structured case fields take the opposite tradeoff from the document
//! engine: no merge, just optimistic version stamping. Every accepted
//! update increments the aggregate version exactly once; a writer holding
//! a stale version gets the current authoritative state back and a human
//! decides what to do with it. Concurrent structured edits are rare and
//! should surface, not auto-merge.
//!
//! Each case has a single-writer async mutex, so compare-and-increment is
//! race-free within the process; the aggregate row itself lands in one
//! atomic RocksDB write.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

const CF_CASES: &str = "cases";

/// The structured part of a case record: named sections of JSON, guarded
/// by one monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseAggregate {
    pub case_id: String,
    /// Incremented exactly once per accepted update.
    pub version: u64,
    pub sections: BTreeMap<String, serde_json::Value>,
    /// Seconds since the Unix epoch of the last accepted update.
    pub updated_at: u64,
}

impl CaseAggregate {
    fn new(case_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            version: 0,
            sections: BTreeMap::new(),
            updated_at: epoch_secs(),
        }
    }
}

/// Store failures and rejections.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("case {0} not found")]
    NotFound(String),
    /// The caller's known version is stale. Carries the current
    /// authoritative state so the caller can reconcile.
    #[error("version conflict: authoritative version is {}", current.version)]
    VersionConflict { current: Box<CaseAggregate> },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for UpdateError {
    fn from(e: rocksdb::Error) -> Self {
        UpdateError::Storage(e.to_string())
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct CaseStoreConfig {
    pub path: PathBuf,
    pub block_cache_size: usize,
    pub write_buffer_size: usize,
    pub max_open_files: i32,
}

impl Default for CaseStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chartroom_cases"),
            block_cache_size: 64 * 1024 * 1024,
            write_buffer_size: 16 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

impl CaseStoreConfig {
    /// Small caches for tests against a temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            write_buffer_size: 2 * 1024 * 1024,
            max_open_files: 64,
        }
    }
}

/// RocksDB-backed case store with per-case single-writer locking.
pub struct CaseStore {
    db: DBWithThreadMode<SingleThreaded>,
    /// One writer at a time per case; reads go straight to the db.
    case_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl CaseStore {
    pub fn open(config: CaseStoreConfig) -> Result<Self, UpdateError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::Lz4);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_CASES, cf_opts)],
        )?;
        Ok(Self {
            db,
            case_locks: RwLock::new(HashMap::new()),
        })
    }

    /// Apply a patch to one section, gated on the caller's known version.
    ///
    /// - known version matches: the section is replaced and the version
    ///   increments, both in one atomic write.
    /// - known version is stale: `VersionConflict` carrying the current
    ///   authoritative aggregate; nothing is applied.
    /// - unknown case with `known_version == 0`: created at version 1
    ///   (first writer wins; a concurrent creator conflicts like any
    ///   other stale writer).
    /// - unknown case with a nonzero version: `NotFound`.
    pub async fn update(
        &self,
        case_id: &str,
        section: &str,
        patch: serde_json::Value,
        known_version: u64,
    ) -> Result<CaseAggregate, UpdateError> {
        let lock = self.lock_for(case_id).await;
        let _guard = lock.lock().await;

        let mut aggregate = match self.load(case_id)? {
            Some(current) => {
                if current.version != known_version {
                    return Err(UpdateError::VersionConflict {
                        current: Box::new(current),
                    });
                }
                current
            }
            None if known_version == 0 => CaseAggregate::new(case_id),
            None => return Err(UpdateError::NotFound(case_id.to_string())),
        };

        aggregate.sections.insert(section.to_string(), patch);
        aggregate.version += 1;
        aggregate.updated_at = epoch_secs();
        self.persist(&aggregate)?;
        Ok(aggregate)
    }

    /// Current authoritative state of a case.
    pub fn get(&self, case_id: &str) -> Result<CaseAggregate, UpdateError> {
        self.load(case_id)?
            .ok_or_else(|| UpdateError::NotFound(case_id.to_string()))
    }

    fn load(&self, case_id: &str) -> Result<Option<CaseAggregate>, UpdateError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, case_id.as_bytes())? {
            Some(bytes) => {
                let aggregate = serde_json::from_slice(&bytes)
                    .map_err(|e| UpdateError::Serialization(e.to_string()))?;
                Ok(Some(aggregate))
            }
            None => Ok(None),
        }
    }

    fn persist(&self, aggregate: &CaseAggregate) -> Result<(), UpdateError> {
        let cf = self.cf()?;
        let bytes = serde_json::to_vec(aggregate)
            .map_err(|e| UpdateError::Serialization(e.to_string()))?;
        self.db.put_cf(cf, aggregate.case_id.as_bytes(), bytes)?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, UpdateError> {
        self.db
            .cf_handle(CF_CASES)
            .ok_or_else(|| UpdateError::Storage(format!("missing column family {CF_CASES}")))
    }

    async fn lock_for(&self, case_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.case_locks.read().await;
            if let Some(lock) = locks.get(case_id) {
                return lock.clone();
            }
        }
        let mut locks = self.case_locks.write().await;
        // Double-check after acquiring the write lock.
        if let Some(lock) = locks.get(case_id) {
            return lock.clone();
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(case_id.to_string(), lock.clone());
        lock
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store(dir: &tempfile::TempDir) -> CaseStore {
        CaseStore::open(CaseStoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[tokio::test]
    async fn test_create_at_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let agg = store
            .update("case-42", "status", json!("admitted"), 0)
            .await
            .unwrap();
        assert_eq!(agg.version, 1);
        assert_eq!(agg.sections["status"], json!("admitted"));
    }

    #[tokio::test]
    async fn test_update_increments_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.update("case-42", "status", json!("admitted"), 0).await.unwrap();
        let agg = store
            .update("case-42", "priority", json!("high"), 1)
            .await
            .unwrap();
        assert_eq!(agg.version, 2);
        assert_eq!(agg.sections.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_with_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.update("case-42", "status", json!("admitted"), 0).await.unwrap();
        store.update("case-42", "status", json!("discharged"), 1).await.unwrap();

        let err = store
            .update("case-42", "status", json!("transferred"), 1)
            .await
            .unwrap_err();
        match err {
            UpdateError::VersionConflict { current } => {
                assert_eq!(current.version, 2);
                // The rejected patch was not applied.
                assert_eq!(current.sections["status"], json!("discharged"));
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.update("case-42", "status", json!("a"), 0).await.unwrap();
        store.update("case-42", "status", json!("b"), 1).await.unwrap();

        // Retrying with the same stale version never sneaks through.
        for _ in 0..2 {
            assert!(matches!(
                store.update("case-42", "status", json!("c"), 1).await,
                Err(UpdateError::VersionConflict { .. })
            ));
        }
        assert_eq!(store.get("case-42").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_current_then_stale_succeeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.update("case-42", "plan", json!("v1"), 0).await.unwrap();

        let ok = store.update("case-42", "plan", json!("v2"), 1).await.unwrap();
        assert_eq!(ok.version, 2);
        assert!(matches!(
            store.update("case-42", "plan", json!("v3"), 1).await,
            Err(UpdateError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_same_version_exactly_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));
        // Seed to version 3.
        store.update("case-42", "s", json!(1), 0).await.unwrap();
        store.update("case-42", "s", json!(2), 1).await.unwrap();
        store.update("case-42", "s", json!(3), 2).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update("case-42", "treatmentPlan", json!({"drug": "metformin"}), 3)
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .update("case-42", "treatmentPlan", json!({"drug": "insulin"}), 3)
                    .await
            })
        };

        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one concurrent writer must win");

        let loser = if ra.is_err() { ra } else { rb };
        match loser.unwrap_err() {
            UpdateError::VersionConflict { current } => assert_eq!(current.version, 4),
            other => panic!("expected VersionConflict, got {other:?}"),
        }
        assert_eq!(store.get("case-42").unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_unknown_case_nonzero_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.update("case-404", "status", json!("x"), 5).await,
            Err(UpdateError::NotFound(_))
        ));
        assert!(matches!(store.get("case-404"), Err(UpdateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_create_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.update("case-9", "s", json!("a"), 0).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.update("case-9", "s", json!("b"), 0).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!([&ra, &rb].iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.get("case-9").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_reopen_preserves_cases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = CaseStore::open(CaseStoreConfig::for_testing(&path)).unwrap();
            store.update("case-42", "status", json!("admitted"), 0).await.unwrap();
        }
        let store = CaseStore::open(CaseStoreConfig::for_testing(&path)).unwrap();
        let agg = store.get("case-42").unwrap();
        assert_eq!(agg.version, 1);
        assert_eq!(agg.sections["status"], json!("admitted"));
    }
}
