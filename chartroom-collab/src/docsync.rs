//! CRDT document synchronization engine.
//!
//! One replica per collaboratively-edited document. Local edits apply
//! immediately (optimistic, no round trip), are encoded as a state-vector
//! diff, and travel to peer instances on the document's bus channel.
//! Remote updates merge commutatively, so every replica that has seen the
//! same set of updates materializes identical content regardless of
//! arrival order; per-site logical clocks ride inside the update encoding
//! and nothing here depends on bus ordering.
//!
//! ```text
//! local edit                    remote update (bus)
//!     │                               │
//!     ▼                               ▼
//! apply to replica ──► diff ──► merge into replica
//!     │                               │
//!     ├── op tail (OpBatchLog) ◄──────┤
//!     │        │ threshold
//!     │        ▼
//!     │   fold into snapshot ──► SnapshotStore
//!     ▼
//! publish on doc:{id}
//! ```
//!
//! Persistence is best-effort and never blocks editing: a failed flush is
//! logged and retried at the next compaction point, and already-applied
//! edits stay live in memory either way.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, Text, Transact};

use crate::bus::FanoutBus;
use crate::protocol::{doc_channel, BusEnvelope, BusFrame};
use crate::storage::{OpBatchLog, SnapshotStore, StoreError};

/// Name of the shared text root inside every case document.
pub const TEXT_ROOT: &str = "body";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pending ops before the tail is folded into a snapshot.
    pub compaction_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 100,
        }
    }
}

/// Engine errors.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Update or state-vector bytes the CRDT library refused.
    Codec(String),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Codec(e) => write!(f, "Codec error: {e}"),
            EngineError::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

struct DocReplica {
    doc: yrs::Doc,
    log: OpBatchLog,
}

/// The document synchronization engine for one gateway instance.
pub struct DocumentEngine {
    instance_id: Uuid,
    config: EngineConfig,
    docs: RwLock<HashMap<Uuid, Arc<Mutex<DocReplica>>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    bus: Arc<FanoutBus>,
}

impl DocumentEngine {
    pub fn new(
        instance_id: Uuid,
        bus: Arc<FanoutBus>,
        store: Option<Arc<dyn SnapshotStore>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            instance_id,
            config,
            docs: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    /// Get or create the replica for a document, restoring persisted state
    /// on first open: snapshot, then the op tail the last snapshot missed.
    async fn replica(&self, doc_id: Uuid) -> Result<Arc<Mutex<DocReplica>>, EngineError> {
        {
            let docs = self.docs.read().await;
            if let Some(replica) = docs.get(&doc_id) {
                return Ok(replica.clone());
            }
        }
        let mut docs = self.docs.write().await;
        // Double-check after acquiring the write lock.
        if let Some(replica) = docs.get(&doc_id) {
            return Ok(replica.clone());
        }

        let doc = yrs::Doc::new();
        let mut log = OpBatchLog::new(doc_id, self.config.compaction_threshold);

        if let Some(store) = &self.store {
            if let Some(snapshot) = store.fetch_snapshot(doc_id)? {
                let update = yrs::Update::decode_v1(&snapshot)
                    .map_err(|e| EngineError::Codec(e.to_string()))?;
                let mut txn = doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| EngineError::Codec(e.to_string()))?;
            }
            let ops = store.load_ops_since(doc_id, 0)?;
            let mut last_seq = 0u64;
            for (seq, op) in ops {
                if let Ok(update) = yrs::Update::decode_v1(&op) {
                    let mut txn = doc.transact_mut();
                    let _ = txn.apply_update(update);
                }
                last_seq = seq;
            }
            // The restored tail is already durable; continue its sequence.
            log.restore(last_seq, Vec::new());
        }

        let replica = Arc::new(Mutex::new(DocReplica { doc, log }));
        docs.insert(doc_id, replica.clone());
        Ok(replica)
    }

    /// Ensure a document is loaded.
    pub async fn open(&self, doc_id: Uuid) -> Result<(), EngineError> {
        self.replica(doc_id).await.map(|_| ())
    }

    /// Apply an edit originated on this site, returning the encoded update
    /// that peers need to converge.
    pub async fn apply_local_edit<F>(
        &self,
        room_id: &str,
        doc_id: Uuid,
        edit: F,
    ) -> Result<Vec<u8>, EngineError>
    where
        F: FnOnce(&mut yrs::TransactionMut),
    {
        let replica = self.replica(doc_id).await?;
        let mut rep = replica.lock().await;

        let before = {
            let txn = rep.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = rep.doc.transact_mut();
            edit(&mut txn);
        }
        let update = {
            let txn = rep.doc.transact();
            txn.encode_diff_v1(&before)
        };
        self.record_and_publish(&mut rep, room_id, doc_id, &update, None);
        Ok(update)
    }

    /// Insert text into the shared body at a character offset.
    pub async fn insert_text(
        &self,
        room_id: &str,
        doc_id: Uuid,
        index: u32,
        chunk: &str,
    ) -> Result<Vec<u8>, EngineError> {
        self.apply_local_edit(room_id, doc_id, |txn| {
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.insert(txn, index, chunk);
        })
        .await
    }

    /// Remove a character range from the shared body.
    pub async fn remove_text(
        &self,
        room_id: &str,
        doc_id: Uuid,
        index: u32,
        len: u32,
    ) -> Result<Vec<u8>, EngineError> {
        self.apply_local_edit(room_id, doc_id, |txn| {
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.remove_range(txn, index, len);
        })
        .await
    }

    /// Integrate an update received from a connected client, then
    /// replicate it to peer instances.
    pub async fn integrate(
        &self,
        room_id: &str,
        doc_id: Uuid,
        update: &[u8],
        origin_conn: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let replica = self.replica(doc_id).await?;
        let mut rep = replica.lock().await;
        let decoded =
            yrs::Update::decode_v1(update).map_err(|e| EngineError::Codec(e.to_string()))?;
        {
            let mut txn = rep.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EngineError::Codec(e.to_string()))?;
        }
        self.record_and_publish(&mut rep, room_id, doc_id, update, origin_conn);
        Ok(())
    }

    /// Merge an update that arrived from a peer instance over the bus.
    /// Applied and persisted, but not republished.
    pub async fn merge_remote(&self, doc_id: Uuid, update: &[u8]) -> Result<(), EngineError> {
        let replica = self.replica(doc_id).await?;
        let mut rep = replica.lock().await;
        let decoded =
            yrs::Update::decode_v1(update).map_err(|e| EngineError::Codec(e.to_string()))?;
        {
            let mut txn = rep.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EngineError::Codec(e.to_string()))?;
        }
        self.record(&mut rep, doc_id, update);
        Ok(())
    }

    /// Answer an open handshake: everything the requester is missing,
    /// relative to the state vector it sent (empty means "send it all").
    pub async fn handle_sync_request(
        &self,
        doc_id: Uuid,
        remote_state_vector: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let replica = self.replica(doc_id).await?;
        let rep = replica.lock().await;
        let sv = if remote_state_vector.is_empty() {
            yrs::StateVector::default()
        } else {
            yrs::StateVector::decode_v1(remote_state_vector)
                .map_err(|e| EngineError::Codec(e.to_string()))?
        };
        let txn = rep.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encoded per-site clocks of this replica.
    pub async fn state_vector(&self, doc_id: Uuid) -> Result<Vec<u8>, EngineError> {
        let replica = self.replica(doc_id).await?;
        let rep = replica.lock().await;
        let txn = rep.doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// Materialized shared-body content.
    pub async fn content(&self, doc_id: Uuid) -> Result<String, EngineError> {
        let replica = self.replica(doc_id).await?;
        let rep = replica.lock().await;
        let txn = rep.doc.transact();
        Ok(txn
            .get_text(TEXT_ROOT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default())
    }

    /// Flush a document's snapshot now, compacting its tail on success.
    pub async fn flush(&self, doc_id: Uuid) -> Result<(), EngineError> {
        let replica = self.replica(doc_id).await?;
        let mut rep = replica.lock().await;
        self.compact(&mut rep, doc_id);
        Ok(())
    }

    /// Flush every loaded document. Called on shutdown.
    pub async fn flush_all(&self) {
        let doc_ids: Vec<Uuid> = {
            let docs = self.docs.read().await;
            docs.keys().copied().collect()
        };
        for doc_id in doc_ids {
            if let Err(e) = self.flush(doc_id).await {
                log::error!("Flush failed for doc {doc_id}: {e}");
            }
        }
    }

    /// Reload every persisted document into memory. Called on startup so
    /// documents are immediately available when participants reconnect.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let doc_ids = store.list_documents()?;
        let mut recovered = 0;
        for doc_id in doc_ids {
            self.replica(doc_id).await?;
            recovered += 1;
            log::info!("Recovered document {doc_id} from storage");
        }
        Ok(recovered)
    }

    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn pending_ops(&self, doc_id: Uuid) -> usize {
        let docs = self.docs.read().await;
        match docs.get(&doc_id) {
            Some(replica) => replica.lock().await.log.pending_count(),
            None => 0,
        }
    }

    /// Record an accepted update (tail + durable op) and replicate it to
    /// peer instances. A bus outage only degrades cross-instance
    /// visibility: the local apply stands and the op is already durable,
    /// so reconnecting peers recover it through the sync handshake.
    fn record_and_publish(
        &self,
        rep: &mut DocReplica,
        room_id: &str,
        doc_id: Uuid,
        update: &[u8],
        origin_conn: Option<Uuid>,
    ) {
        self.record(rep, doc_id, update);

        let envelope = BusEnvelope::new(
            self.instance_id,
            origin_conn,
            BusFrame::DocUpdate {
                room_id: room_id.to_string(),
                doc_id,
                update: update.to_vec(),
            },
        );
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(&doc_channel(&doc_id), bytes) {
                    log::warn!("Doc update for {doc_id} not replicated: {e}");
                }
            }
            Err(e) => log::error!("Failed to encode doc update envelope: {e}"),
        }
    }

    fn record(&self, rep: &mut DocReplica, doc_id: Uuid, update: &[u8]) {
        let needs_compaction = rep.log.append(update);
        let seq = rep.log.head_seq();
        if let Some(store) = &self.store {
            if let Err(e) = store.store_op(doc_id, seq, update) {
                log::error!("Failed to persist op {seq} for doc {doc_id}: {e}");
            }
        }
        if needs_compaction {
            self.compact(rep, doc_id);
        }
    }

    /// Fold the tail into a snapshot. The in-memory tail resets either
    /// way (the replica holds full state); the durable tail is only
    /// dropped once the snapshot write succeeded, so a failed flush keeps
    /// every op recoverable.
    fn compact(&self, rep: &mut DocReplica, doc_id: Uuid) {
        let head_seq = rep.log.head_seq();
        if let Some(store) = &self.store {
            let snapshot = {
                let txn = rep.doc.transact();
                txn.encode_state_as_update_v1(&yrs::StateVector::default())
            };
            match store.store_snapshot(doc_id, &snapshot) {
                Ok(()) => {
                    if let Err(e) = store.compact_ops(doc_id, head_seq) {
                        log::warn!("Op-tail compaction failed for doc {doc_id}: {e}");
                    }
                    log::debug!("Snapshot persisted for doc {doc_id} through seq {head_seq}");
                }
                Err(e) => {
                    log::error!("Snapshot flush failed for doc {doc_id}: {e}");
                }
            }
        }
        rep.log.mark_compacted();
    }
}
