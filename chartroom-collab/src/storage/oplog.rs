//! In-memory op-batch log with LZ4 compression and threshold compaction.
//!
//! Each document replica keeps the update tail since its last snapshot as
//! compressed batches. When the tail crosses the compaction threshold the
//! engine folds replica state into a fresh snapshot and the tail resets,
//! bounding both memory and replay cost. Compaction never changes the
//! converged document content; it only re-bases the log.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One LZ4-compressed update batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedOp {
    /// Sequence number, monotonically increasing per document.
    pub seq: u64,
    /// Uncompressed size in bytes.
    pub original_size: u32,
    pub compressed: Vec<u8>,
}

impl CompressedOp {
    pub fn compress(seq: u64, data: &[u8]) -> Self {
        let compressed = lz4_flex::compress_prepend_size(data);
        Self {
            seq,
            original_size: data.len() as u32,
            compressed,
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, OpLogError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| OpLogError::DecompressionFailed(e.to_string()))
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

#[derive(Debug, Clone)]
pub enum OpLogError {
    DecompressionFailed(String),
    EmptyLog,
}

impl std::fmt::Display for OpLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpLogError::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
            OpLogError::EmptyLog => write!(f, "Op log is empty"),
        }
    }
}

impl std::error::Error for OpLogError {}

/// Counters describing one log's tail.
#[derive(Debug, Clone, Default)]
pub struct OpLogStats {
    pub op_count: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Sequence at the last compaction point.
    pub base_seq: u64,
    pub head_seq: u64,
}

impl OpLogStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

/// Update tail for one document since its last snapshot.
pub struct OpBatchLog {
    doc_id: Uuid,
    ops: Vec<CompressedOp>,
    base_seq: u64,
    head_seq: u64,
    compaction_threshold: usize,
}

impl OpBatchLog {
    pub fn new(doc_id: Uuid, compaction_threshold: usize) -> Self {
        Self {
            doc_id,
            ops: Vec::with_capacity(compaction_threshold.min(1024)),
            base_seq: 0,
            head_seq: 0,
            compaction_threshold,
        }
    }

    /// Append an update batch. Returns `true` when the tail has crossed the
    /// compaction threshold and the caller should snapshot.
    pub fn append(&mut self, op: &[u8]) -> bool {
        self.head_seq += 1;
        self.ops.push(CompressedOp::compress(self.head_seq, op));
        self.needs_compaction()
    }

    pub fn needs_compaction(&self) -> bool {
        self.ops.len() >= self.compaction_threshold
    }

    /// Drop the tail after the caller has captured a snapshot covering it.
    /// Returns the stats of the tail that was folded away.
    pub fn mark_compacted(&mut self) -> OpLogStats {
        let stats = self.stats();
        self.base_seq = self.head_seq;
        self.ops.clear();
        stats
    }

    /// Decompress the tail in sequence order, for replay on recovery.
    pub fn decompress_all(&self) -> Result<Vec<(u64, Vec<u8>)>, OpLogError> {
        self.ops
            .iter()
            .map(|op| Ok((op.seq, op.decompress()?)))
            .collect()
    }

    /// Rebuild the tail from persisted batches.
    pub fn restore(&mut self, base_seq: u64, ops: Vec<CompressedOp>) {
        self.base_seq = base_seq;
        self.head_seq = ops.last().map_or(base_seq, |op| op.seq);
        self.ops = ops;
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }

    pub fn pending_count(&self) -> usize {
        self.ops.len()
    }

    pub fn stats(&self) -> OpLogStats {
        let mut total_original = 0u64;
        let mut total_compressed = 0u64;
        for op in &self.ops {
            total_original += op.original_size as u64;
            total_compressed += op.compressed.len() as u64;
        }
        OpLogStats {
            op_count: self.ops.len() as u64,
            total_original_bytes: total_original,
            total_compressed_bytes: total_compressed,
            base_seq: self.base_seq,
            head_seq: self.head_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_op_roundtrip() {
        let data = b"insert 'metformin 500mg' at offset 118 of the treatment note";
        let op = CompressedOp::compress(1, data);
        assert_eq!(op.seq, 1);
        assert_eq!(op.original_size, data.len() as u32);
        assert_eq!(op.decompress().unwrap(), data);
    }

    #[test]
    fn test_empty_op_roundtrip() {
        let op = CompressedOp::compress(0, &[]);
        assert_eq!(op.original_size, 0);
        assert!(op.decompress().unwrap().is_empty());
    }

    #[test]
    fn test_append_threshold() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 5);
        for _ in 0..4 {
            assert!(!log.append(b"edit"));
        }
        assert!(log.append(b"edit"));
        assert!(log.needs_compaction());
        assert_eq!(log.head_seq(), 5);
        assert_eq!(log.pending_count(), 5);
    }

    #[test]
    fn test_mark_compacted_resets_tail() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 3);
        log.append(b"a");
        log.append(b"b");
        log.append(b"c");

        let stats = log.mark_compacted();
        assert_eq!(stats.op_count, 3);
        assert_eq!(log.pending_count(), 0);
        assert_eq!(log.base_seq(), 3);
        assert_eq!(log.head_seq(), 3);

        // Sequences keep climbing after compaction.
        log.append(b"d");
        assert_eq!(log.head_seq(), 4);
    }

    #[test]
    fn test_decompress_all_in_order() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 100);
        log.append(b"op_1");
        log.append(b"op_2");
        log.append(b"op_3");

        let all = log.decompress_all().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], (1, b"op_1".to_vec()));
        assert_eq!(all[2], (3, b"op_3".to_vec()));
    }

    #[test]
    fn test_restore() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 100);
        let ops: Vec<CompressedOp> = (11..=15)
            .map(|seq| CompressedOp::compress(seq, format!("op_{seq}").as_bytes()))
            .collect();
        log.restore(10, ops);

        assert_eq!(log.base_seq(), 10);
        assert_eq!(log.head_seq(), 15);
        assert_eq!(log.pending_count(), 5);
        assert_eq!(log.decompress_all().unwrap()[0].1, b"op_11");
    }

    #[test]
    fn test_restore_empty_tail() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 100);
        log.restore(7, Vec::new());
        assert_eq!(log.base_seq(), 7);
        assert_eq!(log.head_seq(), 7);
    }

    #[test]
    fn test_stats_compression() {
        let mut log = OpBatchLog::new(Uuid::new_v4(), 100);
        for i in 0..10u8 {
            log.append(&vec![i; 200]);
        }
        let stats = log.stats();
        assert_eq!(stats.op_count, 10);
        assert_eq!(stats.total_original_bytes, 2000);
        assert!(stats.total_compressed_bytes < 2000);
        assert!(stats.compression_ratio() > 1.0);
    }
}
