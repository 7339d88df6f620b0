//! Persistence for collaborative documents.
//!
//! ```text
//! ┌──────────────┐   ops / snapshots   ┌───────────────┐
//! │ DocumentEngine│ ─────────────────► │ DocumentVault │
//! │ (in-memory)   │                    │ (RocksDB)     │
//! └──────┬───────┘                     └──────┬────────┘
//!        │ on startup                         │ column families
//!        ▼                                    ▼
//! ┌──────────────┐    ┌─────────────────────────────────────┐
//! │ replicas     │    │ CF "snapshots" — full doc state, LZ4 │
//! │ (restored)   │    │ CF "ops"       — update tail, LZ4    │
//! └──────────────┘    │ CF "meta"      — per-doc metadata    │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! The vault is the engine's only durability boundary; everything else is
//! replicated peer to peer over the bus. A document survives every
//! participant disconnecting because the snapshot plus the op tail can
//! rebuild the replica.

pub mod oplog;
pub mod vault;

pub use oplog::{CompressedOp, OpBatchLog, OpLogError, OpLogStats};
pub use vault::{DocumentMeta, DocumentVault, SnapshotStore, StoreError, VaultConfig};
