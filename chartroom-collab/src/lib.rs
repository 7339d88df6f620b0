//! # chartroom-collab — Real-time collaboration backbone for clinical case records
//!
//! Lets multiple clinicians work on the same case simultaneously: live
//! presence (cursors, focused sections, typing), room chat, and concurrent
//! free-text editing with CRDT merge.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                       ┌── Client C
//!            │  WebSocket            │
//!            ▼                       ▼
//! ┌────────────────┐  FanoutBus  ┌────────────────┐
//! │ CollabGateway  │ ◄─────────► │ CollabGateway  │
//! │ (instance 1)   │  room:{id}  │ (instance 2)   │
//! │                │  doc:{id}   │                │
//! │ RoomRegistry   │             │ RoomRegistry   │
//! │ PresenceStore  │             │ PresenceStore  │
//! │ DocumentEngine │             │ DocumentEngine │
//! └───────┬────────┘             └───────┬────────┘
//!         │                              │
//!         ▼                              ▼
//! ┌────────────────┐             ┌────────────────┐
//! │ DocumentVault  │             │ DocumentVault  │
//! │ (RocksDB)      │             │ (RocksDB)      │
//! └────────────────┘             └────────────────┘
//! ```
//!
//! Room state is process-local; the only cross-instance mechanism is the
//! fan-out bus, which moves opaque event payloads on named channels. The
//! document engine compensates for cross-site reordering itself (per-site
//! logical clocks via yrs), so it needs no ordering from the bus.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`identity`] — Bearer-token verification at the connection boundary
//! - [`registry`] — Per-process room membership
//! - [`presence`] — Ephemeral per-participant state and its lifecycle
//! - [`bus`] — Named-channel publish/subscribe fan-out
//! - [`outbound`] — Bounded per-connection event queue with drop policy
//! - [`gateway`] — WebSocket connection gateway
//! - [`docsync`] — CRDT document synchronization engine
//! - [`storage`] — Snapshot and op-batch persistence
//! - [`client`] — WebSocket client with offline queue

pub mod protocol;
pub mod identity;
pub mod registry;
pub mod presence;
pub mod bus;
pub mod outbound;
pub mod gateway;
pub mod docsync;
pub mod storage;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    BusEnvelope, BusFrame, ClientMessage, DocOpPayload, EventClass, ProtocolError, RoomId,
    ServerEvent, doc_channel, room_channel,
};
pub use identity::{AuthError, Identity, IdentityVerifier};
pub use registry::{ConnectionHandle, RoomRegistry};
pub use presence::{CursorPos, PresenceEntry, PresencePhase, PresenceStore, RoomPresence};
pub use bus::{BusError, BusStats, FanoutBus};
pub use outbound::{OutboundQueue, PushResult, QueuedEvent};
pub use gateway::{CollabGateway, GatewayConfig, GatewayStats, HealthHandle, HealthSnapshot};
pub use docsync::{DocumentEngine, EngineConfig, EngineError};
pub use storage::{
    DocumentMeta, DocumentVault, OpBatchLog, OpLogStats, SnapshotStore, StoreError, VaultConfig,
};
pub use client::{ClientConfig, ClientEvent, ClientState, CollabClient, OfflineQueue, QueuedOp};
