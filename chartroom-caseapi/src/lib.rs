//! # chartroom-caseapi — Structured case updates with optimistic concurrency
//!
//! The request/response half of the collaboration backbone. Structured
//! case fields (status, priority, whole diagnosis blocks) are guarded by a
//! version stamp instead of a merge: a stale writer gets an explicit
//! conflict carrying the current authoritative state, because for clinical
//! decisions a human-reviewable conflict is safer than a silent merge.
//!
//! ```text
//! PATCH /case/{id} { section, data, version }
//!        │
//!        ▼ bearer auth (IdentityVerifier)
//! ┌────────────┐  compare-and-increment  ┌───────────┐
//! │ axum route │ ──────────────────────► │ CaseStore │
//! └────────────┘    200 / 409+current    │ (RocksDB) │
//!                                        └───────────┘
//! ```
//!
//! Also hosts the `/healthz` probe reporting gateway and fan-out bus
//! health.

pub mod api;
pub mod error;
pub mod health;
pub mod store;

pub use api::{router, serve, AppState, UpdateRequest};
pub use error::ApiError;
pub use health::HealthReport;
pub use store::{CaseAggregate, CaseStore, CaseStoreConfig, UpdateError};
