//! Sync Module - remote to local mirroring
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Sync Engine                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  RemoteStore    - Lists remote collections (Firestore, memory)   │
//! │  Mappings       - Remote field -> local column per collection    │
//! │  SyncReconciler - Upserts remote documents into local tables     │
//! │  SyncScheduler  - Runs the reconciler on a cancellable interval  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replication is one-way. Rows that only exist locally are never pushed,
//! and documents deleted remotely stay in the local cache.

pub mod firestore;
pub mod mapping;
pub mod reconciler;
pub mod remote;
pub mod scheduler;

pub use firestore::FirestoreClient;
pub use mapping::{CollectionMapping, Fallback, FieldMap, KeyRule, MappedRecord};
pub use reconciler::{CollectionReport, SyncCounts, SyncReconciler};
pub use remote::{MemoryRemoteStore, RemoteDocument, RemoteStore, RemoteValue};
pub use scheduler::{SchedulerSettings, SchedulerState, SchedulerStatus, SyncScheduler};
