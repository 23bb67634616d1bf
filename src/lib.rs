//! Tally Store - local SQLite mirror of a remote document store
//!
//! Keeps a local SQLite database of tree plantings, users and institutions in
//! step with the remote collections they originate from, while the local
//! schema keeps evolving.
//!
//! ## Components
//!
//! - **db**: schema catalog, migrations (additive and shadow-table rebuild)
//! - **allocator**: short per-prefix identifiers, idempotent per submission
//! - **sync**: remote collection listing, per-key upsert, periodic scheduler
//! - **planting**: locally-originated tree records with CO2 estimates
//! - **monitoring**: follow-up measurements, applied once per submission
//! - **service**: wires everything to one explicit service object
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/tally-store/
//! ├── trees.db        # SQLite database (WAL mode)
//! └── config.toml     # Configuration
//! ```

pub mod allocator;
pub mod config;
pub mod db;
pub mod error;
pub mod monitoring;
pub mod planting;
pub mod service;
pub mod sync;

// Re-exports
pub use allocator::{derive_prefix, Identifier, SequenceAllocator};
pub use config::Config;
pub use db::{LocalStore, MigrationOutcome};
pub use error::{
    AllocationError, MigrationError, MonitoringError, RecordMappingError, SchemaError, StoreError, SyncError,
};
pub use monitoring::{MonitoringOutcome, MonitoringRecord, MonitoringRecorder, MonitoringSubmission};
pub use planting::{BasicVolumeModel, CarbonModel, PlantedTree, PlantingRecorder, PlantingSubmission, TreeMeasurement};
pub use service::TallyService;
pub use sync::{MemoryRemoteStore, RemoteDocument, RemoteStore, SyncReconciler, SyncScheduler};
