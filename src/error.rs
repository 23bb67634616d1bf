//! Error types for tally-store
//!
//! Each component has its own error type so callers can tell a broken schema
//! apart from a flaky remote. `StoreError` wraps all of them at the service
//! boundary.

use thiserror::Error;

/// Table or column introspection failures
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The table does not exist; callers may create it from scratch
    #[error("Table not found: {0}")]
    TableMissing(String),

    #[error("Invalid schema for {table}: {reason}")]
    Invalid { table: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Rebuild or additive-change failures. The transaction has been rolled back
/// by the time one of these is returned.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Rebuild of {table} failed: {source}")]
    Rebuild {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Adding column {table}.{column} failed: {source}")]
    AddColumn {
        table: String,
        column: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Creating table {table} failed: {source}")]
    Create {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Identifier allocation failures, surfaced synchronously to the caller
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Invalid name for identifier allocation: {0:?}")]
    InvalidName(String),

    #[error("Local store busy after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Submission key must not be empty")]
    InvalidSubmissionKey,

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Collection-scoped sync failures. Never aborts other collections.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote store error for {collection}: {message}")]
    Remote { collection: String, message: String },

    #[error("Remote fetch of {collection} timed out after {secs}s")]
    Timeout { collection: String, secs: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A single remote document that cannot be mapped onto its local row
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordMappingError {
    #[error("Document {doc_id} has no usable key")]
    MissingKey { doc_id: String },

    #[error("Document {doc_id} could not be decoded: {reason}")]
    Undecodable { doc_id: String, reason: String },

    #[error("Document {doc_id}: field {field} is not a valid {expected}")]
    InvalidValue {
        doc_id: String,
        field: String,
        expected: &'static str,
    },
}

/// Errors recording a field measurement of an existing tree
#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Monitoring submission is missing {0}")]
    MissingField(&'static str),

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Tree {tree_id} does not carry tracking number {claimed}")]
    TrackingMismatch { tree_id: String, claimed: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Umbrella error used by the service object and the binary
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Monitoring(#[from] MonitoringError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
