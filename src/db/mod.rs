//! SQLite local store
//!
//! Mirrors the remote collections and holds locally-originated records.
//!
//! ## Tables
//!
//! - `trees` - Planting records (mirrored and local)
//! - `users` / `pending_users` - Accounts and pending applications
//! - `institutions` - Approved institutions (mirrored)
//! - `sequences` / `submission_ids` - Identifier allocation state
//! - `species` / `monitoring_history` - Reference data and follow-up visits
//! - `schema_versions` - Last schema version applied per table
//!
//! One connection is shared behind a mutex. Every writer scopes its
//! transaction to a single logical operation so a long sync pass never holds
//! the lock for more than one document at a time.

pub mod catalog;
pub mod migration;
pub mod schema;
pub mod tables;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

/// How long a connection waits on a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database shared by the foreground path and the sync task
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create the database file
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // WAL lets readers proceed while the sync task writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Internal(format!("Failed to set PRAGMA: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock has already rolled back its
        // transaction, so the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a read against the connection
    pub fn with_conn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let conn = self.lock();
        f(&conn)
    }

    /// Run a write that needs its own transaction
    pub fn with_conn_mut<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E>,
    {
        let mut conn = self.lock();
        f(&mut conn)
    }

    /// Row counts for every known table that exists
    pub fn stats(&self) -> Result<Vec<TableStats>, StoreError> {
        self.with_conn(|conn| {
            let mut stats = Vec::new();
            for table in [
                tables::TREES,
                tables::USERS,
                tables::PENDING_USERS,
                tables::INSTITUTIONS,
                tables::SEQUENCES,
                tables::SUBMISSION_IDS,
                tables::SPECIES,
                tables::MONITORING_HISTORY,
            ] {
                if !catalog::table_exists(conn, table)? {
                    continue;
                }
                let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
                stats.push(TableStats {
                    table: table.to_string(),
                    rows: rows as u64,
                });
            }
            Ok(stats)
        })
    }
}

/// Row count for one table
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStats {
    pub table: String,
    pub rows: u64,
}

// Re-exports
pub use catalog::{ColumnInfo, RebuildReason, SchemaDelta};
pub use migration::MigrationOutcome;
pub use schema::{ColumnSpec, ColumnType, TableSchema};
