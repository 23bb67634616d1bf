//! Identifier allocation
//!
//! Identifiers are a two-letter prefix derived from the submitter's name
//! followed by a zero-padded per-prefix counter, e.g. `JD007`. The counter
//! lives in `sequences`; every identifier handed out is recorded against its
//! submission key in `submission_ids` inside the same transaction, so a
//! resubmission gets the identifier it got the first time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::LocalStore;
use crate::error::AllocationError;

/// Base delay between attempts on a busy database; attempt `n` waits `n` times this
const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// A human-legible record identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// `prefix` followed by `number` zero-padded to at least `width` digits
    pub fn format(prefix: &str, number: u64, width: usize) -> Self {
        Self(format!("{}{:0width$}", prefix, number, width = width))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Split into prefix and sequence number.
    ///
    /// Prefixes are one or two characters. The suffix must be at least
    /// `width` digits and may only be longer than `width` without a leading
    /// zero, which makes the split unambiguous.
    pub fn components(&self, width: usize) -> Result<(&str, u64), AllocationError> {
        for prefix_len in [2, 1] {
            let Some((split, _)) = self.0.char_indices().nth(prefix_len) else {
                continue;
            };
            let (prefix, digits) = self.0.split_at(split);
            if digits.len() < width || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if digits.len() > width && digits.starts_with('0') {
                continue;
            }
            if let Ok(number) = digits.parse::<u64>() {
                return Ok((prefix, number));
            }
        }
        Err(AllocationError::MalformedIdentifier(self.0.clone()))
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Derive the identifier prefix from a full name.
///
/// Two or more words give the initials of the first two; a single word gives
/// its first two characters. The result is uppercase.
pub fn derive_prefix(full_name: &str) -> Result<String, AllocationError> {
    let upper = full_name.trim().to_uppercase();
    let tokens: Vec<&str> = upper.split_whitespace().collect();

    let prefix: String = match tokens.as_slice() {
        [] => return Err(AllocationError::InvalidName(full_name.to_string())),
        [single] => single.chars().take(2).collect(),
        [first, second, ..] => first.chars().take(1).chain(second.chars().take(1)).collect(),
    };
    Ok(prefix)
}

/// Hands out identifiers from the `sequences` table
pub struct SequenceAllocator {
    store: Arc<LocalStore>,
    width: usize,
    max_attempts: u32,
}

impl SequenceAllocator {
    pub fn new(store: Arc<LocalStore>, width: usize, max_attempts: u32) -> Self {
        Self {
            store,
            width: width.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Allocate an identifier for `full_name`, or return the one already
    /// allocated for `submission_key`.
    ///
    /// Blocks while waiting for the database; async callers should go
    /// through `spawn_blocking`.
    pub fn allocate(&self, full_name: &str, submission_key: &str) -> Result<Identifier, AllocationError> {
        let submission_key = submission_key.trim();
        if submission_key.is_empty() {
            return Err(AllocationError::InvalidSubmissionKey);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .store
                .with_conn_mut(|conn| self.allocate_once(conn, full_name, submission_key));

            match result {
                Err(AllocationError::Database(ref e)) if is_busy(e) => {
                    if attempt >= self.max_attempts {
                        warn!(submission_key, attempts = attempt, "Giving up on busy database");
                        return Err(AllocationError::Contention { attempts: attempt });
                    }
                    debug!(submission_key, attempt, "Database busy, retrying allocation");
                    std::thread::sleep(BACKOFF_STEP * attempt);
                }
                other => return other,
            }
        }
    }

    /// Identifier previously allocated for `submission_key`, if any
    pub fn lookup(&self, submission_key: &str) -> Result<Option<Identifier>, AllocationError> {
        self.store
            .with_conn(|conn| existing_for_key(conn, submission_key.trim()))
    }

    fn allocate_once(
        &self,
        conn: &mut Connection,
        full_name: &str,
        submission_key: &str,
    ) -> Result<Identifier, AllocationError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = existing_for_key(&tx, submission_key)? {
            // Trees persisted before the ledger existed only carry the
            // association in form_uuid
            let prefix = match existing.components(self.width) {
                Ok((prefix, _)) => prefix.to_string(),
                Err(e) => {
                    debug!(error = %e, "Legacy identifier outside the counter scheme");
                    String::new()
                }
            };
            record(&tx, submission_key, &existing, &prefix)?;
            tx.commit()?;
            debug!(submission_key, identifier = %existing, "Reusing identifier");
            return Ok(existing);
        }

        let prefix = derive_prefix(full_name)?;
        let mut next_val: u64 = tx
            .query_row(
                "SELECT next_val FROM sequences WHERE prefix = ?1",
                params![prefix],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v.max(1) as u64)
            .unwrap_or(1);

        // Skip numbers already taken by rows that never went through the counter
        let identifier = loop {
            let candidate = Identifier::format(&prefix, next_val, self.width);
            next_val += 1;
            if !is_taken(&tx, &candidate)? {
                break candidate;
            }
            warn!(identifier = %candidate, "Identifier already in use, skipping");
        };

        tx.execute(
            "INSERT INTO sequences (prefix, next_val) VALUES (?1, ?2)
             ON CONFLICT(prefix) DO UPDATE SET next_val = excluded.next_val",
            params![prefix, next_val as i64],
        )?;
        record(&tx, submission_key, &identifier, &prefix)?;
        tx.commit()?;

        info!(submission_key, identifier = %identifier, "Allocated identifier");
        Ok(identifier)
    }
}

fn existing_for_key(conn: &Connection, submission_key: &str) -> Result<Option<Identifier>, AllocationError> {
    let ledger: Option<String> = conn
        .query_row(
            "SELECT identifier FROM submission_ids WHERE submission_key = ?1",
            params![submission_key],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = ledger {
        return Ok(Some(Identifier(id)));
    }

    let tree: Option<String> = conn
        .query_row(
            "SELECT tree_id FROM trees WHERE form_uuid = ?1",
            params![submission_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(tree.map(Identifier))
}

fn is_taken(tx: &Transaction<'_>, candidate: &Identifier) -> Result<bool, AllocationError> {
    let taken: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM submission_ids WHERE identifier = ?1)
             OR EXISTS(SELECT 1 FROM trees WHERE tree_id = ?1)",
        params![candidate.as_str()],
        |row| row.get(0),
    )?;
    Ok(taken)
}

fn record(
    tx: &Transaction<'_>,
    submission_key: &str,
    identifier: &Identifier,
    prefix: &str,
) -> Result<(), AllocationError> {
    tx.execute(
        "INSERT OR IGNORE INTO submission_ids (submission_key, identifier, prefix, allocated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![submission_key, identifier.as_str(), prefix, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migration, tables};

    fn store() -> Arc<LocalStore> {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .with_conn_mut(|conn| {
                for schema in tables::target_schemas()? {
                    migration::ensure_table(conn, &schema)?;
                }
                Ok::<_, crate::error::MigrationError>(())
            })
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_derive_prefix() {
        assert_eq!(derive_prefix("John Doe").unwrap(), "JD");
        assert_eq!(derive_prefix("  mary   ann smith ").unwrap(), "MA");
        assert_eq!(derive_prefix("Kipchoge").unwrap(), "KI");
        assert_eq!(derive_prefix("x").unwrap(), "X");
        assert_eq!(derive_prefix("émile zola").unwrap(), "ÉZ");
        assert!(matches!(derive_prefix("   "), Err(AllocationError::InvalidName(_))));
        assert!(matches!(derive_prefix(""), Err(AllocationError::InvalidName(_))));
    }

    #[test]
    fn test_identifier_format_and_components() {
        let id = Identifier::format("JD", 7, 3);
        assert_eq!(id.as_str(), "JD007");
        assert_eq!(id.components(3).unwrap(), ("JD", 7));

        let wide = Identifier::format("JD", 1000, 3);
        assert_eq!(wide.as_str(), "JD1000");
        assert_eq!(wide.components(3).unwrap(), ("JD", 1000));

        assert_eq!(Identifier::format("X", 1, 3).components(3).unwrap(), ("X", 1));
        assert_eq!(Identifier::format("R2", 1, 3).components(3).unwrap(), ("R2", 1));
        assert!(Identifier("JD07".to_string()).components(3).is_err());
        assert!(Identifier("JDabc".to_string()).components(3).is_err());
    }

    #[test]
    fn test_allocate_sequential() {
        let allocator = SequenceAllocator::new(store(), 3, 5);

        assert_eq!(allocator.allocate("John Doe", "k1").unwrap().as_str(), "JD001");
        assert_eq!(allocator.allocate("Jane Dunn", "k2").unwrap().as_str(), "JD002");
        assert_eq!(allocator.allocate("Alice", "k3").unwrap().as_str(), "AL001");
    }

    #[test]
    fn test_allocate_is_idempotent_per_key() {
        let allocator = SequenceAllocator::new(store(), 3, 5);

        let first = allocator.allocate("John Doe", "form-1").unwrap();
        let again = allocator.allocate("Someone Else", "form-1").unwrap();
        assert_eq!(first, again);
        assert_eq!(allocator.lookup("form-1").unwrap(), Some(first));

        // Counter did not move
        assert_eq!(allocator.allocate("John Doe", "form-2").unwrap().as_str(), "JD002");
    }

    #[test]
    fn test_allocate_honors_existing_tree() {
        let store = store();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trees (tree_id, form_uuid, tree_tracking_number) VALUES ('JD042', 'legacy', 'T1')",
                    [],
                )
            })
            .unwrap();

        let allocator = SequenceAllocator::new(store, 3, 5);
        assert_eq!(allocator.allocate("John Doe", "legacy").unwrap().as_str(), "JD042");
        assert_eq!(allocator.lookup("legacy").unwrap().unwrap().as_str(), "JD042");
    }

    #[test]
    fn test_allocate_skips_taken_identifiers() {
        let store = store();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO trees (tree_id, tree_tracking_number) VALUES ('JD001', 'T1')",
                    [],
                )
            })
            .unwrap();

        let allocator = SequenceAllocator::new(store, 3, 5);
        assert_eq!(allocator.allocate("John Doe", "k1").unwrap().as_str(), "JD002");
        assert_eq!(allocator.allocate("John Doe", "k2").unwrap().as_str(), "JD003");
    }

    #[test]
    fn test_allocate_widens_past_width() {
        let store = store();
        store
            .with_conn(|conn| conn.execute("INSERT INTO sequences (prefix, next_val) VALUES ('JD', 999)", []))
            .unwrap();

        let allocator = SequenceAllocator::new(store, 3, 5);
        assert_eq!(allocator.allocate("John Doe", "a").unwrap().as_str(), "JD999");
        assert_eq!(allocator.allocate("John Doe", "b").unwrap().as_str(), "JD1000");
    }

    #[test]
    fn test_invalid_input_consumes_nothing() {
        let store = store();
        let allocator = SequenceAllocator::new(store.clone(), 3, 5);

        assert!(matches!(
            allocator.allocate("   ", "k1"),
            Err(AllocationError::InvalidName(_))
        ));
        assert!(matches!(
            allocator.allocate("John Doe", "  "),
            Err(AllocationError::InvalidSubmissionKey)
        ));

        let counters: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM sequences", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(counters, 0);
        assert_eq!(allocator.lookup("k1").unwrap(), None);
    }
}
