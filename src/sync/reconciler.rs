//! Remote-to-local reconciliation
//!
//! A pass over one collection fetches every remote document, then upserts
//! each one into the local table in its own short transaction. Documents that
//! cannot be mapped are skipped; the rest of the collection still lands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::mapping::{CollectionMapping, MappedRecord};
use super::remote::RemoteStore;
use crate::db::tables::{LAST_SYNC_TIME, REMOTE_DOC_ID};
use crate::db::{catalog, LocalStore};
use crate::error::{SchemaError, SyncError};

/// Per-collection outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Result of one collection within a pass
#[derive(Debug)]
pub struct CollectionReport {
    pub collection: String,
    pub result: Result<SyncCounts, SyncError>,
}

impl CollectionReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Local identity of rows already present in a table
#[derive(Default)]
struct LocalIndex {
    keys: HashSet<String>,
    by_doc_id: HashMap<String, String>,
}

enum Upsert {
    Inserted,
    Updated,
}

/// Pulls remote collections into the local store
pub struct SyncReconciler {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    fetch_timeout: Duration,
}

impl SyncReconciler {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteStore>, fetch_timeout: Duration) -> Self {
        Self {
            store,
            remote,
            fetch_timeout,
        }
    }

    /// Reconcile every mapping in order. A failing collection is reported
    /// and the pass moves on to the next one.
    pub async fn reconcile_all(&self, mappings: &[CollectionMapping]) -> Vec<CollectionReport> {
        let mut reports = Vec::with_capacity(mappings.len());

        for mapping in mappings {
            let result = self.reconcile_collection(mapping).await;
            if let Err(e) = &result {
                warn!(collection = %mapping.collection, error = %e, "Collection sync failed");
            }
            reports.push(CollectionReport {
                collection: mapping.collection.clone(),
                result,
            });
        }

        reports
    }

    /// Pull one collection into its local table
    pub async fn reconcile_collection(&self, mapping: &CollectionMapping) -> Result<SyncCounts, SyncError> {
        let (table, key_column) = (mapping.table.clone(), mapping.key_column.clone());
        let mut index = self
            .on_store(move |conn| load_index(conn, &table, &key_column))
            .await??;

        let documents = tokio::time::timeout(self.fetch_timeout, self.remote.list_documents(&mapping.collection))
            .await
            .map_err(|_| SyncError::Timeout {
                collection: mapping.collection.clone(),
                secs: self.fetch_timeout.as_secs(),
            })??;

        let sync_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut counts = SyncCounts::default();

        for doc in documents.iter().filter(|d| mapping.accepts(d)) {
            let record = match mapping.map_document(doc, &sync_time) {
                Ok(record) => record,
                Err(e) => {
                    warn!(collection = %mapping.collection, error = %e, "Skipping unmappable document");
                    counts.skipped += 1;
                    continue;
                }
            };

            // An existing row is found by key first, then by the document it came from
            let target = if index.keys.contains(&record.key) {
                Some(record.key.clone())
            } else {
                index.by_doc_id.get(&record.doc_id).cloned()
            };
            let (doc_id, key) = (record.doc_id.clone(), record.key.clone());
            let write = RowWrite {
                table: mapping.table.clone(),
                key_column: mapping.key_column.clone(),
                record,
                target,
                sync_time: sync_time.clone(),
            };

            match self.on_store(move |conn| write.apply(conn)).await? {
                Ok(Upsert::Inserted) => counts.inserted += 1,
                Ok(Upsert::Updated) => counts.updated += 1,
                Err(e) if is_constraint_violation(&e) => {
                    warn!(
                        collection = %mapping.collection,
                        doc_id = %doc_id,
                        error = %e,
                        "Skipping document that conflicts with a local row"
                    );
                    counts.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(previous) = index.by_doc_id.insert(doc_id, key.clone()) {
                index.keys.remove(&previous);
            }
            index.keys.insert(key);
        }

        info!(
            collection = %mapping.collection,
            table = %mapping.table,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            "Collection synced"
        );
        Ok(counts)
    }

    /// Run `f` against the local store on the blocking pool
    async fn on_store<F, T, E>(&self, f: F) -> Result<Result<T, E>, SyncError>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.with_conn_mut(f))
            .await
            .map_err(|e| SyncError::Internal(format!("Store task failed: {}", e)))
    }
}

fn load_index(conn: &Connection, table: &str, key_column: &str) -> Result<LocalIndex, SyncError> {
    if !catalog::table_exists(conn, table)? {
        return Err(SchemaError::TableMissing(table.to_string()).into());
    }

    let mut stmt = conn.prepare(&format!("SELECT {}, {} FROM {}", key_column, REMOTE_DOC_ID, table))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, Value>(0)?, row.get::<_, Option<String>>(1)?)))?;

    let mut index = LocalIndex::default();
    for row in rows {
        // Legacy rows may carry an integer or NULL key
        let (key, doc_id) = row?;
        let key = match key {
            Value::Text(key) => key,
            Value::Integer(key) => key.to_string(),
            _ => continue,
        };
        if let Some(doc_id) = doc_id {
            index.by_doc_id.insert(doc_id, key.clone());
        }
        index.keys.insert(key);
    }

    debug!(table, rows = index.keys.len(), "Loaded local keys");
    Ok(index)
}

/// One document's worth of column values, bound for one table
struct RowWrite {
    table: String,
    key_column: String,
    record: MappedRecord,
    /// Key of the local row to update; `None` inserts
    target: Option<String>,
    sync_time: String,
}

impl RowWrite {
    fn apply(&self, conn: &mut Connection) -> Result<Upsert, rusqlite::Error> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut columns: Vec<&str> = vec![self.key_column.as_str()];
        columns.extend(self.record.values.iter().map(|(c, _)| c.as_str()));
        columns.push(REMOTE_DOC_ID);
        columns.push(LAST_SYNC_TIME);

        let mut values: Vec<Value> = vec![Value::Text(self.record.key.clone())];
        values.extend(self.record.values.iter().map(|(_, v)| v.clone()));
        values.push(Value::Text(self.record.doc_id.clone()));
        values.push(Value::Text(self.sync_time.clone()));

        let outcome = match &self.target {
            Some(existing_key) => {
                let assignments: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ?{}", c, i + 1))
                    .collect();
                values.push(Value::Text(existing_key.clone()));
                tx.execute(
                    &format!(
                        "UPDATE {} SET {} WHERE {} = ?{}",
                        self.table,
                        assignments.join(", "),
                        self.key_column,
                        values.len()
                    ),
                    params_from_iter(values.iter()),
                )?;
                Upsert::Updated
            }
            None => {
                let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
                tx.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        self.table,
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    params_from_iter(values.iter()),
                )?;
                Upsert::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}
