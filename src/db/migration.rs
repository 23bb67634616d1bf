//! Schema migrations
//!
//! Brings an existing table up to its [`TableSchema`] inside one IMMEDIATE
//! transaction. Two paths:
//!
//! - **Additive**: `ALTER TABLE ADD COLUMN` for each missing column, with
//!   backfills so UNIQUE and NOT NULL columns hold valid values afterwards.
//! - **Rebuild**: create a shadow table with the full target DDL, copy rows
//!   across through an explicit projection (renames included), drop the old
//!   table and rename the shadow into place.
//!
//! Either every step commits or the transaction rolls back and the table is
//! left exactly as it was.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use super::catalog::{self, ColumnInfo, RebuildReason};
use super::schema::{ColumnSpec, Rename, TableSchema, RANDOM_TOKEN_SQL};
use super::tables;
use crate::error::MigrationError;

/// What a migration did to a table
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// Table absent; create it from the full target schema
    Fresh,
    /// Table was created from the full target schema
    Created,
    UpToDate,
    Added { columns: Vec<String> },
    Rebuilt { reasons: Vec<RebuildReason> },
}

impl MigrationOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MigrationOutcome::Fresh | MigrationOutcome::UpToDate)
    }
}

const SCHEMA_VERSIONS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_versions (
    table_name TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
)
"#;

/// Migrate an existing table to `schema`.
///
/// Returns [`MigrationOutcome::Fresh`] without touching anything when the
/// table does not exist yet.
pub fn migrate(conn: &mut Connection, schema: &TableSchema) -> Result<MigrationOutcome, MigrationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if !catalog::table_exists(&tx, &schema.name)? {
        debug!(table = %schema.name, "Table absent, needs fresh create");
        return Ok(MigrationOutcome::Fresh);
    }

    let current = catalog::columns_of(&tx, &schema.name)?;
    let recorded = recorded_version(&tx, &schema.name)?;
    if let Some(recorded) = recorded.filter(|v| *v > schema.version) {
        warn!(
            table = %schema.name,
            recorded,
            expected = schema.version,
            "Database schema is newer than this build"
        );
    }
    // Renames already applied at the recorded version are not replayed
    let renames = schema.pending_renames(recorded);
    let delta = catalog::delta_with_renames(&current, schema, &renames);

    let outcome = if delta.requires_rebuild() {
        let reasons: Vec<String> = delta.rebuild_reasons.iter().map(|r| r.to_string()).collect();
        info!(table = %schema.name, reasons = ?reasons, "Rebuilding table");
        rebuild(&tx, schema, &current, &renames)?;
        MigrationOutcome::Rebuilt {
            reasons: delta.rebuild_reasons,
        }
    } else if !delta.missing.is_empty() {
        add_columns(&tx, schema, &delta.missing)?;
        MigrationOutcome::Added {
            columns: delta.missing.into_iter().map(|c| c.name).collect(),
        }
    } else {
        MigrationOutcome::UpToDate
    };

    ensure_indexes(&tx, schema)?;
    record_version(&tx, schema)?;
    tx.commit()?;

    match &outcome {
        MigrationOutcome::UpToDate => debug!(table = %schema.name, "Schema is up to date"),
        other => info!(table = %schema.name, outcome = ?other, "Schema migrated"),
    }
    Ok(outcome)
}

/// Create a table from the full target schema
pub fn create_table(conn: &mut Connection, schema: &TableSchema) -> Result<MigrationOutcome, MigrationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute_batch(&schema.create_sql(&schema.name, false))
        .map_err(|source| MigrationError::Create {
            table: schema.name.clone(),
            source,
        })?;
    ensure_indexes(&tx, schema)?;
    record_version(&tx, schema)?;
    tx.commit()?;

    info!(table = %schema.name, columns = schema.columns.len(), "Created table");
    Ok(MigrationOutcome::Created)
}

/// Create the table when absent, migrate it otherwise
pub fn ensure_table(conn: &mut Connection, schema: &TableSchema) -> Result<MigrationOutcome, MigrationError> {
    match migrate(conn, schema)? {
        MigrationOutcome::Fresh => create_table(conn, schema),
        outcome => Ok(outcome),
    }
}

/// Full reinitialization: `CREATE TABLE IF NOT EXISTS` for every schema and
/// default seed rows. Existing tables are left as they are.
pub fn reinitialize(conn: &mut Connection, schemas: &[TableSchema]) -> Result<(), MigrationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for schema in schemas {
        tx.execute_batch(&schema.create_sql(&schema.name, true))
            .map_err(|source| MigrationError::Create {
                table: schema.name.clone(),
                source,
            })?;
    }
    if schemas.iter().any(|s| s.name == tables::SPECIES) {
        tables::seed_species(&tx)?;
    }
    tx.commit()?;

    info!(tables = schemas.len(), "Reinitialized schema");
    Ok(())
}

/// Schema version recorded for `table`, if any
pub fn recorded_version(conn: &Connection, table: &str) -> Result<Option<u32>, MigrationError> {
    conn.execute_batch(SCHEMA_VERSIONS_DDL)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_versions WHERE table_name = ?1",
            params![table],
            |row| row.get::<_, u32>(0),
        )
        .optional()?;
    Ok(version)
}

fn record_version(tx: &Transaction<'_>, schema: &TableSchema) -> Result<(), MigrationError> {
    tx.execute_batch(SCHEMA_VERSIONS_DDL)?;
    tx.execute(
        "INSERT INTO schema_versions (table_name, version, applied_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET version = excluded.version, applied_at = excluded.applied_at
         WHERE excluded.version > schema_versions.version",
        params![schema.name, schema.version, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn ensure_indexes(tx: &Transaction<'_>, schema: &TableSchema) -> Result<(), MigrationError> {
    for index in &schema.indexes {
        tx.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            index.name,
            schema.name,
            index.columns.join(", ")
        ))?;
    }
    Ok(())
}

fn add_columns(tx: &Transaction<'_>, schema: &TableSchema, missing: &[ColumnSpec]) -> Result<(), MigrationError> {
    let table = &schema.name;

    for column in missing {
        let add_err = |source| MigrationError::AddColumn {
            table: table.clone(),
            column: column.name.clone(),
            source,
        };

        tx.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {}", table, column.additive_definition()))
            .map_err(add_err)?;

        if column.needs_unique_backfill() {
            // Freshly added: every existing value is NULL or the default
            tx.execute_batch(&format!("UPDATE {} SET {} = {}", table, column.name, RANDOM_TOKEN_SQL))
                .map_err(add_err)?;
        } else if column.not_null {
            tx.execute_batch(&format!("UPDATE {} SET {} = '' WHERE {} IS NULL", table, column.name, column.name))
                .map_err(add_err)?;
        }

        if column.unique && !column.primary_key {
            tx.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                schema.unique_index_name(&column.name),
                table,
                column.name
            ))
            .map_err(add_err)?;
        }

        info!(table = %table, column = %column.name, "Added column");
    }

    Ok(())
}

/// Source expression for one target column during a rebuild
fn projection(column: &ColumnSpec, renames: &[Rename], current: &[ColumnInfo]) -> String {
    let find = |name: &str| {
        current
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.name.clone())
    };

    let source = find(&column.name).or_else(|| {
        renames
            .iter()
            .filter(|r| r.to == column.name)
            .find_map(|r| find(&r.from))
    });

    match source {
        Some(source) if column.not_null && !column.primary_key => {
            format!("COALESCE({}, {})", source, column.fill_expression())
        }
        Some(source) => source,
        None => column.fill_expression(),
    }
}

fn rebuild(
    tx: &Transaction<'_>,
    schema: &TableSchema,
    current: &[ColumnInfo],
    renames: &[Rename],
) -> Result<(), MigrationError> {
    let table = &schema.name;
    let shadow = format!("{}__shadow", table);
    let rebuild_err = |source| MigrationError::Rebuild {
        table: table.clone(),
        source,
    };

    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", shadow))
        .map_err(rebuild_err)?;
    tx.execute_batch(&schema.create_sql(&shadow, false))
        .map_err(rebuild_err)?;

    let targets = schema.column_names().join(", ");
    let sources: Vec<String> = schema
        .columns
        .iter()
        .map(|column| projection(column, renames, current))
        .collect();

    let copy_sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        shadow,
        targets,
        sources.join(", "),
        table
    );
    debug!(table = %table, sql = %copy_sql, "Copying rows into shadow table");
    let copied = tx.execute(&copy_sql, []).map_err(rebuild_err)?;

    tx.execute_batch(&format!("DROP TABLE {}", table))
        .map_err(rebuild_err)?;
    tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", shadow, table))
        .map_err(rebuild_err)?;

    info!(table = %table, rows = copied, "Rebuilt table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trees_v2() -> TableSchema {
        TableSchema::builder("trees")
            .version(2)
            .column(ColumnSpec::text("tree_id").primary_key())
            .column(ColumnSpec::text("form_uuid").unique())
            .column(ColumnSpec::text("tree_tracking_number").not_null())
            .column(ColumnSpec::real("dbh_cm"))
            .rename("planter_tracking_id", "tree_tracking_number", 2)
            .index("idx_trees_tracking_number", &["tree_tracking_number"])
            .build()
            .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_fresh_then_created() {
        let mut conn = Connection::open_in_memory().unwrap();
        let schema = trees_v2();

        assert_eq!(migrate(&mut conn, &schema).unwrap(), MigrationOutcome::Fresh);
        assert!(!catalog::table_exists(&conn, "trees").unwrap());

        assert_eq!(ensure_table(&mut conn, &schema).unwrap(), MigrationOutcome::Created);
        assert_eq!(
            catalog::column_names(&conn, "trees").unwrap(),
            vec!["tree_id", "form_uuid", "tree_tracking_number", "dbh_cm"]
        );
        assert_eq!(recorded_version(&conn, "trees").unwrap(), Some(2));
    }

    #[test]
    fn test_additive_backfills() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE trees (tree_id TEXT PRIMARY KEY, dbh_cm REAL);
             INSERT INTO trees VALUES ('JD001', 10.0), ('JD002', 12.5), ('JD003', NULL);",
        )
        .unwrap();

        let outcome = migrate(&mut conn, &trees_v2()).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Added {
                columns: vec!["form_uuid".to_string(), "tree_tracking_number".to_string()]
            }
        );

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM trees WHERE form_uuid IS NULL"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(DISTINCT form_uuid) FROM trees"), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM trees WHERE tree_tracking_number = ''"), 3);

        // Uniqueness is enforced for new writes
        let dup = conn.execute(
            "UPDATE trees SET form_uuid = (SELECT form_uuid FROM trees WHERE tree_id = 'JD001') WHERE tree_id = 'JD002'",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_second_run_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE trees (tree_id TEXT PRIMARY KEY, planter_tracking_id TEXT)")
            .unwrap();

        assert!(migrate(&mut conn, &trees_v2()).unwrap().changed());
        let first = catalog::columns_of(&conn, "trees").unwrap();

        assert_eq!(migrate(&mut conn, &trees_v2()).unwrap(), MigrationOutcome::UpToDate);
        assert_eq!(catalog::columns_of(&conn, "trees").unwrap(), first);
    }

    #[test]
    fn test_rebuild_applies_rename() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE trees (tree_id TEXT PRIMARY KEY, planter_tracking_id TEXT, dbh_cm REAL, form_uid TEXT);
             INSERT INTO trees VALUES ('JD001', 'TRK-1', 10.0, 'old-1'), ('JD002', NULL, 11.0, 'old-2');",
        )
        .unwrap();

        let outcome = migrate(&mut conn, &trees_v2()).unwrap();
        assert!(matches!(outcome, MigrationOutcome::Rebuilt { ref reasons } if reasons.len() == 2));

        assert_eq!(
            catalog::column_names(&conn, "trees").unwrap(),
            vec!["tree_id", "form_uuid", "tree_tracking_number", "dbh_cm"]
        );
        let tracking: String = conn
            .query_row("SELECT tree_tracking_number FROM trees WHERE tree_id = 'JD001'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tracking, "TRK-1");
        let tracking: String = conn
            .query_row("SELECT tree_tracking_number FROM trees WHERE tree_id = 'JD002'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tracking, "");
        assert_eq!(count(&conn, "SELECT COUNT(DISTINCT form_uuid) FROM trees"), 2);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'idx_trees_tracking_number'"),
            1
        );
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'trees__shadow'"), 0);
    }

    #[test]
    fn test_rename_not_replayed_after_recorded_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_table(&mut conn, &trees_v2()).unwrap();
        // A column reusing the legacy name after the table reached version 2
        conn.execute_batch(
            "DROP INDEX idx_trees_tracking_number;
             ALTER TABLE trees DROP COLUMN tree_tracking_number;
             ALTER TABLE trees ADD COLUMN planter_tracking_id TEXT;
             INSERT INTO trees (tree_id, form_uuid, dbh_cm, planter_tracking_id) VALUES ('JD001', 'f-1', 1.0, 'PLANTER-7');",
        )
        .unwrap();

        let outcome = migrate(&mut conn, &trees_v2()).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Rebuilt {
                reasons: vec![RebuildReason::ObsoleteColumn("planter_tracking_id".to_string())]
            }
        );
        let tracking: String = conn
            .query_row("SELECT tree_tracking_number FROM trees WHERE tree_id = 'JD001'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tracking, "");
    }

    #[test]
    fn test_failed_rebuild_leaves_table_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Duplicate form_uuid values cannot be copied into the UNIQUE column
        conn.execute_batch(
            "CREATE TABLE trees (tree_id TEXT PRIMARY KEY, planter_tracking_id TEXT, form_uuid TEXT, dbh_cm REAL);
             INSERT INTO trees VALUES ('JD001', 'TRK-1', 'same', 1.0), ('JD002', 'TRK-2', 'same', 2.0);",
        )
        .unwrap();
        let before_columns = catalog::columns_of(&conn, "trees").unwrap();

        let result = migrate(&mut conn, &trees_v2());
        assert!(matches!(result, Err(MigrationError::Rebuild { .. })));

        assert_eq!(catalog::columns_of(&conn, "trees").unwrap(), before_columns);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM trees"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'trees__shadow'"), 0);
        assert_eq!(recorded_version(&conn, "trees").unwrap(), None);
    }

    #[test]
    fn test_newer_recorded_version_is_kept() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure_table(&mut conn, &trees_v2()).unwrap();
        conn.execute("UPDATE schema_versions SET version = 9 WHERE table_name = 'trees'", [])
            .unwrap();

        assert_eq!(migrate(&mut conn, &trees_v2()).unwrap(), MigrationOutcome::UpToDate);
        assert_eq!(recorded_version(&conn, "trees").unwrap(), Some(9));
    }

    #[test]
    fn test_reinitialize_creates_missing_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        let schemas = tables::target_schemas().unwrap();

        reinitialize(&mut conn, &schemas).unwrap();
        reinitialize(&mut conn, &schemas).unwrap();

        for schema in &schemas {
            assert!(catalog::table_exists(&conn, &schema.name).unwrap(), "{}", schema.name);
        }
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM species"), 4);
    }
}
