//! Schema introspection
//!
//! Reads a table's live column set and diffs it against a [`TableSchema`].

use rusqlite::{params, Connection};

use super::schema::{ColumnSpec, ColumnType, Rename, TableSchema};
use crate::error::SchemaError;

/// One column as SQLite reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// Why additive `ALTER TABLE` steps cannot reach the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    /// Old column present, its new name absent
    RenamePending { from: String, to: String },
    /// Column present locally but not in the target
    ObsoleteColumn(String),
    TypeChanged {
        column: String,
        from: String,
        to: ColumnType,
    },
    /// SQLite cannot add a PRIMARY KEY column
    PrimaryKeyMissing(String),
}

impl std::fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebuildReason::RenamePending { from, to } => write!(f, "rename {} -> {}", from, to),
            RebuildReason::ObsoleteColumn(column) => write!(f, "drop {}", column),
            RebuildReason::TypeChanged { column, from, to } => {
                write!(f, "retype {} {} -> {}", column, from, to.as_sql())
            }
            RebuildReason::PrimaryKeyMissing(column) => write!(f, "add primary key {}", column),
        }
    }
}

/// Difference between a live table and its target schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDelta {
    /// Target columns absent from the table, in schema order
    pub missing: Vec<ColumnSpec>,
    pub rebuild_reasons: Vec<RebuildReason>,
}

impl SchemaDelta {
    pub fn requires_rebuild(&self) -> bool {
        !self.rebuild_reasons.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.rebuild_reasons.is_empty()
    }
}

/// Check whether a table exists
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, SchemaError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Existing columns of `table`, in declaration order
pub fn columns_of(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, SchemaError> {
    if !table_exists(conn, table)? {
        return Err(SchemaError::TableMissing(table.to_string()));
    }

    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                primary_key: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(columns)
}

/// Existing column names of `table`, in declaration order
pub fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, SchemaError> {
    Ok(columns_of(conn, table)?.into_iter().map(|c| c.name).collect())
}

fn find<'a>(current: &'a [ColumnInfo], name: &str) -> Option<&'a ColumnInfo> {
    current.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Diff the live columns against the target schema, applying every rename
pub fn delta(current: &[ColumnInfo], schema: &TableSchema) -> SchemaDelta {
    delta_with_renames(current, schema, &schema.renames)
}

/// Diff the live columns against the target schema, considering only
/// `renames` as pending
pub fn delta_with_renames(current: &[ColumnInfo], schema: &TableSchema, renames: &[Rename]) -> SchemaDelta {
    let mut delta = SchemaDelta::default();

    for rename in renames {
        if find(current, &rename.from).is_some() && find(current, &rename.to).is_none() {
            delta.rebuild_reasons.push(RebuildReason::RenamePending {
                from: rename.from.clone(),
                to: rename.to.clone(),
            });
        }
    }

    for column in current {
        let pending_rename = delta.rebuild_reasons.iter().any(|r| {
            matches!(r, RebuildReason::RenamePending { from, .. } if from.eq_ignore_ascii_case(&column.name))
        });
        let in_target = schema
            .columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&column.name));
        if !in_target && !pending_rename {
            delta
                .rebuild_reasons
                .push(RebuildReason::ObsoleteColumn(column.name.clone()));
        }
    }

    for spec in &schema.columns {
        match find(current, &spec.name) {
            Some(existing) => {
                if let Some(affinity) = ColumnType::affinity_of(&existing.declared_type) {
                    if affinity != spec.col_type {
                        delta.rebuild_reasons.push(RebuildReason::TypeChanged {
                            column: spec.name.clone(),
                            from: existing.declared_type.clone(),
                            to: spec.col_type,
                        });
                    }
                }
            }
            None => {
                if spec.primary_key {
                    delta
                        .rebuild_reasons
                        .push(RebuildReason::PrimaryKeyMissing(spec.name.clone()));
                }
                delta.missing.push(spec.clone());
            }
        }
    }

    delta
}
