//! Typed target schema definitions
//!
//! Target schemas are declared in code as ordered lists of [`ColumnSpec`]s and
//! validated once when built. They are never persisted; the table's actual
//! column set is what migrations read back from SQLite.

use crate::error::SchemaError;

/// Declared SQLite column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Type affinity of a declared type, following SQLite's rules.
    ///
    /// Returns `None` for an empty declaration and for NUMERIC affinity, which
    /// has no counterpart here.
    pub fn affinity_of(declared: &str) -> Option<Self> {
        let declared = declared.trim().to_ascii_uppercase();
        if declared.is_empty() {
            None
        } else if declared.contains("INT") {
            Some(ColumnType::Integer)
        } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT") {
            Some(ColumnType::Text)
        } else if declared.contains("BLOB") {
            Some(ColumnType::Blob)
        } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB") {
            Some(ColumnType::Real)
        } else {
            None
        }
    }
}

/// One column of a target schema
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColumnType,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub unique: bool,
    pub not_null: bool,
    /// Raw SQL default expression, e.g. `'pending'` or `CURRENT_TIMESTAMP`
    pub default: Option<String>,
    /// Existing rows keep NULL instead of a random token when the column is
    /// introduced
    pub sparse: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            primary_key: false,
            autoincrement: false,
            unique: false,
            not_null: false,
            default: None,
            sparse: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.primary_key = true;
        self.autoincrement = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// UNIQUE among non-NULL values; rows that predate the column stay NULL
    pub fn unique_when_present(mut self) -> Self {
        self.unique = true;
        self.sparse = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// UNIQUE columns other than the primary key get random-token backfills
    pub fn needs_unique_backfill(&self) -> bool {
        self.unique && !self.primary_key && !self.sparse
    }

    /// Full column definition used by `CREATE TABLE`
    pub fn definition(&self) -> String {
        let mut def = format!("{} {}", self.name, self.col_type.as_sql());
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
            if self.autoincrement {
                def.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }
        if let Some(ref default) = self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }

    /// Column definition accepted by `ALTER TABLE ADD COLUMN`.
    ///
    /// SQLite refuses UNIQUE and PRIMARY KEY here, refuses NOT NULL without a
    /// default, and refuses non-constant defaults. Uniqueness is enforced by a
    /// separate index after backfilling.
    pub fn additive_definition(&self) -> String {
        let mut def = format!("{} {}", self.name, self.col_type.as_sql());
        let constant_default = self.default.as_deref().filter(|d| is_constant_default(d));
        if self.not_null {
            def.push_str(" NOT NULL DEFAULT ");
            def.push_str(constant_default.unwrap_or("''"));
        } else if let Some(default) = constant_default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }

    /// Projection for a column with no source in the old table
    pub fn fill_expression(&self) -> String {
        if self.needs_unique_backfill() {
            RANDOM_TOKEN_SQL.to_string()
        } else if self.not_null {
            self.default
                .clone()
                .filter(|d| is_constant_default(d))
                .unwrap_or_else(|| "''".to_string())
        } else {
            "NULL".to_string()
        }
    }
}

/// Per-row random token used to backfill UNIQUE columns
pub const RANDOM_TOKEN_SQL: &str = "lower(hex(randomblob(8)))";

fn is_constant_default(expr: &str) -> bool {
    let expr = expr.trim();
    !(expr.to_ascii_uppercase().starts_with("CURRENT_") || expr.starts_with('('))
}

/// A column rename introduced at a schema version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: String,
    pub since_version: u32,
}

/// Secondary index kept alongside a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
}

/// Validated target schema for one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub version: u32,
    pub columns: Vec<ColumnSpec>,
    pub renames: Vec<Rename>,
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            name: name.into(),
            version: 1,
            columns: Vec::new(),
            renames: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// First old column name a target column is renamed from, if any
    pub fn renamed_from(&self, column: &str) -> Option<&str> {
        self.renames
            .iter()
            .find(|r| r.to == column)
            .map(|r| r.from.as_str())
    }

    /// Renames still to apply to a table last migrated at `recorded`.
    /// Unversioned tables get all of them.
    pub fn pending_renames(&self, recorded: Option<u32>) -> Vec<Rename> {
        self.renames
            .iter()
            .filter(|r| recorded.map_or(true, |v| v < r.since_version))
            .cloned()
            .collect()
    }

    /// `CREATE TABLE` statement for this schema under `table_name`
    pub fn create_sql(&self, table_name: &str, if_not_exists: bool) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| c.definition()).collect();
        format!(
            "CREATE TABLE {}{} (\n    {}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            table_name,
            columns.join(",\n    ")
        )
    }

    pub fn unique_index_name(&self, column: &str) -> String {
        format!("uq_{}_{}", self.name, column)
    }
}

/// Builder for [`TableSchema`]; `build` validates
pub struct TableSchemaBuilder {
    name: String,
    version: u32,
    columns: Vec<ColumnSpec>,
    renames: Vec<Rename>,
    indexes: Vec<IndexSpec>,
}

impl TableSchemaBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn rename(mut self, from: &str, to: &str, since_version: u32) -> Self {
        self.renames.push(Rename {
            from: from.to_string(),
            to: to.to_string(),
            since_version,
        });
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn build(self) -> Result<TableSchema, SchemaError> {
        let invalid = |reason: String| SchemaError::Invalid {
            table: self.name.clone(),
            reason,
        };

        if !is_identifier(&self.name) {
            return Err(invalid(format!("table name {:?} is not a plain identifier", self.name)));
        }
        if self.columns.is_empty() {
            return Err(invalid("no columns".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return Err(invalid(format!("column name {:?} is not a plain identifier", column.name)));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate column {}", column.name)));
            }
            if column.autoincrement && column.col_type != ColumnType::Integer {
                return Err(invalid(format!("AUTOINCREMENT on non-INTEGER column {}", column.name)));
            }
        }

        if self.columns.iter().filter(|c| c.primary_key).count() > 1 {
            return Err(invalid("more than one PRIMARY KEY column".to_string()));
        }

        for rename in &self.renames {
            if !is_identifier(&rename.from) {
                return Err(invalid(format!("rename source {:?} is not a plain identifier", rename.from)));
            }
            if !seen.contains(&rename.to.to_ascii_lowercase()) {
                return Err(invalid(format!("rename target {} is not a column", rename.to)));
            }
            if seen.contains(&rename.from.to_ascii_lowercase()) {
                return Err(invalid(format!("rename source {} is still a column", rename.from)));
            }
            if rename.since_version > self.version {
                return Err(invalid(format!(
                    "rename {} -> {} is newer than schema version {}",
                    rename.from, rename.to, self.version
                )));
            }
        }

        for index in &self.indexes {
            if !is_identifier(&index.name) || index.columns.is_empty() {
                return Err(invalid(format!("bad index {:?}", index.name)));
            }
            if let Some(missing) = index
                .columns
                .iter()
                .find(|c| !seen.contains(&c.to_ascii_lowercase()))
            {
                return Err(invalid(format!("index {} references unknown column {}", index.name, missing)));
            }
        }

        Ok(TableSchema {
            name: self.name,
            version: self.version,
            columns: self.columns,
            renames: self.renames,
            indexes: self.indexes,
        })
    }
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
