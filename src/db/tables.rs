//! Target schemas for every local table
//!
//! Bump a table's version whenever its column list changes; add a rename
//! entry when a column is renamed so the migration copies the old data across.

use rusqlite::{params, Connection};
use tracing::info;

use super::schema::{ColumnSpec, TableSchema};
use crate::error::SchemaError;

pub const TREES: &str = "trees";
pub const USERS: &str = "users";
pub const PENDING_USERS: &str = "pending_users";
pub const INSTITUTIONS: &str = "institutions";
pub const SEQUENCES: &str = "sequences";
pub const SUBMISSION_IDS: &str = "submission_ids";
pub const SPECIES: &str = "species";
pub const MONITORING_HISTORY: &str = "monitoring_history";

/// Provenance columns carried by every mirrored table
pub const REMOTE_DOC_ID: &str = "remote_doc_id";
pub const LAST_SYNC_TIME: &str = "last_sync_time";

/// All target schemas in creation order
pub fn target_schemas() -> Result<Vec<TableSchema>, SchemaError> {
    Ok(vec![
        trees()?,
        users()?,
        pending_users()?,
        institutions()?,
        sequences()?,
        submission_ids()?,
        species()?,
        monitoring_history()?,
    ])
}

pub fn trees() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(TREES)
        .version(3)
        .column(ColumnSpec::text("tree_id").primary_key())
        .column(ColumnSpec::text("form_uuid").unique())
        .column(ColumnSpec::text("tree_tracking_number").not_null())
        .column(ColumnSpec::text("institution"))
        .column(ColumnSpec::text("local_name"))
        .column(ColumnSpec::text("scientific_name"))
        .column(ColumnSpec::text("planter_id"))
        .column(ColumnSpec::text("planters_name"))
        .column(ColumnSpec::text("planter_email"))
        .column(ColumnSpec::text("planter_uid"))
        .column(ColumnSpec::text("date_planted"))
        .column(ColumnSpec::text("tree_stage"))
        .column(ColumnSpec::real("rcd_cm"))
        .column(ColumnSpec::real("dbh_cm"))
        .column(ColumnSpec::real("height_m"))
        .column(ColumnSpec::real("co2_kg"))
        .column(ColumnSpec::text("status"))
        .column(ColumnSpec::text("qr_code"))
        .column(ColumnSpec::text("kobo_submission_id").unique())
        .column(ColumnSpec::text("last_updated"))
        .column(ColumnSpec::text("last_monitored_at"))
        .column(ColumnSpec::text("country"))
        .column(ColumnSpec::text("county"))
        .column(ColumnSpec::text("sub_county"))
        .column(ColumnSpec::text("ward"))
        .column(ColumnSpec::text("adopter_name"))
        .column(ColumnSpec::text("organization_name"))
        .column(ColumnSpec::real("latitude"))
        .column(ColumnSpec::real("longitude"))
        .column(ColumnSpec::text(REMOTE_DOC_ID).unique_when_present())
        .column(ColumnSpec::text(LAST_SYNC_TIME))
        .rename("planter_tracking_id", "tree_tracking_number", 2)
        .rename("treeTrackingNumber", "tree_tracking_number", 2)
        .rename("firebase_doc_id", REMOTE_DOC_ID, 2)
        .index("idx_trees_tracking_number", &["tree_tracking_number"])
        .index("idx_trees_planter_uid", &["planter_uid"])
        .index("idx_trees_institution", &["institution"])
        .build()
}

pub fn users() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(USERS)
        .version(2)
        .column(ColumnSpec::text("uid").primary_key())
        .column(ColumnSpec::text("email").not_null())
        .column(ColumnSpec::text("display_name"))
        .column(ColumnSpec::text("institution"))
        .column(ColumnSpec::text("role").default_sql("'individual'"))
        .column(ColumnSpec::text("status").default_sql("'pending'"))
        .column(ColumnSpec::text("tree_tracking_number"))
        .column(ColumnSpec::text("created_at"))
        .column(ColumnSpec::text("approved_at"))
        .column(ColumnSpec::text(REMOTE_DOC_ID).unique_when_present())
        .column(ColumnSpec::text(LAST_SYNC_TIME))
        .rename("fullName", "display_name", 2)
        .rename("treeTrackingNumber", "tree_tracking_number", 2)
        .rename("createdAt", "created_at", 2)
        .rename("approvedAt", "approved_at", 2)
        .rename("firebase_doc_id", REMOTE_DOC_ID, 2)
        .index("idx_users_tracking_number", &["tree_tracking_number"])
        .build()
}

pub fn pending_users() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(PENDING_USERS)
        .version(2)
        .column(ColumnSpec::integer("id").autoincrement())
        .column(ColumnSpec::text("full_name"))
        .column(ColumnSpec::text("email").unique())
        .column(ColumnSpec::text("uid").unique())
        .column(ColumnSpec::text("role"))
        .column(ColumnSpec::text("created_at").default_sql("CURRENT_TIMESTAMP"))
        .rename("fullName", "full_name", 2)
        .build()
}

pub fn institutions() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(INSTITUTIONS)
        .version(2)
        .column(ColumnSpec::text("id").primary_key())
        .column(ColumnSpec::text("name").not_null())
        .column(ColumnSpec::text("join_date").not_null())
        .column(ColumnSpec::text("status"))
        .column(ColumnSpec::text(REMOTE_DOC_ID).unique_when_present())
        .column(ColumnSpec::text(LAST_SYNC_TIME))
        .rename("fullName", "name", 2)
        .rename("firebase_doc_id", REMOTE_DOC_ID, 2)
        .build()
}

pub fn sequences() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(SEQUENCES)
        .column(ColumnSpec::text("prefix").primary_key())
        .column(ColumnSpec::integer("next_val").not_null().default_sql("1"))
        .build()
}

/// Ledger of identifiers handed out per external submission key
pub fn submission_ids() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(SUBMISSION_IDS)
        .column(ColumnSpec::text("submission_key").primary_key())
        .column(ColumnSpec::text("identifier").not_null().unique())
        .column(ColumnSpec::text("prefix").not_null())
        .column(ColumnSpec::text("allocated_at").not_null())
        .index("idx_submission_ids_prefix", &["prefix"])
        .build()
}

pub fn species() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(SPECIES)
        .column(ColumnSpec::text("scientific_name").primary_key())
        .column(ColumnSpec::text("local_name"))
        .column(ColumnSpec::real("wood_density"))
        .column(ColumnSpec::text("benefits"))
        .build()
}

pub fn monitoring_history() -> Result<TableSchema, SchemaError> {
    TableSchema::builder(MONITORING_HISTORY)
        .version(3)
        .column(ColumnSpec::integer("id").autoincrement())
        .column(ColumnSpec::text("tree_id"))
        // Field form submission this measurement came from
        .column(ColumnSpec::text("submission_id").unique_when_present())
        .column(ColumnSpec::text("monitor_date"))
        .column(ColumnSpec::text("monitor_status"))
        .column(ColumnSpec::text("monitor_stage"))
        .column(ColumnSpec::real("height_m"))
        .column(ColumnSpec::real("dbh_cm"))
        .column(ColumnSpec::real("rcd_cm"))
        .column(ColumnSpec::real("co2_kg"))
        .column(ColumnSpec::text("notes"))
        .index("idx_monitoring_history_tree_id", &["tree_id"])
        .build()
}

/// Species every fresh store starts with
const DEFAULT_SPECIES: &[(&str, &str, f64, &str)] = &[
    ("Acacia spp.", "Acacia", 0.65, "Drought-resistant, nitrogen-fixing, provides shade"),
    ("Eucalyptus spp.", "Eucalyptus", 0.55, "Fast-growing, timber production, medicinal uses"),
    ("Mangifera indica", "Mango", 0.50, "Fruit production, shade tree, ornamental"),
    ("Azadirachta indica", "Neem", 0.60, "Medicinal properties, insect repellent, drought-resistant"),
];

/// Insert the default species when the table is empty
pub fn seed_species(conn: &Connection) -> Result<usize, rusqlite::Error> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM species", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(0);
    }

    let mut stmt = conn.prepare(
        "INSERT INTO species (scientific_name, local_name, wood_density, benefits) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (scientific_name, local_name, density, benefits) in DEFAULT_SPECIES {
        stmt.execute(params![scientific_name, local_name, density, benefits])?;
    }
    info!(count = DEFAULT_SPECIES.len(), "Seeded default species");
    Ok(DEFAULT_SPECIES.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schemas_validate() {
        let schemas = target_schemas().unwrap();
        assert_eq!(schemas.len(), 8);

        let mut names: Vec<_> = schemas.iter().map(|s| s.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_trees_schema_shape() {
        let trees = trees().unwrap();
        assert_eq!(trees.columns.len(), 31);
        assert_eq!(trees.version, 3);
        assert!(trees.column("last_monitored_at").is_some());
        assert_eq!(trees.primary_key().unwrap().name, "tree_id");
        assert_eq!(trees.renamed_from("tree_tracking_number"), Some("planter_tracking_id"));
        assert!(trees.column(REMOTE_DOC_ID).unwrap().unique);
        assert!(!trees.column(REMOTE_DOC_ID).unwrap().needs_unique_backfill());
        assert!(trees.column("tree_tracking_number").unwrap().not_null);
    }

    #[test]
    fn test_monitoring_history_keyed_by_submission() {
        let history = monitoring_history().unwrap();
        let submission = history.column("submission_id").unwrap();
        assert!(submission.unique);
        assert!(!submission.needs_unique_backfill());
    }

    #[test]
    fn test_seed_species_once() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&species().unwrap().create_sql(SPECIES, false)).unwrap();

        assert_eq!(seed_species(&conn).unwrap(), 4);
        assert_eq!(seed_species(&conn).unwrap(), 0);
    }
}
