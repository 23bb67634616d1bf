//! Follow-up measurements of planted trees
//!
//! A monitoring submission appends a `monitoring_history` row and refreshes
//! the tree's latest measurements in the same transaction. Each submission id
//! is applied at most once.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::LocalStore;
use crate::error::MonitoringError;
use crate::planting::{normalize_date, CarbonModel, TreeMeasurement};

/// A measurement as submitted from the field
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitoringSubmission {
    pub submission_id: String,
    pub tree_id: String,
    /// When present it must match the tree's stored tracking number
    pub tree_tracking_number: Option<String>,
    pub dbh_cm: Option<f64>,
    pub rcd_cm: Option<f64>,
    pub height_m: Option<f64>,
    pub monitor_status: Option<String>,
    pub monitor_stage: Option<String>,
    pub notes: Option<String>,
    pub monitor_date: Option<String>,
}

/// The stored result of a measurement
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitoringRecord {
    pub tree_id: String,
    pub submission_id: String,
    pub monitor_date: String,
    pub diameter_cm: Option<f64>,
    pub height_m: Option<f64>,
    pub co2_kg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MonitoringOutcome {
    Recorded(MonitoringRecord),
    /// The submission id was applied before; nothing changed
    AlreadyProcessed { tree_id: String },
}

struct StoredTree {
    tracking: String,
    species: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Applies monitoring submissions to `trees` and `monitoring_history`
pub struct MonitoringRecorder {
    store: Arc<LocalStore>,
    carbon: Arc<dyn CarbonModel>,
}

impl MonitoringRecorder {
    pub fn new(store: Arc<LocalStore>, carbon: Arc<dyn CarbonModel>) -> Self {
        Self { store, carbon }
    }

    /// Record `submission` against its tree. Blocking.
    ///
    /// DBH is preferred for the diameter; RCD is used when DBH is absent or
    /// zero. Without both a diameter and a height no CO2 estimate is made and
    /// the tree keeps its previous one.
    pub fn record(&self, submission: &MonitoringSubmission) -> Result<MonitoringOutcome, MonitoringError> {
        let submission_id = submission.submission_id.trim();
        let tree_id = submission.tree_id.trim();
        if submission_id.is_empty() {
            return Err(MonitoringError::MissingField("submission_id"));
        }
        if tree_id.is_empty() {
            return Err(MonitoringError::MissingField("tree_id"));
        }

        self.store.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let applied: Option<String> = tx
                .query_row(
                    "SELECT tree_id FROM monitoring_history WHERE submission_id = ?1",
                    params![submission_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(tree_id) = applied {
                debug!(submission_id, tree_id = %tree_id, "Monitoring submission already applied");
                return Ok(MonitoringOutcome::AlreadyProcessed { tree_id });
            }

            let tree = tx
                .query_row(
                    "SELECT tree_tracking_number, scientific_name, latitude, longitude FROM trees WHERE tree_id = ?1",
                    params![tree_id],
                    |row| {
                        Ok(StoredTree {
                            tracking: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                            species: row.get(1)?,
                            latitude: row.get(2)?,
                            longitude: row.get(3)?,
                        })
                    },
                )
                .optional()?
                .ok_or_else(|| MonitoringError::TreeNotFound(tree_id.to_string()))?;

            if let Some(claimed) = submission
                .tree_tracking_number
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                if !claimed.eq_ignore_ascii_case(tree.tracking.trim()) {
                    return Err(MonitoringError::TrackingMismatch {
                        tree_id: tree_id.to_string(),
                        claimed: claimed.to_string(),
                    });
                }
            }

            let diameter_cm = submission.dbh_cm.filter(|d| *d != 0.0).or(submission.rcd_cm);
            let co2_kg = match (diameter_cm, submission.height_m) {
                (Some(_), Some(_)) => Some(self.carbon.co2_kg(&TreeMeasurement {
                    diameter_cm,
                    height_m: submission.height_m,
                    species: tree.species,
                    latitude: tree.latitude,
                    longitude: tree.longitude,
                })),
                _ => {
                    warn!(tree_id, submission_id, "Missing diameter or height, no CO2 estimate");
                    None
                }
            };

            let monitor_date = normalize_date(submission.monitor_date.as_deref());
            let now = Utc::now().to_rfc3339();

            tx.execute(
                "INSERT INTO monitoring_history (
                    tree_id, submission_id, monitor_date, monitor_status, monitor_stage,
                    height_m, dbh_cm, rcd_cm, co2_kg, notes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    tree_id,
                    submission_id,
                    monitor_date,
                    submission.monitor_status,
                    submission.monitor_stage,
                    submission.height_m,
                    diameter_cm,
                    submission.rcd_cm,
                    co2_kg,
                    submission.notes,
                ],
            )?;
            tx.execute(
                "UPDATE trees SET
                    dbh_cm = COALESCE(?2, dbh_cm),
                    height_m = COALESCE(?3, height_m),
                    co2_kg = COALESCE(?4, co2_kg),
                    tree_stage = COALESCE(?5, tree_stage),
                    last_monitored_at = ?6,
                    last_updated = ?6
                 WHERE tree_id = ?1",
                params![tree_id, diameter_cm, submission.height_m, co2_kg, submission.monitor_stage, now],
            )?;
            tx.commit()?;

            info!(tree_id, submission_id, co2_kg = ?co2_kg, "Recorded monitoring");
            Ok(MonitoringOutcome::Recorded(MonitoringRecord {
                tree_id: tree_id.to_string(),
                submission_id: submission_id.to_string(),
                monitor_date,
                diameter_cm,
                height_m: submission.height_m,
                co2_kg,
            }))
        })
    }
}
