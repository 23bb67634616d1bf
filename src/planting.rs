//! Locally-originated planting records
//!
//! A planting submission becomes a `trees` row with an allocated identifier,
//! a CO2 estimate and no remote provenance. Resubmitting the same submission
//! key updates the same row.

use std::f64::consts::PI;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator::{Identifier, SequenceAllocator};
use crate::db::LocalStore;
use crate::error::StoreError;

/// Inputs to a carbon estimate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeMeasurement {
    pub diameter_cm: Option<f64>,
    pub height_m: Option<f64>,
    pub species: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// CO2 estimate for a single tree, in kilograms
pub trait CarbonModel: Send + Sync {
    fn co2_kg(&self, measurement: &TreeMeasurement) -> f64;
}

/// Stem volume times a fixed wood density, carbon fraction and CO2 ratio
#[derive(Debug, Clone, Copy)]
pub struct BasicVolumeModel {
    /// kg/m³
    pub wood_density: f64,
    pub carbon_fraction: f64,
}

/// Mass ratio of CO2 to carbon
const CO2_PER_CARBON: f64 = 3.67;

impl Default for BasicVolumeModel {
    fn default() -> Self {
        Self {
            wood_density: 600.0,
            carbon_fraction: 0.5,
        }
    }
}

impl CarbonModel for BasicVolumeModel {
    fn co2_kg(&self, m: &TreeMeasurement) -> f64 {
        match (m.diameter_cm, m.height_m) {
            (Some(d), Some(h)) if d > 0.0 && h > 0.0 => {
                let radius_m = d / 200.0;
                let volume_m3 = PI * radius_m * radius_m * h;
                volume_m3 * self.wood_density * self.carbon_fraction * CO2_PER_CARBON
            }
            _ => 0.0,
        }
    }
}

/// A planting as submitted from the field
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlantingSubmission {
    /// External submission id; resubmissions reuse the identifier
    pub submission_key: String,
    pub planters_name: String,
    pub tree_tracking_number: Option<String>,
    pub institution: Option<String>,
    pub local_name: Option<String>,
    pub scientific_name: Option<String>,
    pub planter_email: Option<String>,
    pub planter_uid: Option<String>,
    pub date_planted: Option<String>,
    pub tree_stage: Option<String>,
    pub status: Option<String>,
    pub rcd_cm: Option<f64>,
    pub dbh_cm: Option<f64>,
    pub height_m: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
    pub county: Option<String>,
    pub sub_county: Option<String>,
    pub ward: Option<String>,
    pub kobo_submission_id: Option<String>,
}

/// The stored result of a planting
#[derive(Debug, Clone, Serialize)]
pub struct PlantedTree {
    pub tree_id: Identifier,
    pub tree_tracking_number: String,
    pub date_planted: String,
    pub co2_kg: f64,
}

/// Turns submissions into `trees` rows
pub struct PlantingRecorder {
    store: Arc<LocalStore>,
    allocator: Arc<SequenceAllocator>,
    carbon: Arc<dyn CarbonModel>,
}

impl PlantingRecorder {
    pub fn new(store: Arc<LocalStore>, allocator: Arc<SequenceAllocator>, carbon: Arc<dyn CarbonModel>) -> Self {
        Self {
            store,
            allocator,
            carbon,
        }
    }

    /// Allocate an identifier for `submission` and persist it.
    ///
    /// Blocking, like [`SequenceAllocator::allocate`].
    pub fn record(&self, submission: &PlantingSubmission) -> Result<PlantedTree, StoreError> {
        let tree_id = self
            .allocator
            .allocate(&submission.planters_name, &submission.submission_key)?;

        let tracking = non_empty(&submission.tree_tracking_number).unwrap_or("UNKNOWN").to_string();
        let date_planted = normalize_date(submission.date_planted.as_deref());
        let co2_kg = self.carbon.co2_kg(&TreeMeasurement {
            diameter_cm: submission.dbh_cm,
            height_m: submission.height_m,
            species: submission.scientific_name.clone(),
            latitude: submission.latitude,
            longitude: submission.longitude,
        });
        let now = Utc::now().to_rfc3339();

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trees (
                    tree_id, form_uuid, tree_tracking_number, institution, local_name,
                    scientific_name, planters_name, planter_email, planter_uid, date_planted,
                    tree_stage, rcd_cm, dbh_cm, height_m, co2_kg, status, kobo_submission_id,
                    last_updated, country, county, sub_county, ward, latitude, longitude
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                ON CONFLICT(tree_id) DO UPDATE SET
                    tree_tracking_number = excluded.tree_tracking_number,
                    institution = excluded.institution,
                    local_name = excluded.local_name,
                    scientific_name = excluded.scientific_name,
                    planters_name = excluded.planters_name,
                    planter_email = excluded.planter_email,
                    planter_uid = excluded.planter_uid,
                    date_planted = excluded.date_planted,
                    tree_stage = excluded.tree_stage,
                    rcd_cm = excluded.rcd_cm,
                    dbh_cm = excluded.dbh_cm,
                    height_m = excluded.height_m,
                    co2_kg = excluded.co2_kg,
                    status = excluded.status,
                    kobo_submission_id = excluded.kobo_submission_id,
                    last_updated = excluded.last_updated,
                    country = excluded.country,
                    county = excluded.county,
                    sub_county = excluded.sub_county,
                    ward = excluded.ward,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude",
                params![
                    tree_id.as_str(),
                    submission.submission_key.trim(),
                    tracking,
                    submission.institution,
                    non_empty(&submission.local_name).unwrap_or("Unknown"),
                    non_empty(&submission.scientific_name).unwrap_or("Unknown"),
                    submission.planters_name.trim(),
                    submission.planter_email,
                    submission.planter_uid,
                    date_planted,
                    submission.tree_stage,
                    submission.rcd_cm,
                    submission.dbh_cm,
                    submission.height_m,
                    co2_kg,
                    submission.status,
                    submission.kobo_submission_id,
                    now,
                    submission.country,
                    submission.county,
                    submission.sub_county,
                    submission.ward,
                    submission.latitude,
                    submission.longitude,
                ],
            )
        })?;

        info!(tree_id = %tree_id, tracking = %tracking, co2_kg, "Recorded planting");
        Ok(PlantedTree {
            tree_id,
            tree_tracking_number: tracking,
            date_planted,
            co2_kg,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// `YYYY-MM-DD` from a date or datetime string; today when absent or unparseable
pub(crate) fn normalize_date(raw: Option<&str>) -> String {
    let today = || Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return today();
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.date_naive().format("%Y-%m-%d").to_string();
    }
    // Accept a datetime without offset, or a bare date
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => today(),
    }
}
