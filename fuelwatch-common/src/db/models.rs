//! Row models for the fuelwatch database

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use sqlx::FromRow;

/// One raw telemetry snapshot as persisted by ingestion.
///
/// Append-only: rows are created once, only `processed` ever changes, and
/// nothing is deleted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RawSnapshot {
    pub id: i64,
    pub captured_at: NaiveDateTime,
    /// Raw feed line (a JSON object) exactly as received
    pub payload: String,
    pub content_hash: String,
    pub processed: bool,
    pub created_at: NaiveDateTime,
}

/// Inspection status values stored in `inspections.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionStatus {
    Approved,
    Rejected,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionStatus::Approved => "approved",
            InspectionStatus::Rejected => "rejected",
        }
    }
}

/// One inspection per cycle identity (cycle name, fuel element, start time)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Inspection {
    pub id: i64,
    pub cycle_name: String,
    pub fuel_element: String,
    pub started_at: NaiveDateTime,
    /// Derived identifier, `<cycle_name>-<fuel_element>`; also the folder
    /// name in the committed photo area
    pub product_code: String,
    pub status: String,
    pub defect_found: bool,
    /// Capture-time span of the constituent snapshots, used as the photo
    /// correlation window
    pub window_started_at: NaiveDateTime,
    pub window_ended_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Photo evidence linked to an inspection.
///
/// A row exists only once the backing file sits in the committed area;
/// `photo_path` is unique and doubles as the durable already-processed
/// check for staged files.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InspectionPhoto {
    pub id: i64,
    pub inspection_id: i64,
    /// Path relative to the committed photo area
    pub photo_path: String,
    pub caption: String,
    pub defect_found: bool,
    pub created_at: NaiveDateTime,
}

/// Running per-station counters, one row per station
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StationStats {
    pub station_id: String,
    pub total_inspections: i64,
    pub inspections_today: i64,
    /// Day the `inspections_today` counter belongs to
    pub stats_date: NaiveDate,
    pub defects_found: i64,
    /// Percentage of non-defective inspections; 0 when none recorded
    pub success_rate: f64,
    pub last_inspection_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}
