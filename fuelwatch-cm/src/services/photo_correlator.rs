//! Photo correlation and two-phase relocation
//!
//! Staged files carry their correlation key in the file name:
//! `<cycle>_<pointer>_<OK|NOK>_<fuel-element>_<DDMMYYHHMMSS>.<ext>`. A file
//! attaches to a cycle only when every field agrees — cycle name, fuel
//! element, a constituent row with the same pointer id and defect flag, and
//! a capture time inside the cycle's padded window.
//!
//! Write ordering is fixed: the file is moved into the committed area
//! FIRST, the database record is created second. A crash in between leaves
//! a file with no record, which [`PhotoCorrelator::reconcile`] repairs on
//! the next tick; a record pointing at a missing file can never exist.
//!
//! Whether a staged file was already handled is decided by the UNIQUE
//! `photo_path` column, not by any in-memory set — restarts need no
//! reconstruction.

use chrono::Duration;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use fuelwatch_common::db::models::{Inspection, InspectionStatus};
use fuelwatch_common::{FuelwatchConfig, Result};

use crate::services::cycle_segmenter::Cycle;
use crate::services::stats_updater;
use crate::types::{
    key_eq, product_code, SnapshotPayload, StagedPhotoName, FIELD_CYCLE_NAME, FIELD_DEFECT,
    FIELD_FUEL_ELEMENT, FIELD_POINTER_ID,
};

/// A staging file whose name parsed cleanly
#[derive(Debug, Clone)]
pub struct StagedPhoto {
    pub path: PathBuf,
    pub name: StagedPhotoName,
}

/// Result of the end-of-tick staging sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Late photos attached to an existing inspection
    pub recovered: usize,
    /// Parsed files matching nothing; left in staging
    pub unmatched: usize,
}

/// Photo Correlator
pub struct PhotoCorrelator {
    db: SqlitePool,
    staging_dir: PathBuf,
    committed_dir: PathBuf,
    window_slack: Duration,
    station_id: String,
}

impl PhotoCorrelator {
    pub fn new(db: SqlitePool, config: &FuelwatchConfig) -> Self {
        Self {
            db,
            staging_dir: config.staging_dir.clone(),
            committed_dir: config.committed_dir.clone(),
            window_slack: Duration::seconds(config.photo_window_slack_secs),
            station_id: config.station_id.clone(),
        }
    }

    /// Attach every matching staged photo to the inspection.
    ///
    /// Returns the number of photos linked. Non-matching files are left
    /// alone here; the end-of-tick sweep decides what is truly unmatched.
    pub async fn correlate(&self, cycle: &Cycle, inspection: &Inspection) -> Result<usize> {
        let mut linked = 0;
        for photo in self.scan_staging().await? {
            if !self.matches_cycle(&photo.name, cycle) {
                continue;
            }
            let rel = relative_path(&inspection.product_code, &photo.name.file_name);
            if self.is_recorded(&rel).await? {
                tracing::debug!(file = %photo.name.file_name, "Photo already recorded, skipping");
                continue;
            }
            if self.attach(inspection, &photo).await? {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Does any unrecorded staged photo match this cycle?
    ///
    /// The match-first inspection policy probes with this before anything
    /// is created.
    pub async fn staging_has_match(&self, cycle: &Cycle) -> Result<bool> {
        let Some(key) = cycle.natural_key() else {
            return Ok(false);
        };
        let code = product_code(&key.cycle_name, &key.fuel_element);
        for photo in self.scan_staging().await? {
            if !self.matches_cycle(&photo.name, cycle) {
                continue;
            }
            if self.is_recorded(&relative_path(&code, &photo.name.file_name)).await? {
                continue;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// End-of-tick sweep over staging: attach late arrivals to existing
    /// inspections, flag what matches nothing.
    ///
    /// Matching is as strict as [`Self::correlate`]: candidate inspections
    /// come from the (cycle name, fuel element, window) query, then the
    /// snapshots inside the candidate's window must contain a row with the
    /// photo's pointer id and defect flag. The row store is append-only, so
    /// those rows are still there.
    pub async fn sweep_staging(&self) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        for photo in self.scan_staging().await? {
            match self.find_inspection_for(&photo.name).await? {
                Some(inspection) => {
                    let rel = relative_path(&inspection.product_code, &photo.name.file_name);
                    if self.is_recorded(&rel).await? {
                        continue;
                    }
                    if self.attach(&inspection, &photo).await? {
                        tracing::info!(
                            inspection = inspection.id,
                            file = %photo.name.file_name,
                            "Late photo recovered from staging"
                        );
                        outcome.recovered += 1;
                    }
                }
                None => {
                    tracing::warn!(
                        file = %photo.name.file_name,
                        "photo_unmatched: no inspection matches; leaving in staging"
                    );
                    outcome.unmatched += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Repair the crash window: committed files without a record.
    ///
    /// Walks the committed area and inserts the missing `inspection_photos`
    /// row for any file the move completed but the record never reached.
    /// Idempotent — the UNIQUE path makes re-runs no-ops.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut repaired = 0;
        if !self.committed_dir.exists() {
            return Ok(repaired);
        }

        let mut dirs = tokio::fs::read_dir(&self.committed_dir).await?;
        while let Some(dir_entry) = dirs.next_entry().await? {
            if !dir_entry.file_type().await?.is_dir() {
                continue;
            }
            let code = dir_entry.file_name().to_string_lossy().to_string();

            let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                if !file_entry.file_type().await?.is_file() {
                    continue;
                }
                let file_name = file_entry.file_name().to_string_lossy().to_string();
                let rel = relative_path(&code, &file_name);
                if self.is_recorded(&rel).await? {
                    continue;
                }

                // File present, record missing: the move landed but the
                // insert never did.
                let Ok(name) = StagedPhotoName::parse(&file_name) else {
                    tracing::warn!(
                        path = %rel,
                        "photo_orphaned: unrecorded committed file with unparseable name"
                    );
                    continue;
                };
                match self.find_inspection_by_code(&code, &name).await? {
                    Some(inspection) => {
                        let caption = format!(
                            "Cycle {} pointer {}",
                            inspection.cycle_name, name.pointer_id
                        );
                        self.record_photo(inspection.id, &rel, &caption, name.defect)
                            .await?;
                        if name.defect {
                            self.escalate_defect(inspection.id).await?;
                        }
                        tracing::info!(
                            inspection = inspection.id,
                            path = %rel,
                            "Repaired orphaned photo move"
                        );
                        repaired += 1;
                    }
                    None => {
                        tracing::warn!(
                            path = %rel,
                            "photo_orphaned: no inspection claims this committed file"
                        );
                    }
                }
            }
        }
        Ok(repaired)
    }

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------

    /// List staging files with parseable names.
    ///
    /// Files that fail to parse are logged and left exactly where they are;
    /// nothing in staging is ever deleted.
    async fn scan_staging(&self) -> Result<Vec<StagedPhoto>> {
        let mut photos = Vec::new();
        if !self.staging_dir.exists() {
            return Ok(photos);
        }

        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            match StagedPhotoName::parse(&file_name) {
                Ok(name) => photos.push(StagedPhoto {
                    path: entry.path(),
                    name,
                }),
                Err(e) => {
                    tracing::warn!(
                        file = %file_name,
                        error = %e,
                        "photo_unparsed: staged file does not follow the naming convention"
                    );
                }
            }
        }
        // Stable processing order regardless of directory iteration
        photos.sort_by(|a, b| a.name.file_name.cmp(&b.name.file_name));
        Ok(photos)
    }

    fn matches_cycle(&self, name: &StagedPhotoName, cycle: &Cycle) -> bool {
        let Some(cycle_name) = cycle.field_any(FIELD_CYCLE_NAME) else {
            return false;
        };
        let Some(fuel_element) = cycle.field_any(FIELD_FUEL_ELEMENT) else {
            return false;
        };
        key_eq(&cycle_name, &name.cycle_name)
            && key_eq(&fuel_element, &name.fuel_element)
            && self.in_window(name, cycle.first_captured_at(), cycle.last_captured_at())
            && cycle
                .rows
                .iter()
                .any(|row| payload_matches(&row.payload, name))
    }

    fn in_window(
        &self,
        name: &StagedPhotoName,
        start: chrono::NaiveDateTime,
        end: chrono::NaiveDateTime,
    ) -> bool {
        name.captured_at >= start - self.window_slack
            && name.captured_at <= end + self.window_slack
    }

    /// Candidate inspections for a staged file, strictest match first
    async fn find_inspection_for(&self, name: &StagedPhotoName) -> Result<Option<Inspection>> {
        let earliest = name.captured_at - self.window_slack;
        let latest = name.captured_at + self.window_slack;
        let candidates = sqlx::query_as::<_, Inspection>(
            r#"
            SELECT id, cycle_name, fuel_element, started_at, product_code, status,
                   defect_found, window_started_at, window_ended_at, created_at, updated_at
            FROM inspections
            WHERE cycle_name = ? COLLATE NOCASE
              AND fuel_element = ? COLLATE NOCASE
              AND window_started_at <= ?
              AND window_ended_at >= ?
            ORDER BY started_at DESC
            "#,
        )
        .bind(&name.cycle_name)
        .bind(&name.fuel_element)
        .bind(latest)
        .bind(earliest)
        .fetch_all(&self.db)
        .await?;

        for inspection in candidates {
            if self.window_rows_match(&inspection, name).await? {
                return Ok(Some(inspection));
            }
        }
        Ok(None)
    }

    /// Re-check pointer id and defect flag against the snapshots inside an
    /// inspection's capture window
    async fn window_rows_match(
        &self,
        inspection: &Inspection,
        name: &StagedPhotoName,
    ) -> Result<bool> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM plc_snapshots WHERE captured_at >= ? AND captured_at <= ?",
        )
        .bind(inspection.window_started_at)
        .bind(inspection.window_ended_at)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.iter().any(|(payload,)| {
            SnapshotPayload::parse(payload)
                .map(|p| payload_matches(&p, name))
                .unwrap_or(false)
        }))
    }

    async fn find_inspection_by_code(
        &self,
        code: &str,
        name: &StagedPhotoName,
    ) -> Result<Option<Inspection>> {
        let earliest = name.captured_at - self.window_slack;
        let latest = name.captured_at + self.window_slack;
        let inspection = sqlx::query_as::<_, Inspection>(
            r#"
            SELECT id, cycle_name, fuel_element, started_at, product_code, status,
                   defect_found, window_started_at, window_ended_at, created_at, updated_at
            FROM inspections
            WHERE product_code = ? COLLATE NOCASE
              AND window_started_at <= ?
              AND window_ended_at >= ?
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(code)
        .bind(latest)
        .bind(earliest)
        .fetch_optional(&self.db)
        .await?;
        Ok(inspection)
    }

    // ------------------------------------------------------------------------
    // Relocation and records
    // ------------------------------------------------------------------------

    /// Move the file into the committed area, then create its record.
    ///
    /// Returns false when the staged file vanished before the move (the
    /// camera writer occasionally retracts files).
    async fn attach(&self, inspection: &Inspection, photo: &StagedPhoto) -> Result<bool> {
        let dest_dir = self.committed_dir.join(&inspection.product_code);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(&photo.name.file_name);

        match relocate(&photo.path, &dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    file = %photo.name.file_name,
                    "Staged photo vanished before it could be moved"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let rel = relative_path(&inspection.product_code, &photo.name.file_name);
        let caption = format!(
            "Cycle {} pointer {}",
            inspection.cycle_name, photo.name.pointer_id
        );
        self.record_photo(inspection.id, &rel, &caption, photo.name.defect)
            .await?;

        if photo.name.defect {
            self.escalate_defect(inspection.id).await?;
        }

        tracing::info!(
            inspection = inspection.id,
            file = %photo.name.file_name,
            defect = photo.name.defect,
            "Photo linked"
        );
        Ok(true)
    }

    async fn record_photo(
        &self,
        inspection_id: i64,
        photo_path: &str,
        caption: &str,
        defect: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO inspection_photos (inspection_id, photo_path, caption, defect_found)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(inspection_id)
        .bind(photo_path)
        .bind(caption)
        .bind(defect)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(path = %photo_path, "Photo record already present");
        }
        Ok(())
    }

    /// A NOK photo rejects its inspection; counters move in the same
    /// transaction as the status flip.
    async fn escalate_defect(&self, inspection_id: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let changed = sqlx::query(
            r#"
            UPDATE inspections
            SET defect_found = 1, status = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND defect_found = 0
            "#,
        )
        .bind(InspectionStatus::Rejected.as_str())
        .bind(inspection_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed > 0 {
            stats_updater::record_late_defect(&mut tx, &self.station_id).await?;
            tracing::info!(inspection = inspection_id, "Defect escalated from photo evidence");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn is_recorded(&self, photo_path: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM inspection_photos WHERE photo_path = ? LIMIT 1")
                .bind(photo_path)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.is_some())
    }
}

fn payload_matches(payload: &SnapshotPayload, name: &StagedPhotoName) -> bool {
    payload
        .field(FIELD_POINTER_ID)
        .map(|p| key_eq(&p, &name.pointer_id))
        .unwrap_or(false)
        && payload.flag(FIELD_DEFECT) == name.defect
}

fn relative_path(product_code: &str, file_name: &str) -> String {
    format!("{product_code}/{file_name}")
}

/// Move a file; rename when possible, copy+remove across filesystems.
/// Either way the destination is complete before the source disappears.
async fn relocate(src: &Path, dest: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            tokio::fs::copy(src, dest).await?;
            tokio::fs::remove_file(src).await
        }
    }
}
