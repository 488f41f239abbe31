//! Natural-key inspection resolution
//!
//! One inspection per cycle identity (cycle name, fuel element, first
//! capture time). Resolving an already-known identity returns the existing
//! record untouched, so re-running a tick over the same rows is safe.
//!
//! Inspection creation, the station-counter update and the consumption of
//! the constituent rows commit in one transaction: either the cycle fully
//! became an inspection, or it is still fully pending.

use chrono::Local;
use sqlx::SqlitePool;

use fuelwatch_common::db::models::{Inspection, InspectionStatus};
use fuelwatch_common::{Error, Result};

use crate::services::cycle_segmenter::Cycle;
use crate::services::stats_updater;
use crate::types::{product_code, NaturalKey, FIELD_DEFECT};

/// Resolution result
#[derive(Debug, Clone)]
pub struct Resolution {
    pub inspection: Inspection,
    /// False when the identity already had an inspection
    pub created: bool,
}

/// Natural-Key Resolver
pub struct InspectionResolver {
    db: SqlitePool,
    station_id: String,
}

impl InspectionResolver {
    pub fn new(db: SqlitePool, station_id: String) -> Self {
        Self { db, station_id }
    }

    /// Find or create the inspection for a closed cycle.
    ///
    /// All constituent rows (terminator included) are marked processed here,
    /// whether or not a photo ever shows up — row consumption and photo
    /// presence are decoupled, so photo-less cycles cannot loop forever.
    pub async fn resolve(&self, cycle: &Cycle, key: &NaturalKey) -> Result<Resolution> {
        if let Some(existing) = self.find(key).await? {
            tracing::debug!(cycle = %key, inspection = existing.id, "Cycle already resolved");
            self.consume_rows(cycle).await?;
            return Ok(Resolution {
                inspection: existing,
                created: false,
            });
        }

        let defect = cycle.any_flag(FIELD_DEFECT);
        let status = if defect {
            InspectionStatus::Rejected
        } else {
            InspectionStatus::Approved
        };
        let code = product_code(&key.cycle_name, &key.fuel_element);
        let now = Local::now().naive_local();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO inspections
                (cycle_name, fuel_element, started_at, product_code, status,
                 defect_found, window_started_at, window_ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.cycle_name)
        .bind(&key.fuel_element)
        .bind(key.started_at)
        .bind(&code)
        .bind(status.as_str())
        .bind(defect)
        .bind(cycle.first_captured_at())
        .bind(cycle.last_captured_at())
        .execute(&mut *tx)
        .await?;

        stats_updater::record_inspection(&mut tx, &self.station_id, defect, now).await?;

        for id in cycle.consumed_ids() {
            sqlx::query("UPDATE plc_snapshots SET processed = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let inspection = self.find(key).await?.ok_or_else(|| {
            Error::Internal(format!("inspection vanished after insert: {key}"))
        })?;

        tracing::info!(
            cycle = %key,
            inspection = inspection.id,
            status = %inspection.status,
            defect,
            "Inspection created"
        );
        Ok(Resolution {
            inspection,
            created: true,
        })
    }

    /// Mark a cycle's rows processed without creating anything.
    ///
    /// Used for cycles that cannot form a natural key, and under the
    /// match-first policy for cycles with no photographic evidence.
    pub async fn consume_rows(&self, cycle: &Cycle) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for id in cycle.consumed_ids() {
            sqlx::query("UPDATE plc_snapshots SET processed = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, key: &NaturalKey) -> Result<Option<Inspection>> {
        let inspection = sqlx::query_as::<_, Inspection>(
            r#"
            SELECT id, cycle_name, fuel_element, started_at, product_code, status,
                   defect_found, window_started_at, window_ended_at, created_at, updated_at
            FROM inspections
            WHERE cycle_name = ? AND fuel_element = ? AND started_at = ?
            "#,
        )
        .bind(&key.cycle_name)
        .bind(&key.fuel_element)
        .bind(key.started_at)
        .fetch_optional(&self.db)
        .await?;
        Ok(inspection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cycle_segmenter::CycleSegmenter;
    use chrono::NaiveDate;
    use fuelwatch_common::db::models::RawSnapshot;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        fuelwatch_common::db::init_tables(&pool).await.unwrap();
        pool
    }

    async fn insert_snapshot(pool: &SqlitePool, id: i64, minute: u32, payload: &str) {
        sqlx::query(
            "INSERT INTO plc_snapshots (id, captured_at, payload, content_hash) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(
            NaiveDate::from_ymd_opt(2025, 12, 4)
                .unwrap()
                .and_hms_opt(15, minute, 0)
                .unwrap(),
        )
        .bind(payload)
        .bind(format!("hash-{id}"))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn seeded_cycle(pool: &SqlitePool, defect: &str) -> Cycle {
        insert_snapshot(
            pool,
            1,
            0,
            &format!(
                r#"{{"CycleState": "start", "CycleName": "CicloA", "FuelElement": "EC12", "DefectFlag": "{defect}"}}"#
            ),
        )
        .await;
        insert_snapshot(pool, 2, 1, r#"{"CycleName": "CicloA", "FuelElement": "EC12"}"#).await;
        insert_snapshot(pool, 3, 2, r#"{"CycleState": "end"}"#).await;

        let segmenter = CycleSegmenter::new(pool.clone());
        let rows: Vec<RawSnapshot> = segmenter.fetch_unprocessed().await.unwrap();
        let mut segmentation = CycleSegmenter::segment(&rows);
        segmentation.cycles.remove(0)
    }

    #[tokio::test]
    async fn creates_inspection_and_consumes_rows() {
        let pool = setup_test_db().await;
        let cycle = seeded_cycle(&pool, "0").await;
        let key = cycle.natural_key().unwrap();

        let resolver = InspectionResolver::new(pool.clone(), "station-1".to_string());
        let resolution = resolver.resolve(&cycle, &key).await.unwrap();

        assert!(resolution.created);
        assert_eq!(resolution.inspection.cycle_name, "CicloA");
        assert_eq!(resolution.inspection.status, "approved");
        assert!(!resolution.inspection.defect_found);
        assert_eq!(resolution.inspection.product_code, "CicloA-EC12");

        // Every row, terminator included, is consumed
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM plc_snapshots WHERE processed = 0")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(pending, 0);

        // Station counters committed with the inspection
        let stats = stats_updater::get_stats(&pool, "station-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.total_inspections, 1);
        assert_eq!(stats.defects_found, 0);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn defect_flag_anywhere_in_cycle_rejects() {
        let pool = setup_test_db().await;
        let cycle = seeded_cycle(&pool, "1").await;
        let key = cycle.natural_key().unwrap();

        let resolver = InspectionResolver::new(pool.clone(), "station-1".to_string());
        let resolution = resolver.resolve(&cycle, &key).await.unwrap();

        assert_eq!(resolution.inspection.status, "rejected");
        assert!(resolution.inspection.defect_found);

        let stats = stats_updater::get_stats(&pool, "station-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.defects_found, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn resolving_same_identity_twice_yields_one_inspection() {
        let pool = setup_test_db().await;
        let cycle = seeded_cycle(&pool, "0").await;
        let key = cycle.natural_key().unwrap();

        let resolver = InspectionResolver::new(pool.clone(), "station-1".to_string());
        let first = resolver.resolve(&cycle, &key).await.unwrap();
        let second = resolver.resolve(&cycle, &key).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.inspection.id, second.inspection.id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inspections")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // The reused resolution must not double-count
        let stats = stats_updater::get_stats(&pool, "station-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.total_inspections, 1);
    }

    #[tokio::test]
    async fn window_spans_constituent_rows_only() {
        let pool = setup_test_db().await;
        let cycle = seeded_cycle(&pool, "0").await;
        let key = cycle.natural_key().unwrap();

        let resolver = InspectionResolver::new(pool.clone(), "station-1".to_string());
        let resolution = resolver.resolve(&cycle, &key).await.unwrap();

        // Rows at minute 0 and 1; the terminator at minute 2 is excluded
        let expected_start = NaiveDate::from_ymd_opt(2025, 12, 4)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        let expected_end = NaiveDate::from_ymd_opt(2025, 12, 4)
            .unwrap()
            .and_hms_opt(15, 1, 0)
            .unwrap();
        assert_eq!(resolution.inspection.window_started_at, expected_start);
        assert_eq!(resolution.inspection.window_ended_at, expected_end);
        assert_eq!(resolution.inspection.started_at, expected_start);
    }
}
