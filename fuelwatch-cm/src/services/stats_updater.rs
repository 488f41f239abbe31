//! Per-station aggregate counters
//!
//! The updater runs INSIDE the inspection-creation transaction so the
//! counters can never drift from the inspections table under partial
//! failure. Late defect escalation (a NOK photo attached after creation)
//! runs in its own transaction together with the inspection update.

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{SqliteConnection, SqlitePool};

use fuelwatch_common::db::models::StationStats;
use fuelwatch_common::Result;

/// Percentage of non-defective inspections; defined as 0 when none recorded
pub fn success_rate(total: i64, defects: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (total - defects) as f64 * 100.0 / total as f64
    }
}

/// Record one newly created inspection on the station counters.
///
/// Caller provides the open transaction holding the inspection INSERT.
pub async fn record_inspection(
    conn: &mut SqliteConnection,
    station_id: &str,
    defect: bool,
    now: NaiveDateTime,
) -> Result<()> {
    let today = now.date();
    ensure_station_row(conn, station_id, today).await?;

    let (total, today_count, stats_date, defects): (i64, i64, NaiveDate, i64) =
        sqlx::query_as(
            r#"
            SELECT total_inspections, inspections_today, stats_date, defects_found
            FROM station_stats
            WHERE station_id = ?
            "#,
        )
        .bind(station_id)
        .fetch_one(&mut *conn)
        .await?;

    let total = total + 1;
    // The today counter belongs to stats_date; a day rollover resets it.
    let today_count = if stats_date == today { today_count + 1 } else { 1 };
    let defects = defects + defect as i64;

    sqlx::query(
        r#"
        UPDATE station_stats
        SET total_inspections = ?,
            inspections_today = ?,
            stats_date = ?,
            defects_found = ?,
            success_rate = ?,
            last_inspection_at = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE station_id = ?
        "#,
    )
    .bind(total)
    .bind(today_count)
    .bind(today)
    .bind(defects)
    .bind(success_rate(total, defects))
    .bind(now)
    .bind(station_id)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        station = station_id,
        total,
        defects,
        "Station counters updated"
    );
    Ok(())
}

/// Count a defect discovered after inspection creation (NOK photo filename)
pub async fn record_late_defect(conn: &mut SqliteConnection, station_id: &str) -> Result<()> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT total_inspections, defects_found FROM station_stats WHERE station_id = ?",
    )
    .bind(station_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((total, defects)) = row else {
        // Counters only exist once an inspection was recorded; an escalation
        // without them would mean the photo beat its own inspection.
        tracing::warn!(station = station_id, "Defect escalation with no station counters");
        return Ok(());
    };

    let defects = defects + 1;
    sqlx::query(
        r#"
        UPDATE station_stats
        SET defects_found = ?, success_rate = ?, updated_at = CURRENT_TIMESTAMP
        WHERE station_id = ?
        "#,
    )
    .bind(defects)
    .bind(success_rate(total, defects))
    .bind(station_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read the station counters, if any inspection was ever recorded
pub async fn get_stats(db: &SqlitePool, station_id: &str) -> Result<Option<StationStats>> {
    let stats = sqlx::query_as::<_, StationStats>(
        r#"
        SELECT station_id, total_inspections, inspections_today, stats_date,
               defects_found, success_rate, last_inspection_at, updated_at
        FROM station_stats
        WHERE station_id = ?
        "#,
    )
    .bind(station_id)
    .fetch_optional(db)
    .await?;
    Ok(stats)
}

async fn ensure_station_row(
    conn: &mut SqliteConnection,
    station_id: &str,
    today: NaiveDate,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO station_stats (station_id, stats_date) VALUES (?, ?)")
        .bind(station_id)
        .bind(today)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
