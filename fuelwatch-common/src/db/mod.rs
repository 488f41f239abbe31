//! Database access for fuelwatch
//!
//! Shared SQLite pool setup and schema. All services operate on the same
//! database file; tests use in-memory pools created with [`init_tables`].

pub mod models;

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to the fuelwatch database, creating file and schema on first run.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the fuelwatch tables if they don't exist
///
/// `plc_snapshots` is the append-only raw row store; `inspections`,
/// `inspection_photos` and `station_stats` are the entities exposed
/// read-only to the presentation layer.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plc_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            captured_at TIMESTAMP NOT NULL,
            payload TEXT NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            processed INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_plc_snapshots_pending
        ON plc_snapshots (processed, captured_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inspections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_name TEXT NOT NULL,
            fuel_element TEXT NOT NULL,
            started_at TIMESTAMP NOT NULL,
            product_code TEXT NOT NULL,
            status TEXT NOT NULL,
            defect_found INTEGER NOT NULL DEFAULT 0,
            window_started_at TIMESTAMP NOT NULL,
            window_ended_at TIMESTAMP NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (cycle_name, fuel_element, started_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inspection_photos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            inspection_id INTEGER NOT NULL REFERENCES inspections (id),
            photo_path TEXT NOT NULL UNIQUE,
            caption TEXT NOT NULL DEFAULT '',
            defect_found INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS station_stats (
            station_id TEXT PRIMARY KEY,
            total_inspections INTEGER NOT NULL DEFAULT 0,
            inspections_today INTEGER NOT NULL DEFAULT 0,
            stats_date TEXT NOT NULL,
            defects_found INTEGER NOT NULL DEFAULT 0,
            success_rate REAL NOT NULL DEFAULT 0.0,
            last_inspection_at TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (plc_snapshots, inspections, inspection_photos, station_stats)"
    );

    Ok(())
}
