//! Snapshot ingestion with content-hash deduplication
//!
//! The telemetry feed is re-read in full on every poll, so ingestion must be
//! idempotent by content: a SHA-256 hash over each raw line is UNIQUE in the
//! row store and a repeated line becomes a no-op. Malformed lines are
//! skipped and logged; one bad line never aborts the rest of the batch.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;

use fuelwatch_common::{Error, Result};

use crate::types::SnapshotPayload;

/// Outcome of ingesting a single feed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New content, row persisted with `processed = 0`
    Inserted,
    /// Content hash already present; silently absorbed
    Duplicate,
}

/// Per-batch ingestion counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

/// Snapshot Ingestor
pub struct SnapshotIngestor {
    db: SqlitePool,
}

impl SnapshotIngestor {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// SHA-256 hex hash of a feed line, the dedup identity
    pub fn line_hash(line: &str) -> String {
        format!("{:x}", Sha256::digest(line.as_bytes()))
    }

    /// Ingest one raw feed line.
    ///
    /// The line must be a JSON object with a parseable capture timestamp
    /// (`datetime`, fallback `timestamp`); anything else is rejected with a
    /// recoverable error. Deduplication happens inside the INSERT via the
    /// UNIQUE hash column, so concurrent re-reads of the same feed cannot
    /// race their way into double rows.
    pub async fn ingest_line(&self, line: &str) -> Result<IngestOutcome> {
        let line = line.trim();
        let payload = SnapshotPayload::parse(line)?;
        let captured_at = payload.capture_timestamp().ok_or_else(|| {
            Error::Parse("feed line has no parseable capture timestamp".to_string())
        })?;

        let hash = Self::line_hash(line);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO plc_snapshots (captured_at, payload, content_hash, processed)
            VALUES (?, ?, ?, 0)
            "#,
        )
        .bind(captured_at)
        .bind(line)
        .bind(&hash)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(hash = %hash, "Duplicate feed line absorbed");
            Ok(IngestOutcome::Duplicate)
        } else {
            tracing::debug!(hash = %hash, %captured_at, "Snapshot ingested");
            Ok(IngestOutcome::Inserted)
        }
    }

    /// Ingest every line of the feed file.
    ///
    /// A missing feed file is a quiet no-op (the writer may not have
    /// produced it yet). Storage errors abort the batch; malformed lines
    /// only bump a counter.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestStats> {
        let mut stats = IngestStats::default();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Feed file not present, skipping ingestion");
            return Ok(stats);
        }

        let content = tokio::fs::read_to_string(path).await?;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match self.ingest_line(line).await {
                Ok(IngestOutcome::Inserted) => stats.inserted += 1,
                Ok(IngestOutcome::Duplicate) => stats.duplicates += 1,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "Skipping malformed feed line");
                    stats.malformed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if stats.inserted > 0 {
            tracing::info!(
                inserted = stats.inserted,
                duplicates = stats.duplicates,
                malformed = stats.malformed,
                "Feed batch ingested"
            );
        }
        Ok(stats)
    }
}
