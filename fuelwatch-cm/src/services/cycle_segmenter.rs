//! Cycle segmentation over the unprocessed row store
//!
//! A two-state machine walks `processed = 0` snapshots in capture order and
//! cuts them into inspection cycles. The accumulating cycle lives inside
//! the state value itself, so a tick carries no segmentation state of its
//! own and a crashed tick simply re-reads the same rows.
//!
//! Boundary convention: a cycle spans its `start` row (inclusive) up to,
//! but not including, the terminating `end` row. The terminator carries no
//! telemetry; it is consumed (marked processed) when the cycle resolves. A
//! second `start` closes the running cycle with no terminator.

use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use fuelwatch_common::db::models::RawSnapshot;
use fuelwatch_common::Result;

use crate::types::{
    BoundaryFlag, NaturalKey, SnapshotPayload, FIELD_CYCLE_NAME, FIELD_FUEL_ELEMENT,
};

/// One snapshot with its payload parsed, as carried inside a cycle
#[derive(Debug, Clone)]
pub struct CycleRow {
    pub id: i64,
    pub captured_at: NaiveDateTime,
    pub payload: SnapshotPayload,
}

impl CycleRow {
    fn from_snapshot(snapshot: &RawSnapshot) -> CycleRow {
        let payload = match SnapshotPayload::parse(&snapshot.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Ingestion validated this once; a re-parse failure means the
                // stored text was tampered with. Treat as an empty payload.
                tracing::warn!(row = snapshot.id, error = %e, "Stored payload failed to re-parse");
                SnapshotPayload::empty()
            }
        };
        CycleRow {
            id: snapshot.id,
            captured_at: snapshot.captured_at,
            payload,
        }
    }
}

/// A closed run of snapshots between a start and end boundary
#[derive(Debug, Clone)]
pub struct Cycle {
    /// Constituent rows, start row first; never empty
    pub rows: Vec<CycleRow>,
    /// The `end` row that closed this cycle, when one was seen (a second
    /// `start` closes without a terminator)
    pub terminator_id: Option<i64>,
}

impl Cycle {
    fn open(first: CycleRow) -> Cycle {
        Cycle {
            rows: vec![first],
            terminator_id: None,
        }
    }

    pub fn first_captured_at(&self) -> NaiveDateTime {
        self.rows[0].captured_at
    }

    pub fn last_captured_at(&self) -> NaiveDateTime {
        self.rows[self.rows.len() - 1].captured_at
    }

    /// First non-empty value of a field across the cycle's rows.
    ///
    /// The source system sometimes leaves early rows blank, so a single-row
    /// lookup is not enough.
    pub fn field_any(&self, name: &str) -> Option<String> {
        self.rows.iter().find_map(|row| row.payload.field(name))
    }

    /// True if any row's flag-like field is set
    pub fn any_flag(&self, name: &str) -> bool {
        self.rows.iter().any(|row| row.payload.flag(name))
    }

    /// Natural identity of this cycle, when its rows carry one
    pub fn natural_key(&self) -> Option<NaturalKey> {
        let cycle_name = self.field_any(FIELD_CYCLE_NAME)?;
        let fuel_element = self.field_any(FIELD_FUEL_ELEMENT)?;
        Some(NaturalKey {
            cycle_name,
            fuel_element,
            started_at: self.first_captured_at(),
        })
    }

    /// Row ids consumed when this cycle resolves: constituents plus the
    /// terminator
    pub fn consumed_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.rows.iter().map(|row| row.id).collect();
        ids.extend(self.terminator_id);
        ids
    }
}

/// Result of one segmentation pass
#[derive(Debug, Default)]
pub struct Segmentation {
    /// Cycles closed by this pass, in capture order
    pub cycles: Vec<Cycle>,
    /// Rows seen outside any cycle; consumed without producing anything
    pub orphan_ids: Vec<i64>,
}

/// Segmenter state: either scanning for a start row, or accumulating the
/// open cycle as the variant payload
enum SegmenterState {
    Idle,
    InCycle(Cycle),
}

/// Cycle Segmenter
pub struct CycleSegmenter {
    db: SqlitePool,
    batch_limit: i64,
}

impl CycleSegmenter {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            batch_limit: 500,
        }
    }

    /// Fetch the unprocessed rows in capture order (id as stable tiebreak)
    pub async fn fetch_unprocessed(&self) -> Result<Vec<RawSnapshot>> {
        let rows = sqlx::query_as::<_, RawSnapshot>(
            r#"
            SELECT id, captured_at, payload, content_hash, processed, created_at
            FROM plc_snapshots
            WHERE processed = 0
            ORDER BY captured_at, id
            LIMIT ?
            "#,
        )
        .bind(self.batch_limit)
        .fetch_all(&self.db)
        .await?;

        tracing::debug!(count = rows.len(), "Fetched unprocessed snapshots");
        Ok(rows)
    }

    /// Mark rows processed; used for orphans and by the resolver
    pub async fn mark_processed(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for id in ids {
            sqlx::query("UPDATE plc_snapshots SET processed = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Partition rows into closed cycles and orphans.
    ///
    /// Pure function of its input: an open cycle at the end of the batch is
    /// dropped here and its rows, still unprocessed, come back next tick.
    pub fn segment(rows: &[RawSnapshot]) -> Segmentation {
        let mut result = Segmentation::default();
        let mut state = SegmenterState::Idle;

        for snapshot in rows {
            let row = CycleRow::from_snapshot(snapshot);
            let boundary = row.payload.boundary();

            state = match (state, boundary) {
                (SegmenterState::Idle, BoundaryFlag::Start) => {
                    SegmenterState::InCycle(Cycle::open(row))
                }
                (SegmenterState::Idle, _) => {
                    // Before the first start (or after an end): no cycle to
                    // belong to.
                    tracing::debug!(row = row.id, "Row outside any cycle, consumed as orphan");
                    result.orphan_ids.push(row.id);
                    SegmenterState::Idle
                }
                (SegmenterState::InCycle(cycle), BoundaryFlag::Start) => {
                    // Implicit close: the previous cycle never saw its end
                    // row. Emitting it here guarantees forward progress.
                    tracing::debug!(
                        closed_rows = cycle.rows.len(),
                        new_start = row.id,
                        "Start inside an open cycle; closing the previous cycle"
                    );
                    result.cycles.push(cycle);
                    SegmenterState::InCycle(Cycle::open(row))
                }
                (SegmenterState::InCycle(mut cycle), BoundaryFlag::End) => {
                    cycle.terminator_id = Some(row.id);
                    result.cycles.push(cycle);
                    SegmenterState::Idle
                }
                (SegmenterState::InCycle(mut cycle), BoundaryFlag::NoTransition) => {
                    cycle.rows.push(row);
                    SegmenterState::InCycle(cycle)
                }
            };
        }

        if let SegmenterState::InCycle(open) = state {
            tracing::debug!(
                open_rows = open.rows.len(),
                "Cycle still open at end of batch; rows stay unprocessed"
            );
        }

        result
    }
}
