//! Fixed-cadence pipeline scheduler
//!
//! One tick runs, in order: reconcile the committed photo area, ingest the
//! feed, segment unprocessed rows, resolve + correlate each closed cycle,
//! then sweep staging for late photos. Ticks are serialized through a
//! mutex, so the manual run-now operation is a harmless no-op while the
//! loop is mid-tick.
//!
//! Stop requests are honored only BETWEEN ticks: nothing irreversible
//! happens before the photo move inside a tick, so the running tick always
//! finishes and an unstarted tick is always safe to abandon.

use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fuelwatch_common::{FuelwatchConfig, InspectionPolicy, Result};

use crate::services::cycle_segmenter::{Cycle, CycleSegmenter};
use crate::services::inspection_resolver::InspectionResolver;
use crate::services::photo_correlator::PhotoCorrelator;
use crate::services::snapshot_ingestor::SnapshotIngestor;

/// Counters for one pipeline tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub snapshots_ingested: usize,
    pub duplicate_lines: usize,
    pub malformed_lines: usize,
    pub cycles_closed: usize,
    pub orphan_rows: usize,
    pub inspections_created: usize,
    pub inspections_reused: usize,
    /// Cycles consumed without an inspection (no natural key, or
    /// match-first policy with no evidence)
    pub cycles_skipped: usize,
    pub photos_linked: usize,
    pub photos_recovered: usize,
    pub photos_unmatched: usize,
    pub records_repaired: usize,
    pub cycle_errors: usize,
}

impl TickSummary {
    fn is_idle(&self) -> bool {
        self.snapshots_ingested == 0
            && self.cycles_closed == 0
            && self.orphan_rows == 0
            && self.photos_recovered == 0
            && self.records_repaired == 0
            && self.cycle_errors == 0
    }
}

/// Cycle Monitor: owns the tick pipeline and its lifecycle
pub struct CycleMonitor {
    db: SqlitePool,
    config: Arc<FuelwatchConfig>,
    running: AtomicBool,
    ticks_completed: AtomicU64,
    tick_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    last_summary: tokio::sync::RwLock<Option<TickSummary>>,
}

impl CycleMonitor {
    pub fn new(db: SqlitePool, config: Arc<FuelwatchConfig>) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            running: AtomicBool::new(false),
            ticks_completed: AtomicU64::new(0),
            tick_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            last_summary: tokio::sync::RwLock::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::SeqCst)
    }

    pub async fn last_summary(&self) -> Option<TickSummary> {
        self.last_summary.read().await.clone()
    }

    /// Start the scheduler loop; no-op (false) if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel token lock poisoned") = token.clone();

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run_loop(token).await;
        });
        tracing::info!(
            interval_secs = self.config.tick_interval_secs,
            policy = ?self.config.inspection_policy,
            "Cycle monitor started"
        );
        true
    }

    /// Request a stop; the current tick finishes first. No-op (false) when
    /// nothing is running.
    pub fn request_stop(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.cancel
            .lock()
            .expect("cancel token lock poisoned")
            .cancel();
        tracing::info!("Cycle monitor stop requested; current tick will finish");
        true
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            match self.run_tick().await {
                Ok(summary) if summary.is_idle() => tracing::debug!("Tick complete (idle)"),
                Ok(summary) => tracing::info!(?summary, "Tick complete"),
                Err(e) => tracing::error!(
                    error = %e,
                    "Tick aborted; committed writes stand, retrying next tick"
                ),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.tick_interval_secs)) => {}
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Cycle monitor stopped");
    }

    /// Run one tick, waiting for any tick in flight.
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let _guard = self.tick_lock.lock().await;
        self.tick_inner().await
    }

    /// Run one tick unless one is already in flight (manual catch-up path)
    pub async fn try_run_tick(&self) -> Option<Result<TickSummary>> {
        match self.tick_lock.try_lock() {
            Ok(_guard) => Some(self.tick_inner().await),
            Err(_) => None,
        }
    }

    async fn tick_inner(&self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        let ingestor = SnapshotIngestor::new(self.db.clone());
        let segmenter = CycleSegmenter::new(self.db.clone());
        let resolver =
            InspectionResolver::new(self.db.clone(), self.config.station_id.clone());
        let correlator = PhotoCorrelator::new(self.db.clone(), &self.config);

        // Repair any move a previous crash left half-finished before new
        // writes pile on top.
        summary.records_repaired = correlator.reconcile().await?;

        if let Some(feed) = &self.config.feed_path {
            let stats = ingestor.ingest_file(feed).await?;
            summary.snapshots_ingested = stats.inserted;
            summary.duplicate_lines = stats.duplicates;
            summary.malformed_lines = stats.malformed;
        }

        let rows = segmenter.fetch_unprocessed().await?;
        let segmentation = CycleSegmenter::segment(&rows);
        summary.cycles_closed = segmentation.cycles.len();
        summary.orphan_rows = segmentation.orphan_ids.len();
        segmenter.mark_processed(&segmentation.orphan_ids).await?;

        for cycle in &segmentation.cycles {
            match self
                .process_cycle(cycle, &resolver, &correlator, &mut summary)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "Cycle failed; continuing with the rest");
                    summary.cycle_errors += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let sweep = correlator.sweep_staging().await?;
        summary.photos_recovered = sweep.recovered;
        summary.photos_unmatched = sweep.unmatched;

        self.ticks_completed.fetch_add(1, Ordering::SeqCst);
        *self.last_summary.write().await = Some(summary.clone());
        Ok(summary)
    }

    async fn process_cycle(
        &self,
        cycle: &Cycle,
        resolver: &InspectionResolver,
        correlator: &PhotoCorrelator,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let Some(key) = cycle.natural_key() else {
            tracing::warn!(
                rows = cycle.rows.len(),
                first_row = cycle.rows[0].id,
                "Cycle carries no cycle name or fuel element; consuming rows without an inspection"
            );
            resolver.consume_rows(cycle).await?;
            summary.cycles_skipped += 1;
            return Ok(());
        };

        if self.config.inspection_policy == InspectionPolicy::MatchFirst
            && !correlator.staging_has_match(cycle).await?
        {
            tracing::info!(
                cycle = %key,
                "No staged photo matches; match-first policy consumes the cycle without an inspection"
            );
            resolver.consume_rows(cycle).await?;
            summary.cycles_skipped += 1;
            return Ok(());
        }

        let resolution = resolver.resolve(cycle, &key).await?;
        if resolution.created {
            summary.inspections_created += 1;
        } else {
            summary.inspections_reused += 1;
        }

        let linked = correlator.correlate(cycle, &resolution.inspection).await?;
        summary.photos_linked += linked;
        if linked == 0 {
            tracing::info!(cycle = %key, "Inspection retained without photos");
        }
        Ok(())
    }
}
