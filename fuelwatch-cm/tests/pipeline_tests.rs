//! End-to-end pipeline tests: feed file in, inspections + committed photos out

use std::io::Write;
use std::sync::Arc;

use sqlx::SqlitePool;
use tempfile::TempDir;

use fuelwatch_cm::services::stats_updater;
use fuelwatch_cm::CycleMonitor;
use fuelwatch_common::{FuelwatchConfig, InspectionPolicy};

struct TestEnv {
    pool: SqlitePool,
    config: Arc<FuelwatchConfig>,
    root: TempDir,
}

impl TestEnv {
    async fn new(policy: InspectionPolicy) -> TestEnv {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        fuelwatch_common::db::init_tables(&pool).await.unwrap();

        let root = TempDir::new().unwrap();
        let config = FuelwatchConfig {
            root_folder: root.path().to_path_buf(),
            database: root.path().join("fuelwatch.db"),
            feed_path: Some(root.path().join("feed.jsonl")),
            staging_dir: root.path().join("staging"),
            committed_dir: root.path().join("committed"),
            tick_interval_secs: 30,
            photo_window_slack_secs: 120,
            inspection_policy: policy,
            station_id: "station-1".to_string(),
        };
        config.ensure_directories().unwrap();

        TestEnv {
            pool,
            config: Arc::new(config),
            root,
        }
    }

    fn monitor(&self) -> Arc<CycleMonitor> {
        CycleMonitor::new(self.pool.clone(), Arc::clone(&self.config))
    }

    fn append_feed(&self, lines: &[String]) {
        let path = self.config.feed_path.as_ref().unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn stage_photo(&self, file_name: &str) {
        std::fs::write(self.config.staging_dir.join(file_name), b"bmp-bytes").unwrap();
    }

    async fn inspection_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM inspections")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn photo_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM inspection_photos")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn pending_rows(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM plc_snapshots WHERE processed = 0")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

fn feed_line(ts: &str, state: &str, cycle: &str, pointer: &str, defect: &str) -> String {
    format!(
        r#"{{"datetime": "{ts}", "CycleState": "{state}", "CycleName": "{cycle}", "FuelElement": "EC12", " PointerId": "{pointer}", "DefectFlag": "{defect}"}}"#
    )
}

/// One clean cycle for CicloA: start 15:49:41, one mid row, end 15:50:01
fn ciclo_a_lines() -> Vec<String> {
    vec![
        feed_line("2025-12-04 15:49:41", "start", "CicloA", "3", "0"),
        feed_line("2025-12-04 15:49:51", "", "CicloA", "3", "0"),
        feed_line("2025-12-04 15:50:01", "end", "CicloA", "", "0"),
    ]
}

#[tokio::test]
async fn full_pipeline_creates_inspection_and_commits_photo() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&ciclo_a_lines());
    env.append_feed(&["not even json".to_string()]);
    env.stage_photo("CicloA_3_OK_EC12_041225154945.bmp");

    let summary = env.monitor().run_tick().await.unwrap();

    assert_eq!(summary.snapshots_ingested, 3);
    assert_eq!(summary.malformed_lines, 1);
    assert_eq!(summary.cycles_closed, 1);
    assert_eq!(summary.inspections_created, 1);
    assert_eq!(summary.photos_linked, 1);

    // Inspection with the natural key's derived identifiers
    let (cycle_name, status, defect): (String, String, bool) =
        sqlx::query_as("SELECT cycle_name, status, defect_found FROM inspections")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(cycle_name, "CicloA");
    assert_eq!(status, "approved");
    assert!(!defect);

    // Photo moved staging -> committed, then recorded
    assert!(!env
        .config
        .staging_dir
        .join("CicloA_3_OK_EC12_041225154945.bmp")
        .exists());
    assert!(env
        .config
        .committed_dir
        .join("CicloA-EC12")
        .join("CicloA_3_OK_EC12_041225154945.bmp")
        .exists());
    let photo_path: String = sqlx::query_scalar("SELECT photo_path FROM inspection_photos")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(photo_path, "CicloA-EC12/CicloA_3_OK_EC12_041225154945.bmp");

    // Every row consumed, counters committed
    assert_eq!(env.pending_rows().await, 0);
    let stats = stats_updater::get_stats(&env.pool, "station-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_inspections, 1);
    assert_eq!(stats.defects_found, 0);
    assert_eq!(stats.success_rate, 100.0);
    assert!(stats.last_inspection_at.is_some());
}

#[tokio::test]
async fn rerunning_ticks_over_the_same_feed_changes_nothing() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&ciclo_a_lines());

    let monitor = env.monitor();
    monitor.run_tick().await.unwrap();
    let second = monitor.run_tick().await.unwrap();

    // Idempotent ingestion: the second full read inserts zero rows
    assert_eq!(second.snapshots_ingested, 0);
    assert_eq!(second.duplicate_lines, 3);
    assert_eq!(second.cycles_closed, 0);
    assert_eq!(second.inspections_created, 0);

    let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plc_snapshots")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(snapshots, 3);
    assert_eq!(env.inspection_count().await, 1);

    let stats = stats_updater::get_stats(&env.pool, "station-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_inspections, 1);
}

#[tokio::test]
async fn open_cycle_waits_for_its_end_row() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&[
        feed_line("2025-12-04 15:49:41", "start", "CicloA", "3", "0"),
        feed_line("2025-12-04 15:49:51", "", "CicloA", "3", "0"),
    ]);

    let monitor = env.monitor();
    let first = monitor.run_tick().await.unwrap();
    assert_eq!(first.cycles_closed, 0);
    assert_eq!(env.inspection_count().await, 0);
    // Rows stay pending for the next tick
    assert_eq!(env.pending_rows().await, 2);

    env.append_feed(&[feed_line("2025-12-04 15:50:01", "end", "CicloA", "", "0")]);
    let second = monitor.run_tick().await.unwrap();
    assert_eq!(second.cycles_closed, 1);
    assert_eq!(second.inspections_created, 1);
    assert_eq!(env.pending_rows().await, 0);
}

#[tokio::test]
async fn aggregates_track_totals_and_defects() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&[
        feed_line("2025-12-04 10:00:00", "start", "CicloA", "1", "0"),
        feed_line("2025-12-04 10:01:00", "end", "CicloA", "", "0"),
        feed_line("2025-12-04 11:00:00", "start", "CicloB", "1", "1"),
        feed_line("2025-12-04 11:01:00", "end", "CicloB", "", "0"),
        feed_line("2025-12-04 12:00:00", "start", "CicloC", "1", "0"),
        feed_line("2025-12-04 12:01:00", "end", "CicloC", "", "0"),
    ]);

    let summary = env.monitor().run_tick().await.unwrap();
    assert_eq!(summary.inspections_created, 3);

    let stats = stats_updater::get_stats(&env.pool, "station-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_inspections, 3);
    assert_eq!(stats.defects_found, 1);
    assert!((stats.success_rate - 200.0 / 3.0).abs() < 1e-9);

    let rejected: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM inspections WHERE status = 'rejected'")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(rejected, 1);
}

#[tokio::test]
async fn match_first_policy_requires_evidence_before_creating_anything() {
    let env = TestEnv::new(InspectionPolicy::MatchFirst).await;
    env.append_feed(&ciclo_a_lines());

    // No staged photo: the cycle is consumed without a trace
    let monitor = env.monitor();
    let first = monitor.run_tick().await.unwrap();
    assert_eq!(first.cycles_skipped, 1);
    assert_eq!(env.inspection_count().await, 0);
    assert_eq!(env.pending_rows().await, 0);

    // A later cycle WITH evidence materializes normally
    env.append_feed(&[
        feed_line("2025-12-04 16:00:00", "start", "CicloB", "4", "0"),
        feed_line("2025-12-04 16:01:00", "end", "CicloB", "", "0"),
    ]);
    env.stage_photo("CicloB_4_OK_EC12_041225160030.bmp");
    let second = monitor.run_tick().await.unwrap();
    assert_eq!(second.inspections_created, 1);
    assert_eq!(second.photos_linked, 1);
    assert_eq!(env.inspection_count().await, 1);
}

#[tokio::test]
async fn per_cycle_policy_retains_photoless_inspection_and_sweep_attaches_late_photo() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&ciclo_a_lines());

    let monitor = env.monitor();
    let first = monitor.run_tick().await.unwrap();
    assert_eq!(first.inspections_created, 1);
    assert_eq!(first.photos_linked, 0);
    assert_eq!(env.photo_count().await, 0);

    // The photo arrives a tick late; the sweep attaches it to the
    // already-resolved inspection.
    env.stage_photo("CicloA_3_OK_EC12_041225154945.bmp");
    let second = monitor.run_tick().await.unwrap();
    assert_eq!(second.photos_recovered, 1);
    assert_eq!(env.photo_count().await, 1);
    assert_eq!(env.inspection_count().await, 1);
}

#[tokio::test]
async fn correlation_tolerates_whitespace_but_not_digit_padding() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    // Pointer arrives as " 5" with its infamous leading space
    env.append_feed(&[
        feed_line("2025-12-04 15:49:41", "start", "CicloA", " 5", "0"),
        feed_line("2025-12-04 15:50:01", "end", "CicloA", "", "0"),
    ]);
    env.stage_photo("CicloA_5_OK_EC12_041225154950.bmp");
    env.stage_photo("CicloA_05_OK_EC12_041225154950.bmp");

    let summary = env.monitor().run_tick().await.unwrap();

    // " 5" == "5" links; "05" != "5" stays behind
    assert_eq!(summary.photos_linked, 1);
    assert_eq!(summary.photos_unmatched, 1);
    assert!(!env
        .config
        .staging_dir
        .join("CicloA_5_OK_EC12_041225154950.bmp")
        .exists());
    assert!(env
        .config
        .staging_dir
        .join("CicloA_05_OK_EC12_041225154950.bmp")
        .exists());
}

#[tokio::test]
async fn crash_between_move_and_record_is_repaired_once() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&ciclo_a_lines());

    let monitor = env.monitor();
    monitor.run_tick().await.unwrap();
    assert_eq!(env.photo_count().await, 0);

    // Simulate the crash window: the move landed in the committed area but
    // the record never followed.
    let dest_dir = env.config.committed_dir.join("CicloA-EC12");
    std::fs::create_dir_all(&dest_dir).unwrap();
    std::fs::write(
        dest_dir.join("CicloA_3_NOK_EC12_041225154945.bmp"),
        b"bmp-bytes",
    )
    .unwrap();

    let second = monitor.run_tick().await.unwrap();
    assert_eq!(second.records_repaired, 1);
    assert_eq!(env.photo_count().await, 1);

    // The NOK evidence rejects the previously approved inspection
    let (status, defect): (String, bool) =
        sqlx::query_as("SELECT status, defect_found FROM inspections")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(status, "rejected");
    assert!(defect);
    let stats = stats_updater::get_stats(&env.pool, "station-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.defects_found, 1);

    // Re-running repairs nothing further and duplicates nothing
    let third = monitor.run_tick().await.unwrap();
    assert_eq!(third.records_repaired, 0);
    assert_eq!(env.photo_count().await, 1);
}

#[tokio::test]
async fn unparsed_and_unmatched_files_survive_every_tick() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&ciclo_a_lines());
    env.stage_photo("holiday-card.png");
    env.stage_photo("CicloZ_9_OK_EC99_041225154945.bmp");

    let monitor = env.monitor();
    monitor.run_tick().await.unwrap();
    monitor.run_tick().await.unwrap();

    assert!(env.config.staging_dir.join("holiday-card.png").exists());
    assert!(env
        .config
        .staging_dir
        .join("CicloZ_9_OK_EC99_041225154945.bmp")
        .exists());
    assert_eq!(env.photo_count().await, 0);
}

#[tokio::test]
async fn second_start_closes_previous_cycle_in_one_tick() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    env.append_feed(&[
        feed_line("2025-12-04 15:00:00", "start", "CicloA", "1", "0"),
        feed_line("2025-12-04 15:01:00", "", "CicloA", "1", "0"),
        // The end row never arrived; a new start must still make progress
        feed_line("2025-12-04 15:05:00", "start", "CicloB", "1", "0"),
        feed_line("2025-12-04 15:06:00", "end", "CicloB", "", "0"),
    ]);

    let summary = env.monitor().run_tick().await.unwrap();
    assert_eq!(summary.cycles_closed, 2);
    assert_eq!(summary.inspections_created, 2);
    assert_eq!(env.pending_rows().await, 0);

    let names: Vec<(String,)> =
        sqlx::query_as("SELECT cycle_name FROM inspections ORDER BY started_at")
            .fetch_all(&env.pool)
            .await
            .unwrap();
    assert_eq!(names, vec![("CicloA".to_string(),), ("CicloB".to_string(),)]);
}

#[tokio::test]
async fn stop_is_a_noop_when_nothing_runs_and_start_is_idempotent() {
    let env = TestEnv::new(InspectionPolicy::PerCycle).await;
    let monitor = env.monitor();

    assert!(!monitor.request_stop());
    assert!(monitor.start());
    assert!(!monitor.start());
    assert!(monitor.request_stop());

    // Keep the TempDir alive until the end of the test
    drop(env.root);
}
