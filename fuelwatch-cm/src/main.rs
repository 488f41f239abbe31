//! fuelwatch-cm - PLC Cycle Monitor service
//!
//! Ingests the PLC telemetry feed, segments it into inspection cycles,
//! materializes one inspection per cycle, correlates staged photo evidence,
//! and keeps per-station aggregates — all on a fixed 30-second cadence.
//! One monitor instance per deployment.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fuelwatch_cm::{build_router, AppState, CycleMonitor};
use fuelwatch_common::FuelwatchConfig;

#[derive(Parser, Debug)]
#[command(name = "fuelwatch-cm", version, about = "PLC cycle correlation monitor")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root folder for the database and photo areas
    #[arg(long)]
    root_folder: Option<PathBuf>,

    /// HTTP port for the operational API
    #[arg(long, default_value_t = 5810)]
    port: u16,

    /// Run a single tick and exit (batch catch-up)
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting fuelwatch-cm (PLC Cycle Monitor)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config =
        FuelwatchConfig::resolve(args.config.as_deref(), args.root_folder.as_deref())?;
    config.ensure_directories()?;
    info!("Database: {}", config.database.display());
    info!("Staging: {}", config.staging_dir.display());
    info!("Committed: {}", config.committed_dir.display());

    let db = fuelwatch_common::db::init_database_pool(&config.database).await?;
    info!("Database connection established");

    let config = Arc::new(config);
    let monitor = CycleMonitor::new(db.clone(), Arc::clone(&config));

    if args.once {
        let summary = monitor.run_tick().await?;
        info!(?summary, "Single tick complete");
        return Ok(());
    }

    monitor.start();

    let state = AppState::new(db, config, monitor);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!("Listening on http://127.0.0.1:{}", args.port);
    info!("Health check: http://127.0.0.1:{}/health", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
