//! fuelwatch-cm library interface
//!
//! Exposes the pipeline services, the operational API router, and the
//! shared application state for integration testing.

pub mod api;
pub mod error;
pub mod services;
pub mod types;

pub use crate::error::{ApiError, ApiResult};
pub use crate::services::{CycleMonitor, TickSummary};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use fuelwatch_common::FuelwatchConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Resolved service configuration
    pub config: Arc<FuelwatchConfig>,
    /// The scheduler driving the pipeline
    pub monitor: Arc<CycleMonitor>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        config: Arc<FuelwatchConfig>,
        monitor: Arc<CycleMonitor>,
    ) -> Self {
        Self {
            db,
            config,
            monitor,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::control_routes())
        .merge(api::view_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
