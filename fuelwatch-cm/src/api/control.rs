//! Monitor lifecycle control: status, start, stop, manual tick
//!
//! Every operation is idempotent against a live scheduler: starting twice,
//! stopping twice, or requesting a tick mid-tick all degrade to no-ops.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::services::TickSummary;
use crate::AppState;

/// Monitor status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub ticks_completed: u64,
    pub tick_interval_secs: u64,
    pub inspection_policy: fuelwatch_common::InspectionPolicy,
    pub last_tick: Option<TickSummary>,
}

/// Outcome of a start/stop request
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    /// False when the request was a no-op (already in the target state)
    pub changed: bool,
    pub running: bool,
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.monitor.is_running(),
        ticks_completed: state.monitor.ticks_completed(),
        tick_interval_secs: state.config.tick_interval_secs,
        inspection_policy: state.config.inspection_policy,
        last_tick: state.monitor.last_summary().await,
    })
}

/// POST /monitor/start
pub async fn start(State(state): State<AppState>) -> Json<ControlResponse> {
    let changed = state.monitor.start();
    Json(ControlResponse {
        changed,
        running: true,
    })
}

/// POST /monitor/stop
///
/// The current tick finishes before the loop exits.
pub async fn stop(State(state): State<AppState>) -> Json<ControlResponse> {
    let changed = state.monitor.request_stop();
    Json(ControlResponse {
        changed,
        running: state.monitor.is_running(),
    })
}

/// POST /monitor/tick
///
/// Run one tick now (batch catch-up). 409 when a tick is already in flight.
pub async fn tick(State(state): State<AppState>) -> ApiResult<Json<TickSummary>> {
    match state.monitor.try_run_tick().await {
        Some(result) => Ok(Json(result?)),
        None => Err(ApiError::Conflict("a tick is already running".to_string())),
    }
}

/// Build monitor control routes
pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/monitor/start", post(start))
        .route("/monitor/stop", post(stop))
        .route("/monitor/tick", post(tick))
}
