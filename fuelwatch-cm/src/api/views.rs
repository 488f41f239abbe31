//! Read-only entity views for the presentation layer
//!
//! Inspections, their photos, and the station aggregates. These endpoints
//! never write; the dashboard consuming them lives outside this service.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use fuelwatch_common::db::models::{Inspection, InspectionPhoto};

use crate::error::{ApiError, ApiResult};
use crate::services::stats_updater;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Newest-first page size, capped at 500
    pub limit: Option<i64>,
}

/// GET /inspections
pub async fn list_inspections(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Inspection>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let inspections = sqlx::query_as::<_, Inspection>(
        r#"
        SELECT id, cycle_name, fuel_element, started_at, product_code, status,
               defect_found, window_started_at, window_ended_at, created_at, updated_at
        FROM inspections
        ORDER BY started_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(fuelwatch_common::Error::from)?;
    Ok(Json(inspections))
}

/// GET /inspections/:id/photos
pub async fn inspection_photos(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<InspectionPhoto>>> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM inspections WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .map_err(fuelwatch_common::Error::from)?;
    if exists.is_none() {
        return Err(ApiError::NotFound(format!("inspection {id}")));
    }

    let photos = sqlx::query_as::<_, InspectionPhoto>(
        r#"
        SELECT id, inspection_id, photo_path, caption, defect_found, created_at
        FROM inspection_photos
        WHERE inspection_id = ?
        ORDER BY created_at, id
        "#,
    )
    .bind(id)
    .fetch_all(&state.db)
    .await
    .map_err(fuelwatch_common::Error::from)?;
    Ok(Json(photos))
}

/// Station aggregates; zeroed before the first inspection is recorded
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub station_id: String,
    pub total_inspections: i64,
    pub inspections_today: i64,
    pub defects_found: i64,
    pub success_rate: f64,
    pub last_inspection_at: Option<NaiveDateTime>,
}

/// GET /stats
pub async fn station_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let stats = stats_updater::get_stats(&state.db, &state.config.station_id).await?;
    let response = match stats {
        Some(stats) => StatsResponse {
            station_id: stats.station_id,
            total_inspections: stats.total_inspections,
            inspections_today: stats.inspections_today,
            defects_found: stats.defects_found,
            success_rate: stats.success_rate,
            last_inspection_at: stats.last_inspection_at,
        },
        None => StatsResponse {
            station_id: state.config.station_id.clone(),
            total_inspections: 0,
            inspections_today: 0,
            defects_found: 0,
            success_rate: 0.0,
            last_inspection_at: None,
        },
    };
    Ok(Json(response))
}

/// Build read-only view routes
pub fn view_routes() -> Router<AppState> {
    Router::new()
        .route("/inspections", get(list_inspections))
        .route("/inspections/:id/photos", get(inspection_photos))
        .route("/stats", get(station_stats))
}
