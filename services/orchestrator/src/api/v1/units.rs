//! Unit endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::open_session;
use crate::api::error::ApiError;
use crate::error::FleetError;
use crate::provisioner::DiscoveredUnit;
use crate::registry::UnitStatus;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/units", get(list_units))
        .route("/units/discovered", get(list_discovered))
        .route("/sessions/{session_id}/units/clone", post(clone_units))
}

#[derive(Debug, Serialize)]
pub struct UnitItem {
    pub name: String,
    pub status: UnitStatus,
    pub updated_at: DateTime<Utc>,
    /// Assignees currently bound to the unit.
    pub assigned: usize,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

/// Largest clone batch accepted in one request.
pub const MAX_CLONE_COUNT: usize = 64;

fn default_count() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    #[serde(default = "default_count")]
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct CloneResponse {
    pub created: Vec<String>,
}

/// GET /v1/units
async fn list_units(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry().lock().await;
    let units = registry.list_units().map_err(FleetError::from)?;
    let counts = registry.assigned_counts().map_err(FleetError::from)?;
    drop(registry);

    let items = units
        .into_iter()
        .map(|unit| UnitItem {
            assigned: counts.get(&unit.name).copied().unwrap_or(0),
            name: unit.name,
            status: unit.status,
            updated_at: unit.updated_at,
        })
        .collect();

    Ok(Json(ListResponse { items }))
}

/// Units found on disk, whether or not the registry knows them.
///
/// GET /v1/units/discovered
async fn list_discovered(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<DiscoveredUnit>>, ApiError> {
    let provisioner = state.planner().provisioner().clone();
    let items = tokio::task::spawn_blocking(move || provisioner.discover_all())
        .await
        .map_err(|e| ApiError::internal("internal_error", format!("Discovery task failed: {e}")))??;
    Ok(Json(ListResponse { items }))
}

/// POST /v1/sessions/{session_id}/units/clone
async fn clone_units(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CloneRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = open_session(&state, &session_id)?;
    if req.count == 0 || req.count > MAX_CLONE_COUNT {
        return Err(ApiError::bad_request(
            "invalid_count",
            format!("count must be between 1 and {MAX_CLONE_COUNT}"),
        ));
    }

    let created = state.planner().clone_units(session, req.count).await?;
    tracing::info!(session_id = %session, requested = req.count, created = created.len(), "Units cloned");
    Ok((StatusCode::CREATED, Json(CloneResponse { created })))
}
