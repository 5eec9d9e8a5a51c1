//! Assignee endpoints.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::open_session;
use crate::api::error::ApiError;
use crate::error::FleetError;
use crate::planner::IngestReport;
use crate::registry::{Assignee, NewAssignee, StatusFilter};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/assignees", get(list_assignees))
        .route("/sessions/{session_id}/assignees", post(ingest_assignees))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListAssigneesResponse {
    pub items: Vec<Assignee>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub assignees: Vec<NewAssignee>,
}

/// GET /v1/assignees?status=pending
async fn list_assignees(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListAssigneesResponse>, ApiError> {
    let filter = match query.status.as_deref() {
        None => StatusFilter::All,
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request("invalid_status_filter", format!("Unknown status filter '{raw}'"))
        })?,
    };

    let items = state
        .registry()
        .lock()
        .await
        .assignees_by_status(filter)
        .map_err(FleetError::from)?;
    Ok(Json(ListAssigneesResponse { items }))
}

/// Record a batch of assignees, provisioning units first when needed.
///
/// POST /v1/sessions/{session_id}/assignees
async fn ingest_assignees(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
    let session = open_session(&state, &session_id)?;
    if req.assignees.is_empty() {
        return Err(ApiError::bad_request(
            "empty_batch",
            "assignees must not be empty",
        ));
    }
    if req.assignees.iter().any(|a| a.id.trim().is_empty()) {
        return Err(ApiError::bad_request(
            "invalid_assignee",
            "every assignee needs a non-empty id",
        ));
    }

    let report = state.planner().ingest(session, &req.assignees).await?;
    Ok(Json(report))
}
