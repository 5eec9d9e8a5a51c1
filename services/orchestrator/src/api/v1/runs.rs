//! Run endpoints: launch a session's run and query its state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::open_session;
use crate::api::error::ApiError;
use crate::registry::StatusFilter;
use crate::scheduler::{LaunchAccepted, LaunchRequest, RunSnapshot};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/sessions/{session_id}/runs",
        post(launch_run).get(get_run),
    )
}

fn default_max_parallel() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct LaunchRunRequest {
    /// `pending`, `active`, `failed`, `completed` or `all`.
    pub status_filter: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Serialize)]
pub struct LaunchRunResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub accepted: LaunchAccepted,
}

/// POST /v1/sessions/{session_id}/runs
async fn launch_run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<LaunchRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = open_session(&state, &session_id)?;
    let status_filter: StatusFilter = req.status_filter.parse().map_err(|_| {
        ApiError::bad_request(
            "invalid_status_filter",
            format!("Unknown status filter '{}'", req.status_filter),
        )
    })?;

    let accepted = state
        .scheduler()
        .launch(
            session,
            LaunchRequest {
                status_filter,
                max_parallel: req.max_parallel,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(LaunchRunResponse {
            status: "scheduled",
            accepted,
        }),
    ))
}

/// GET /v1/sessions/{session_id}/runs
async fn get_run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let session = open_session(&state, &session_id)?;
    Ok(Json(state.scheduler().status(session)))
}
