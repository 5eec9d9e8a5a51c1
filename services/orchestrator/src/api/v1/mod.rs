//! API v1 routes.

mod assignees;
mod runs;
mod sessions;
mod units;

use axum::Router;
use emufleet_id::SessionId;

use crate::api::error::ApiError;
use crate::error::FleetError;
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(sessions::routes())
        .merge(runs::routes())
        .merge(assignees::routes())
        .merge(units::routes())
}

/// Parse a session id from the path and require it to be open.
fn open_session(state: &AppState, raw: &str) -> Result<SessionId, ApiError> {
    let session: SessionId = raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_session_id", "Invalid session ID format")
            .with_instance(raw.to_string())
    })?;
    if !state.bus().is_open(session) {
        return Err(FleetError::UnknownSession(session.to_string()).into());
    }
    Ok(session)
}
