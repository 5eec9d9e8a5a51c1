//! Session endpoints and the session event stream.
//!
//! A session scopes one event stream and one run. It exists from `POST
//! /v1/sessions` until it is deleted.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use emufleet_events::{event_types, EventEnvelope};
use emufleet_id::SessionId;
use futures_util::stream::unfold;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::open_session;
use crate::api::error::ApiError;
use crate::state::AppState;

/// Interval between `ping` events on an idle stream.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", delete(delete_session))
        .route("/sessions/{session_id}/events", get(stream_events))
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct StreamOpened {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct Ping {
    ts: i64,
}

/// POST /v1/sessions
async fn create_session(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = SessionId::new();
    state.bus().open(session_id);
    tracing::info!(session_id = %session_id, "Session opened");
    (StatusCode::CREATED, Json(SessionResponse { session_id }))
}

/// Cancel the session's run, if any, and close its stream.
///
/// DELETE /v1/sessions/{session_id}
async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = open_session(&state, &session_id)?;
    state.scheduler().close(session).await;
    state.bus().close(session);
    tracing::info!(session_id = %session, "Session closed");
    Ok(StatusCode::NO_CONTENT)
}

struct StreamState {
    session: SessionId,
    opened: bool,
    rx: broadcast::Receiver<EventEnvelope>,
    ping: Interval,
}

fn sse_event<P: Serialize>(name: &str, id: Option<u64>, payload: &P) -> Option<Event> {
    let data = match serde_json::to_string(payload) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, event_type = name, "Failed to serialize stream event");
            return None;
        }
    };
    let event = Event::default().event(name).data(data);
    Some(match id {
        Some(id) => event.id(id.to_string()),
        None => event,
    })
}

/// Stream the session's events as server-sent events.
///
/// The first event is `stream.opened`; `ping` events are sent while idle.
/// The stream ends when the session is closed.
///
/// GET /v1/sessions/{session_id}/events
async fn stream_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = open_session(&state, &session_id)?;
    let rx = state
        .bus()
        .subscribe(session)
        .ok_or_else(|| ApiError::not_found("unknown_session", "Session was closed"))?;

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping.reset();

    let stream_state = StreamState {
        session,
        opened: false,
        rx,
        ping,
    };

    let stream = unfold(stream_state, |mut st| async move {
        if !st.opened {
            st.opened = true;
            let event = sse_event(
                event_types::STREAM_OPENED,
                None,
                &StreamOpened {
                    session_id: st.session,
                },
            )?;
            return Some((Ok::<Event, Infallible>(event), st));
        }

        loop {
            tokio::select! {
                received = st.rx.recv() => match received {
                    Ok(envelope) => {
                        let Some(event) = sse_event(&envelope.event_type, Some(envelope.seq), &envelope) else {
                            continue;
                        };
                        return Some((Ok(event), st));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %st.session, skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = st.ping.tick() => {
                    let event = sse_event(event_types::PING, None, &Ping { ts: Utc::now().timestamp() })?;
                    return Some((Ok(event), st));
                }
            }
        }
    });

    tracing::info!(session_id = %session, "Event stream opened");
    Ok(Sse::new(stream))
}
