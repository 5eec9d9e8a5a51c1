//! Per-session run state: `idle -> running -> {finished | error}`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use emufleet_events::RunStatus;
use emufleet_id::{JobId, SessionId};
use serde::Serialize;

use crate::error::{FleetError, Result};

/// Run state of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub job_id: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Run state as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub state: RunState,
    /// Whether the scheduling loop task is still running.
    pub task_alive: bool,
}

/// Run states of all sessions. A session with no entry is idle.
#[derive(Debug, Default)]
pub struct RunStates {
    runs: Mutex<HashMap<SessionId, RunState>>,
}

impl RunStates {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<SessionId, RunState>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, session: SessionId) -> RunState {
        self.runs().get(&session).cloned().unwrap_or_default()
    }

    /// Fail with `Conflict` unless the session is idle.
    pub fn ensure_idle(&self, session: SessionId) -> Result<()> {
        match self.runs().get(&session) {
            Some(state) if state.status != RunStatus::Idle => Err(FleetError::Conflict {
                session: session.to_string(),
                status: state.status,
            }),
            _ => Ok(()),
        }
    }

    /// Move an idle session to running under a fresh job id.
    pub fn try_begin(&self, session: SessionId) -> Result<JobId> {
        let mut runs = self.runs();
        let state = runs.entry(session).or_default();
        if state.status != RunStatus::Idle {
            return Err(FleetError::Conflict {
                session: session.to_string(),
                status: state.status,
            });
        }
        let job_id = JobId::new();
        *state = RunState {
            status: RunStatus::Running,
            job_id: Some(job_id),
            started_at: Some(Utc::now()),
            finished_at: None,
            error: None,
        };
        Ok(job_id)
    }

    /// Running -> finished. No-op for sessions that are not running.
    pub fn finish(&self, session: SessionId) -> Option<RunState> {
        self.end(session, RunStatus::Finished, None)
    }

    /// Running -> error, recording `error`.
    pub fn fail(&self, session: SessionId, error: String) -> Option<RunState> {
        self.end(session, RunStatus::Error, Some(error))
    }

    fn end(&self, session: SessionId, status: RunStatus, error: Option<String>) -> Option<RunState> {
        let mut runs = self.runs();
        let state = runs.get_mut(&session)?;
        if state.status != RunStatus::Running {
            return None;
        }
        state.status = status;
        state.finished_at = Some(Utc::now());
        state.error = error;
        Some(state.clone())
    }

    /// Forget the session; it becomes idle again.
    pub fn remove(&self, session: SessionId) -> Option<RunState> {
        self.runs().remove(&session)
    }
}
