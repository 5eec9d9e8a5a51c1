//! Pool scheduler: runs a session's groups with at most `max_parallel` in
//! flight.
//!
//! Each slot offset in `[0, max_parallel)` is leased to one group at a time
//! and maps to a disjoint port pair. Groups start in unit-name order; when
//! one ends, its offset goes back on the free list and the next pending
//! group starts right away.
//!
//! Group events are applied to the registry and published on the bus by a
//! single consumer per run, so assignee statuses have one writer whatever
//! the isolation mode.

mod launcher;
mod state;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use emufleet_events::{
    event_types, GroupEvent, GroupExit, ProcessFinishedPayload, ProcessStartedPayload,
    RunPlannedPayload, RunStatePayload, RunStatus,
};
use emufleet_id::{JobId, SessionId};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use launcher::{
    join, GroupHandle, GroupLauncher, ProcessLauncher, TaskLauncher, RUN_GROUP_COMMAND,
};
pub use state::{RunSnapshot, RunState, RunStates};

use crate::bus::EventBus;
use crate::config::SlotConfig;
use crate::error::{FleetError, Result};
use crate::registry::{Assignee, AssigneeStatus, SharedRegistry, StatusFilter};
use crate::runner::{ChannelSink, GroupJob, GroupSink};

/// How long cleanup waits for each terminated group.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub status_filter: StatusFilter,
    pub max_parallel: usize,
}

/// A launch accepted for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchAccepted {
    pub job_id: JobId,
    pub groups_planned: usize,
    pub total_assignees: usize,
    pub max_parallel: usize,
}

/// Group assignees by unit, in unit-name order. Unbound rows are skipped.
pub fn plan_groups(rows: Vec<Assignee>) -> BTreeMap<String, Vec<Assignee>> {
    let mut groups: BTreeMap<String, Vec<Assignee>> = BTreeMap::new();
    for row in rows {
        match row.unit_name.clone() {
            Some(unit) => groups.entry(unit).or_default().push(row),
            None => warn!(assignee = %row.id, "Assignee has no unit, not scheduled"),
        }
    }
    groups
}

struct LoopHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs sessions' groups through a [`GroupLauncher`].
pub struct PoolScheduler {
    registry: SharedRegistry,
    bus: EventBus,
    launcher: Arc<dyn GroupLauncher>,
    slots: SlotConfig,
    states: Arc<RunStates>,
    loops: Mutex<HashMap<SessionId, LoopHandle>>,
}

impl PoolScheduler {
    pub fn new(registry: SharedRegistry, bus: EventBus, launcher: Arc<dyn GroupLauncher>) -> Self {
        Self {
            registry,
            bus,
            launcher,
            slots: SlotConfig::default(),
            states: Arc::new(RunStates::new()),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Port layout that launches are checked against.
    pub fn with_slots(mut self, slots: SlotConfig) -> Self {
        self.slots = slots;
        self
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<SessionId, LoopHandle>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plan the session's groups and start scheduling them.
    ///
    /// A session runs at most once: `Conflict` while it is running and after
    /// it has finished or failed, until it is closed. `max_parallel` is
    /// clamped to `[1, groups]`, and the highest slot must have valid ports.
    pub async fn launch(&self, session: SessionId, request: LaunchRequest) -> Result<LaunchAccepted> {
        self.states.ensure_idle(session)?;

        let rows = self
            .registry
            .lock()
            .await
            .assignees_by_status(request.status_filter)?;
        let groups = plan_groups(rows);
        if groups.is_empty() {
            return Err(FleetError::NoAssignees(request.status_filter.to_string()));
        }

        // More slots than groups would never be leased.
        let max_parallel = request.max_parallel.clamp(1, groups.len());
        self.slots.ports(max_parallel - 1)?;
        let total_assignees = groups.values().map(Vec::len).sum();

        let job_id = self.states.try_begin(session)?;
        self.bus.emit(
            session,
            event_types::RUN_PLANNED,
            &RunPlannedPayload {
                status_filter: request.status_filter.to_string(),
                max_parallel,
                total_groups: groups.len(),
                total_assignees,
                groups: groups.iter().map(|(unit, g)| (unit.clone(), g.len())).collect(),
            },
        );
        self.bus.emit(
            session,
            event_types::RUN_STATE_CHANGED,
            &RunStatePayload {
                status: RunStatus::Running,
                job_id,
                error: None,
            },
        );
        info!(
            session_id = %session,
            job_id = %job_id,
            groups = groups.len(),
            total_assignees,
            max_parallel,
            "Run scheduled"
        );

        let accepted = LaunchAccepted {
            job_id,
            groups_planned: groups.len(),
            total_assignees,
            max_parallel,
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let pool = PoolRun {
            session,
            job_id,
            max_parallel,
            groups,
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            launcher: self.launcher.clone(),
            states: self.states.clone(),
        };
        let task = tokio::spawn(pool.run(cancel_rx));
        if let Some(previous) = self.loops().insert(session, LoopHandle { cancel, task }) {
            // Only reachable for a loop that already ended.
            previous.task.abort();
        }

        Ok(accepted)
    }

    /// The session's run state and whether its loop is still running.
    pub fn status(&self, session: SessionId) -> RunSnapshot {
        let task_alive = self
            .loops()
            .get(&session)
            .is_some_and(|l| !l.task.is_finished());
        RunSnapshot {
            state: self.states.get(session),
            task_alive,
        }
    }

    /// Stop the session's loop, if any, and forget its run state.
    pub async fn close(&self, session: SessionId) {
        let handle = self.loops().remove(&session);
        if let Some(LoopHandle { cancel, task }) = handle {
            let _ = cancel.send(true);
            if let Err(e) = task.await {
                warn!(session_id = %session, error = %e, "Scheduling loop ended abnormally");
            }
        }
        self.states.remove(session);
        debug!(session_id = %session, "Run state cleared");
    }

    /// Close every session with a loop.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionId> = self.loops().keys().copied().collect();
        for session in sessions {
            self.close(session).await;
        }
    }
}

/// A started group, as tracked by the loop.
struct InFlight {
    unit: String,
    kill: oneshot::Sender<()>,
}

type Completion = (usize, GroupExit);

/// One accepted run.
struct PoolRun {
    session: SessionId,
    job_id: JobId,
    max_parallel: usize,
    groups: BTreeMap<String, Vec<Assignee>>,
    registry: SharedRegistry,
    bus: EventBus,
    launcher: Arc<dyn GroupLauncher>,
    states: Arc<RunStates>,
}

impl PoolRun {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let applier = tokio::spawn(apply_events(
            self.session,
            rx,
            self.registry.clone(),
            self.bus.clone(),
        ));
        let sink: Arc<dyn GroupSink> = Arc::new(ChannelSink::new(tx));

        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        let mut completions: FuturesUnordered<JoinHandle<Completion>> = FuturesUnordered::new();

        let outcome = self
            .schedule(&sink, &mut in_flight, &mut completions, &mut cancel)
            .await;

        self.cleanup(in_flight, completions).await;
        drop(sink);
        if tokio::time::timeout(JOIN_TIMEOUT, applier).await.is_err() {
            warn!(session_id = %self.session, "Group events still pending after cleanup");
        }

        match outcome {
            Ok(true) => self.finish(),
            Ok(false) => info!(session_id = %self.session, job_id = %self.job_id, "Run cancelled"),
            Err(e) => self.fail(e),
        }
    }

    /// Returns false when cancelled before every group ended.
    async fn schedule(
        &self,
        sink: &Arc<dyn GroupSink>,
        in_flight: &mut HashMap<usize, InFlight>,
        completions: &mut FuturesUnordered<JoinHandle<Completion>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let mut pending: VecDeque<(String, Vec<Assignee>)> = self.groups.clone().into_iter().collect();
        let mut free: VecDeque<usize> = (0..self.max_parallel).collect();

        loop {
            while !free.is_empty() && !pending.is_empty() {
                let (Some(offset), Some((unit, assignees))) = (free.pop_front(), pending.pop_front())
                else {
                    break;
                };
                let job = GroupJob {
                    session_id: self.session,
                    unit_name: unit.clone(),
                    offset,
                    assignees,
                };
                let handle = self.launcher.launch(job, sink.clone()).await?;
                self.bus.emit(
                    self.session,
                    event_types::PROCESS_STARTED,
                    &ProcessStartedPayload {
                        unit: unit.clone(),
                        offset,
                        pid: handle.pid,
                    },
                );
                let done = handle.done;
                completions.push(tokio::spawn(async move { (offset, join(done).await) }));
                in_flight.insert(
                    offset,
                    InFlight {
                        unit,
                        kill: handle.kill,
                    },
                );
            }

            if completions.is_empty() {
                return Ok(true);
            }

            tokio::select! {
                Some(completed) = completions.next() => {
                    let (offset, exit) = completed.map_err(|e| {
                        FleetError::command("scheduler", format!("group watcher failed: {e}"))
                    })?;
                    let Some(group) = in_flight.remove(&offset) else {
                        return Err(FleetError::command(
                            "scheduler",
                            format!("completion for unknown offset {offset}"),
                        ));
                    };
                    info!(
                        session_id = %self.session,
                        unit = %group.unit,
                        offset,
                        ?exit,
                        "Group ended"
                    );
                    self.bus.emit(
                        self.session,
                        event_types::PROCESS_FINISHED,
                        &ProcessFinishedPayload {
                            unit: group.unit,
                            offset,
                            exit,
                        },
                    );
                    free.push_back(offset);
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Terminate groups still in flight and wait briefly for each.
    async fn cleanup(
        &self,
        in_flight: HashMap<usize, InFlight>,
        mut completions: FuturesUnordered<JoinHandle<Completion>>,
    ) {
        if in_flight.is_empty() {
            return;
        }
        for (offset, group) in in_flight {
            warn!(session_id = %self.session, unit = %group.unit, offset, "Terminating group");
            let _ = group.kill.send(());
        }
        while !completions.is_empty() {
            match tokio::time::timeout(JOIN_TIMEOUT, completions.next()).await {
                Ok(Some(Ok((offset, exit)))) => {
                    debug!(session_id = %self.session, offset, ?exit, "Group joined");
                }
                Ok(Some(Err(e))) => warn!(session_id = %self.session, error = %e, "Group join failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(session_id = %self.session, "Group did not stop in time");
                    break;
                }
            }
        }
    }

    fn finish(&self) {
        if self.states.finish(self.session).is_none() {
            return;
        }
        info!(session_id = %self.session, job_id = %self.job_id, "Run finished");
        let payload = RunStatePayload {
            status: RunStatus::Finished,
            job_id: self.job_id,
            error: None,
        };
        self.bus
            .emit(self.session, event_types::RUN_STATE_CHANGED, &payload);
        self.bus.emit(self.session, event_types::RUN_FINISHED, &payload);
    }

    fn fail(&self, e: FleetError) {
        error!(session_id = %self.session, job_id = %self.job_id, error = %e, "Run failed");
        if self.states.fail(self.session, e.to_string()).is_none() {
            return;
        }
        let payload = RunStatePayload {
            status: RunStatus::Error,
            job_id: self.job_id,
            error: Some(e.to_string()),
        };
        self.bus
            .emit(self.session, event_types::RUN_STATE_CHANGED, &payload);
        self.bus.emit(self.session, event_types::RUN_ERROR, &payload);
    }
}

/// Assignee status implied by a group event.
pub fn status_for(event: &GroupEvent) -> Option<(&str, AssigneeStatus)> {
    match event {
        GroupEvent::AssigneeStarted { assignee_id, .. } => {
            Some((assignee_id.as_str(), AssigneeStatus::Active))
        }
        GroupEvent::AssigneeFinished {
            assignee_id,
            succeeded,
            ..
        } => Some((
            assignee_id.as_str(),
            if *succeeded {
                AssigneeStatus::Completed
            } else {
                AssigneeStatus::Failed
            },
        )),
        GroupEvent::AssigneeError { assignee_id, .. } => {
            Some((assignee_id.as_str(), AssigneeStatus::Failed))
        }
        _ => None,
    }
}

async fn apply_events(
    session: SessionId,
    mut rx: mpsc::UnboundedReceiver<GroupEvent>,
    registry: SharedRegistry,
    bus: EventBus,
) {
    while let Some(event) = rx.recv().await {
        if let Some((assignee_id, status)) = status_for(&event) {
            let updated = registry
                .lock()
                .await
                .update_assignee_status(assignee_id, status);
            match updated {
                Ok(true) => {}
                Ok(false) => warn!(assignee = %assignee_id, "Assignee vanished from registry"),
                Err(e) => error!(assignee = %assignee_id, error = %e, "Failed to record assignee status"),
            }
        }
        bus.emit(session, event.event_type(), &event.payload());
    }
}
