//! Event type names and payloads.

use std::collections::BTreeMap;

use emufleet_id::JobId;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Stream
    pub const STREAM_OPENED: &str = "stream.opened";
    pub const PING: &str = "ping";

    // Capacity planning
    pub const CAPACITY_INPUT: &str = "capacity.input";
    pub const CAPACITY_PLAN: &str = "capacity.plan";

    // Provisioning
    pub const UNIT_TEMPLATE_ERROR: &str = "unit.template_error";
    pub const UNIT_SCAN_ERROR: &str = "unit.scan_error";
    pub const UNIT_EXISTING_REGISTERED: &str = "unit.existing_registered";
    pub const UNIT_EXISTING_SKIPPED: &str = "unit.existing_skipped";
    pub const UNIT_CLONE_STARTED: &str = "unit.clone_started";
    pub const UNIT_CLONE_FINISHED: &str = "unit.clone_finished";
    pub const UNIT_CLONE_ERROR: &str = "unit.clone_error";
    pub const UNITS_PROVISIONED: &str = "units.provisioned";

    // Ingestion
    pub const ASSIGNEE_UNASSIGNED: &str = "assignee.unassigned";
    pub const INGEST_FINISHED: &str = "ingest.finished";

    // Run lifecycle
    pub const RUN_PLANNED: &str = "run.planned";
    pub const RUN_STATE_CHANGED: &str = "run.state_changed";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_ERROR: &str = "run.error";

    // Scheduler slots
    pub const PROCESS_STARTED: &str = "group.process_started";
    pub const PROCESS_FINISHED: &str = "group.process_finished";

    // Group runner
    pub const GROUP_STARTED: &str = "group.started";
    pub const GROUP_INFRA_STARTED: &str = "group.infra_started";
    pub const GROUP_FINISHED: &str = "group.finished";
    pub const GROUP_ERROR: &str = "group.error";
    pub const GROUP_INFRA_STOPPED: &str = "group.infra_stopped";
    pub const ASSIGNEE_STARTED: &str = "assignee.started";
    pub const ASSIGNEE_FINISHED: &str = "assignee.finished";
    pub const ASSIGNEE_ERROR: &str = "assignee.error";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Run state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Error,
}

impl RunStatus {
    /// Finished and error are terminal until the session is closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Phase of a capacity planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    NoNewAssignees,
    Bootstrap,
    AfterBootstrap,
    RegistryOnly,
    Cloning,
}

/// How a group's isolated unit of work ended, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum GroupExit {
    /// Exited on its own with success.
    Completed,
    /// Exited on its own with a failure.
    Failed { detail: String },
    /// Forcibly terminated by the scheduler.
    Terminated,
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityInputPayload {
    pub incoming_total: usize,
    pub incoming_unique: usize,
    pub already_registered: usize,
    pub required_new: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPlanPayload {
    pub phase: PlanPhase,
    pub required: usize,
    pub capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deficit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clones_needed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered: Option<Vec<String>>,
}

impl CapacityPlanPayload {
    pub fn new(phase: PlanPhase, required: usize, capacity: usize) -> Self {
        Self {
            phase,
            required,
            capacity,
            deficit: None,
            clones_needed: None,
            registered: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRefPayload {
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneAttemptPayload {
    pub attempt: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSkippedPayload {
    pub unit: String,
    pub directory: String,
    pub descriptor: String,
}

/// A reported failure that did not stop the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub reason_code: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsProvisionedPayload {
    pub created: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssigneeUnassignedPayload {
    pub assignee_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFinishedPayload {
    pub rows: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlannedPayload {
    pub status_filter: String,
    pub max_parallel: usize,
    pub total_groups: usize,
    pub total_assignees: usize,
    pub groups: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatePayload {
    pub status: RunStatus,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStartedPayload {
    pub unit: String,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFinishedPayload {
    pub unit: String,
    pub offset: usize,
    #[serde(flatten)]
    pub exit: GroupExit,
}
