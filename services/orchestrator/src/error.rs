//! Error types for the orchestrator.

use emufleet_events::RunStatus;
use thiserror::Error;

use crate::registry::RegistryError;

/// Orchestrator errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The template environment is missing its directory or descriptor.
    #[error("template_missing: {0}")]
    TemplateMissing(String),

    /// A file operation failed while cloning a unit.
    #[error("clone_io_error: unit {unit}: {source}")]
    CloneIo {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    /// The control-plane server did not become ready in time.
    #[error("startup_timeout: control plane at {host}:{port} not ready after {waited_secs}s")]
    StartupTimeout {
        host: String,
        port: u16,
        waited_secs: u64,
    },

    /// A unit readiness phase exceeded its budget.
    #[error("timeout: {phase} not reached after {waited_secs}s")]
    Timeout { phase: String, waited_secs: u64 },

    /// A device is already attached.
    #[error("already_running: attached devices {attached:?}")]
    AlreadyRunning { attached: Vec<String> },

    /// The launched unit is not attached under the expected identifier.
    #[error("device_mismatch: expected {expected}, attached {attached:?}")]
    DeviceMismatch {
        expected: String,
        attached: Vec<String>,
    },

    /// A run is active or finished for this session.
    #[error("conflict: session {session} is {status}")]
    Conflict { session: String, status: RunStatus },

    /// No free port in the scanned range.
    #[error("no_free_port: none free in {tries} candidates from {start}")]
    NoFreePort { start: u16, tries: u16 },

    /// An explicitly requested port is taken.
    #[error("port_in_use: {0}")]
    PortInUse(u16),

    /// Starting control-plane servers is switched off.
    #[error("control_plane_disabled: nothing healthy at {host}:{port} and server start is disabled")]
    ControlPlaneDisabled { host: String, port: u16 },

    /// A slot offset whose ports fall outside the u16 range.
    #[error("slot_out_of_range: slot {offset} has no valid port pair")]
    SlotOutOfRange { offset: usize },

    /// A launch matched no assigned assignees.
    #[error("no_assignees: nothing matches status filter {0}")]
    NoAssignees(String),

    /// The session is not open.
    #[error("unknown_session: {0}")]
    UnknownSession(String),

    /// Registry failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// An external command failed.
    #[error("command_failed: {program}: {detail}")]
    Command { program: String, detail: String },

    /// WebDriver call failed.
    #[error("driver_error: {0}")]
    Driver(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            FleetError::TemplateMissing(_) => "template_missing",
            FleetError::CloneIo { .. } => "clone_io_error",
            FleetError::StartupTimeout { .. } => "startup_timeout",
            FleetError::Timeout { .. } => "timeout",
            FleetError::AlreadyRunning { .. } => "already_running",
            FleetError::DeviceMismatch { .. } => "device_mismatch",
            FleetError::Conflict { .. } => "conflict",
            FleetError::NoFreePort { .. } => "no_free_port",
            FleetError::PortInUse(_) => "port_in_use",
            FleetError::ControlPlaneDisabled { .. } => "control_plane_disabled",
            FleetError::SlotOutOfRange { .. } => "slot_out_of_range",
            FleetError::NoAssignees(_) => "no_assignees",
            FleetError::UnknownSession(_) => "unknown_session",
            FleetError::Registry(_) => "registry_error",
            FleetError::Command { .. } => "command_failed",
            FleetError::Driver(_) => "driver_error",
            FleetError::Io(_) => "io_error",
        }
    }

    pub(crate) fn command(program: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        FleetError::Command {
            program: program.into(),
            detail: detail.to_string(),
        }
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        FleetError::Driver(e.to_string())
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
