//! Persisted catalog of units and assignees.
//!
//! A unit accepts new assignees while `active` and flips to `completed`
//! once it holds [`UNIT_CAPACITY`] of them. Assignees are created
//! `pending`; their unit binding is set once by the planner and their
//! status follows group runner progress.

mod store;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use store::{
    Assignee, AssigneeStatus, NewAssignee, Registry, RegistryError, StatusFilter, Unit, UnitStatus,
};

/// Maximum assignees bound to one unit.
pub const UNIT_CAPACITY: usize = 5;

/// Registry handle shared across the orchestrator. Holders serialize access.
pub type SharedRegistry = Arc<Mutex<Registry>>;

pub fn shared(registry: Registry) -> SharedRegistry {
    Arc::new(Mutex::new(registry))
}
