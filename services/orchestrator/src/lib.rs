//! emufleet orchestrator library.
//!
//! Keeps a pool of Android emulator + Appium execution units sized to the
//! registered work, and runs that work in parallel groups, one per unit.
//!
//! The binary (`orchestrator`) serves the HTTP API; `orchestrator run-group`
//! runs a single group as a child process of the server.

pub mod api;
pub mod automation;
pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod lease;
pub mod mock;
pub mod planner;
pub mod poll;
pub mod provisioner;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use error::{FleetError, Result};
