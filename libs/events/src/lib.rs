//! # emufleet-events
//!
//! Progress events reported by the orchestrator to a live observer.
//!
//! Events are informational: nothing in the orchestrator branches on them.
//! They flow through a per-session bus and out over an SSE stream.
//!
//! ## Event Envelope
//!
//! Every event carries:
//! - the owning session (`session_id`)
//! - a per-session sequence number (`seq`)
//! - a dotted type name (`capacity.plan`, `assignee.finished`, ...)
//! - a JSON payload
//!
//! ## Group Events
//!
//! A group runner may live in a separate OS process. It reports through
//! [`GroupEvent`], a closed enum that is written as one JSON object per line
//! and re-published by the parent on the session bus.

mod envelope;
mod error;
mod group;
mod types;

pub use envelope::EventEnvelope;
pub use error::EventError;
pub use group::GroupEvent;
pub use types::*;
