//! # emufleet-id
//!
//! Typed identifiers for orchestration sessions and the jobs they run.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D` for an orchestration session
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for one launched run inside a session
//!
//! The prefix keeps a session id from being passed where a job id is
//! expected, and the ULID keeps ids sortable by creation time.
//!
//! Units and assignees are keyed by externally chosen strings (clone names,
//! account names) and have no typed ids.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
