//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use emufleet_id::SessionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// One progress event as seen by a session observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic sequence within the session.
    pub seq: u64,

    /// When the event was emitted.
    pub occurred_at: DateTime<Utc>,

    /// Session the event belongs to.
    pub session_id: SessionId,

    /// Dotted event type (see [`crate::event_types`]).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event-specific payload.
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a serializable payload.
    pub fn new<P: Serialize>(
        session_id: SessionId,
        seq: u64,
        event_type: impl Into<String>,
        payload: &P,
    ) -> Result<Self, EventError> {
        Ok(Self {
            seq,
            occurred_at: Utc::now(),
            session_id,
            event_type: event_type.into(),
            data: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a typed struct.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, EventError> {
        serde_json::from_value(self.data.clone()).map_err(|e| EventError::InvalidPayload {
            event_type: self.event_type.clone(),
            message: e.to_string(),
        })
    }

    /// True if the event type is `event_type`.
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}
