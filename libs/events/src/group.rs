//! Events produced by a group runner.

use serde::{Deserialize, Serialize};

use crate::{event_types, EventError};

/// Progress of one group runner.
///
/// Serialized as an internally tagged JSON object so a child process can
/// write one per line on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupEvent {
    Started {
        unit: String,
        assignees: usize,
        offset: usize,
    },
    InfraStarted {
        unit: String,
        identifier: String,
        control_port: u16,
    },
    AssigneeStarted {
        unit: String,
        assignee_id: String,
    },
    AssigneeFinished {
        unit: String,
        assignee_id: String,
        succeeded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<String>,
    },
    AssigneeError {
        unit: String,
        assignee_id: String,
        reason_code: String,
        error: String,
    },
    Finished {
        unit: String,
    },
    Error {
        unit: String,
        reason_code: String,
        error: String,
    },
    InfraStopped {
        unit: String,
    },
}

impl GroupEvent {
    /// The bus event type this group event is published under.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => event_types::GROUP_STARTED,
            Self::InfraStarted { .. } => event_types::GROUP_INFRA_STARTED,
            Self::AssigneeStarted { .. } => event_types::ASSIGNEE_STARTED,
            Self::AssigneeFinished { .. } => event_types::ASSIGNEE_FINISHED,
            Self::AssigneeError { .. } => event_types::ASSIGNEE_ERROR,
            Self::Finished { .. } => event_types::GROUP_FINISHED,
            Self::Error { .. } => event_types::GROUP_ERROR,
            Self::InfraStopped { .. } => event_types::GROUP_INFRA_STOPPED,
        }
    }

    /// Unit the event is about.
    pub fn unit(&self) -> &str {
        match self {
            Self::Started { unit, .. }
            | Self::InfraStarted { unit, .. }
            | Self::AssigneeStarted { unit, .. }
            | Self::AssigneeFinished { unit, .. }
            | Self::AssigneeError { unit, .. }
            | Self::Finished { unit }
            | Self::Error { unit, .. }
            | Self::InfraStopped { unit } => unit,
        }
    }

    /// The payload published on the bus: the event fields without the tag.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("kind");
        }
        value
    }

    /// Encode as a single line (no trailing newline).
    pub fn to_line(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line written by [`GroupEvent::to_line`].
    pub fn from_line(line: &str) -> Result<Self, EventError> {
        serde_json::from_str(line.trim()).map_err(|e| EventError::MalformedLine(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_roundtrip() {
        let event = GroupEvent::AssigneeFinished {
            unit: "Nexus_5_API_31_Clone2".to_string(),
            assignee_id: "alice".to_string(),
            succeeded: true,
            artifact: Some("recordings/emulator-5574_alice_20250101_120000.mp4".to_string()),
        };
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(GroupEvent::from_line(&line).unwrap(), event);
    }

    #[test]
    fn test_payload_drops_tag() {
        let event = GroupEvent::Error {
            unit: "u1".to_string(),
            reason_code: "already_running".to_string(),
            error: "a device is already attached".to_string(),
        };
        let payload = event.payload();
        assert!(payload.get("kind").is_none());
        assert_eq!(payload["unit"], "u1");
        assert_eq!(event.event_type(), event_types::GROUP_ERROR);
    }

    #[test]
    fn test_from_line_rejects_garbage() {
        let err = GroupEvent::from_line("emulator: warning: HAX is not working").unwrap_err();
        assert!(matches!(err, EventError::MalformedLine(_)));
    }

    #[test]
    fn test_unit_accessor() {
        let event = GroupEvent::InfraStopped {
            unit: "u7".to_string(),
        };
        assert_eq!(event.unit(), "u7");
    }
}
