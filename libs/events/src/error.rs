//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when encoding or decoding events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event payload does not match the requested shape.
    #[error("invalid event payload for {event_type}: {message}")]
    InvalidPayload { event_type: String, message: String },

    /// A group event line could not be decoded.
    #[error("malformed group event line: {0}")]
    MalformedLine(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
