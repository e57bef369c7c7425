//! Error types for event handling.

use thiserror::Error;

/// Errors raised while routing or decoding an event.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The name does not map to a known resource transition.
    #[error("unknown event name: {0}")]
    UnknownEventName(String),

    /// A payload member the handler needs is absent.
    #[error("event {event} is missing {member}")]
    MissingData {
        event: String,
        member: &'static str,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
