use super::event::{Event, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event a subscription declined to process, recorded instead of halting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub shard_name: String,
    pub projection_name: String,
    pub event_sequence: Sequence,
    pub event_type: String,
    pub exception_type: String,
    pub exception_message: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(
        shard_name: impl Into<String>,
        projection_name: impl Into<String>,
        event: &Event,
        exception_type: impl Into<String>,
        exception_message: impl Into<String>,
    ) -> Self {
        Self {
            shard_name: shard_name.into(),
            projection_name: projection_name.into(),
            event_sequence: event.sequence,
            event_type: event.event_type.clone(),
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
            recorded_at: Utc::now(),
        }
    }
}
