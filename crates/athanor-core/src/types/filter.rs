use super::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Shard-level event filter applied by the store before batching
///
/// Empty include sets match everything; exclusions always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub include_event_types: BTreeSet<String>,

    #[serde(default)]
    pub exclude_event_types: BTreeSet<String>,

    #[serde(default)]
    pub include_stream_types: BTreeSet<String>,

    #[serde(default)]
    pub exclude_stream_types: BTreeSet<String>,

    #[serde(default)]
    pub include_archived: bool,
}

impl EventFilter {
    /// Match every non-archived event
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include_event_types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn excluding_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.exclude_event_types.insert(event_type.into());
        self
    }

    pub fn including_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.include_stream_types.insert(stream_type.into());
        self
    }

    pub fn excluding_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.exclude_stream_types.insert(stream_type.into());
        self
    }

    pub fn with_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    /// Whether this filter lets every non-archived event through
    pub fn is_unfiltered(&self) -> bool {
        self.include_event_types.is_empty()
            && self.exclude_event_types.is_empty()
            && self.include_stream_types.is_empty()
            && self.exclude_stream_types.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if event.archived && !self.include_archived {
            return false;
        }

        if self.exclude_event_types.contains(&event.event_type) {
            return false;
        }
        if !self.include_event_types.is_empty()
            && !self.include_event_types.contains(&event.event_type)
        {
            return false;
        }

        match &event.stream_type {
            Some(stream_type) => {
                if self.exclude_stream_types.contains(stream_type) {
                    return false;
                }
                self.include_stream_types.is_empty()
                    || self.include_stream_types.contains(stream_type)
            }
            None => self.include_stream_types.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event::{EventMetadata, StreamId};
    use chrono::Utc;

    fn test_event(event_type: &str, stream_type: Option<&str>) -> Event {
        Event {
            sequence: 1,
            stream_id: StreamId::new("s1"),
            version: 1,
            event_type: event_type.to_string(),
            stream_type: stream_type.map(str::to_string),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
            metadata: EventMetadata::default(),
            tenant_id: None,
            archived: false,
        }
    }

    #[test]
    fn test_unfiltered_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.is_unfiltered());
        assert!(filter.matches(&test_event("A", None)));
        assert!(filter.matches(&test_event("B", Some("Trip"))));
    }

    #[test]
    fn test_event_type_allow_list() {
        let filter = EventFilter::event_types(["B", "E"]);
        assert!(filter.matches(&test_event("B", None)));
        assert!(filter.matches(&test_event("E", None)));
        assert!(!filter.matches(&test_event("A", None)));
    }

    #[test]
    fn test_exclusion_wins() {
        let filter = EventFilter::event_types(["B"]).excluding_event_type("B");
        assert!(!filter.matches(&test_event("B", None)));
    }

    #[test]
    fn test_stream_type_filters() {
        let filter = EventFilter::all().including_stream_type("Trip");
        assert!(filter.matches(&test_event("A", Some("Trip"))));
        assert!(!filter.matches(&test_event("A", Some("Invoice"))));
        assert!(!filter.matches(&test_event("A", None)));

        let filter = EventFilter::all().excluding_stream_type("Invoice");
        assert!(filter.matches(&test_event("A", Some("Trip"))));
        assert!(filter.matches(&test_event("A", None)));
        assert!(!filter.matches(&test_event("A", Some("Invoice"))));
    }

    #[test]
    fn test_archived_events() {
        let mut event = test_event("A", None);
        event.archived = true;

        assert!(!EventFilter::all().matches(&event));
        assert!(EventFilter::all().with_archived(true).matches(&event));
    }
}
