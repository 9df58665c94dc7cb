use super::event::{Event, Sequence};
use super::shard::ShardName;

/// Contiguous, ordered page of events for one shard
///
/// Covers the sequence window `(floor, ceiling]`. Bounds are raw store
/// positions so resuming from `ceiling` is exact even when filters leave
/// the page sparse or empty.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRange {
    pub shard: ShardName,
    pub floor: Sequence,
    pub ceiling: Sequence,
    pub events: Vec<Event>,
}

impl EventRange {
    pub fn new(shard: ShardName, floor: Sequence, ceiling: Sequence) -> Self {
        Self {
            shard,
            floor,
            ceiling,
            events: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of raw sequence positions this page advances the shard by
    pub fn span(&self) -> u64 {
        self.ceiling.saturating_sub(self.floor)
    }

    /// Check ordering and bounds; returns the first offending sequence
    pub fn find_violation(&self) -> Option<Sequence> {
        let mut previous = self.floor;
        for event in &self.events {
            if event.sequence <= previous || event.sequence > self.ceiling {
                return Some(event.sequence);
            }
            previous = event.sequence;
        }
        None
    }
}

impl std::fmt::Display for EventRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}..={}, {} events)",
            self.shard,
            self.floor,
            self.ceiling,
            self.events.len()
        )
    }
}
