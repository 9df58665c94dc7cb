use super::event::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw answer from the store about committed sequence visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterProbe {
    /// Highest sequence reserved so far, committed or not
    pub highest_sequence: Sequence,
    /// Largest S >= the probe start such that every sequence in
    /// (start, S] is committed
    pub contiguous_through: Sequence,
}

impl HighWaterProbe {
    pub fn has_gap(&self) -> bool {
        self.contiguous_through < self.highest_sequence
    }
}

/// Result of one detector pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterStatus {
    pub current_mark: Sequence,
    pub highest_sequence: Sequence,
    /// A gap below `highest_sequence` has held the mark still for a while
    pub is_stale: bool,
}

impl HighWaterStatus {
    pub fn caught_up(&self) -> bool {
        self.current_mark >= self.highest_sequence
    }
}

/// Detector bookkeeping surfaced to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterStatistics {
    pub last_mark: Sequence,
    pub current_mark: Sequence,
    pub highest_sequence: Sequence,
    pub skipped_gaps: u64,
    pub last_updated: DateTime<Utc>,
}
