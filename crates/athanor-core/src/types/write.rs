use super::dead_letter::DeadLetterEvent;
use super::event::Sequence;
use serde::{Deserialize, Serialize};

/// One buffered read-model mutation
///
/// The read model is a set of named document collections; backends decide
/// how collections are laid out physically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProjectionWrite {
    Upsert {
        collection: String,
        id: String,
        document: serde_json::Value,
    },
    Delete {
        collection: String,
        id: String,
    },
    Truncate {
        collection: String,
    },
}

impl ProjectionWrite {
    pub fn collection(&self) -> &str {
        match self {
            ProjectionWrite::Upsert { collection, .. }
            | ProjectionWrite::Delete { collection, .. }
            | ProjectionWrite::Truncate { collection } => collection,
        }
    }
}

/// Everything a shard persists atomically for one page
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCommit {
    pub shard_name: String,
    pub database: String,
    /// Progress the agent believes is currently persisted
    pub expected_sequence: Sequence,
    pub new_sequence: Sequence,
    pub writes: Vec<ProjectionWrite>,
    pub dead_letters: Vec<DeadLetterEvent>,
}

impl ShardCommit {
    pub fn is_progress_only(&self) -> bool {
        self.writes.is_empty() && self.dead_letters.is_empty()
    }
}

/// Result of an optimistic progress-and-writes commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Committed {
        writes_applied: usize,
    },
    /// Persisted progress no longer matched `expected_sequence`; nothing written
    Conflict {
        actual: Sequence,
    },
}

/// Summary of a single agent commit, passed to change listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub shard_name: String,
    pub floor: Sequence,
    pub ceiling: Sequence,
    pub events_applied: usize,
    pub writes_applied: usize,
    pub dead_letters: usize,
}
