use crate::error::{AthanorError, Result};
use crate::types::{EventFilter, Sequence, ShardName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a shard starts when it has no persisted progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartPosition {
    /// Replay the whole log
    #[default]
    FromBeginning,
    /// Skip everything already appended at startup
    FromPresent,
    /// Resume after the given sequence
    FromSequence(Sequence),
    /// Resume after the last event appended before this instant
    FromTime(DateTime<Utc>),
}

/// What a rewind does to previously projected state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RewindBehavior {
    /// Only move progress; the handler tolerates replays
    #[default]
    ResetProgress,
    /// Truncate these collections before replaying from zero
    Teardown { collections: Vec<String> },
}

/// Recognized options for one async subscription or projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub name: String,

    /// Bumping the version yields a new shard identity
    /// Default: 1
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_shard_key")]
    pub shard_key: String,

    #[serde(default)]
    pub include_event_types: BTreeSet<String>,

    #[serde(default)]
    pub exclude_event_types: BTreeSet<String>,

    #[serde(default)]
    pub include_stream_types: BTreeSet<String>,

    #[serde(default)]
    pub exclude_stream_types: BTreeSet<String>,

    #[serde(default)]
    pub include_archived_events: bool,

    /// Maximum number of filtered events per page
    /// Default: 500
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of fetched-but-unapplied events per shard
    /// Default: 2500
    #[serde(default = "default_maximum_hopper_size")]
    pub maximum_hopper_size: usize,

    #[serde(default)]
    pub start_position: StartPosition,

    /// Restrict this subscription to one named database
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub rewind_behavior: RewindBehavior,
}

fn default_version() -> u32 {
    1
}

fn default_shard_key() -> String {
    crate::types::DEFAULT_SHARD_KEY.to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_maximum_hopper_size() -> usize {
    2500
}

impl SubscriptionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            shard_key: default_shard_key(),
            include_event_types: BTreeSet::new(),
            exclude_event_types: BTreeSet::new(),
            include_stream_types: BTreeSet::new(),
            exclude_stream_types: BTreeSet::new(),
            include_archived_events: false,
            batch_size: default_batch_size(),
            maximum_hopper_size: default_maximum_hopper_size(),
            start_position: StartPosition::default(),
            database: None,
            rewind_behavior: RewindBehavior::default(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_shard_key(mut self, shard_key: impl Into<String>) -> Self {
        self.shard_key = shard_key.into();
        self
    }

    pub fn include_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.include_event_types.insert(event_type.into());
        self
    }

    pub fn exclude_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.exclude_event_types.insert(event_type.into());
        self
    }

    pub fn include_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.include_stream_types.insert(stream_type.into());
        self
    }

    pub fn exclude_stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.exclude_stream_types.insert(stream_type.into());
        self
    }

    pub fn with_archived_events(mut self, include: bool) -> Self {
        self.include_archived_events = include;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_maximum_hopper_size(mut self, size: usize) -> Self {
        self.maximum_hopper_size = size;
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn for_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_rewind_behavior(mut self, behavior: RewindBehavior) -> Self {
        self.rewind_behavior = behavior;
        self
    }

    pub fn shard_name(&self) -> ShardName {
        ShardName::new(self.name.clone())
            .with_key(self.shard_key.clone())
            .with_version(self.version)
    }

    pub fn filter(&self) -> EventFilter {
        EventFilter {
            include_event_types: self.include_event_types.clone(),
            exclude_event_types: self.exclude_event_types.clone(),
            include_stream_types: self.include_stream_types.clone(),
            exclude_stream_types: self.exclude_stream_types.clone(),
            include_archived: self.include_archived_events,
        }
    }

    /// Whether this subscription runs against the named database
    pub fn applies_to(&self, database: &str) -> bool {
        self.database.as_deref().map_or(true, |d| d == database)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(':') {
            return Err(AthanorError::Config(format!(
                "Subscription name '{}' must be non-empty and must not contain ':'",
                self.name
            )));
        }
        if self.shard_key.is_empty() || self.shard_key.contains(':') {
            return Err(AthanorError::Config(format!(
                "Shard key '{}' must be non-empty and must not contain ':'",
                self.shard_key
            )));
        }
        if self.version == 0 {
            return Err(AthanorError::Config(format!(
                "Subscription {} version must be at least 1",
                self.name
            )));
        }
        if self.batch_size == 0 {
            return Err(AthanorError::Config(format!(
                "Subscription {} batch_size must be positive",
                self.name
            )));
        }
        if self.maximum_hopper_size < self.batch_size {
            return Err(AthanorError::Config(format!(
                "Subscription {} maximum_hopper_size ({}) must be >= batch_size ({})",
                self.name, self.maximum_hopper_size, self.batch_size
            )));
        }
        Ok(())
    }
}
