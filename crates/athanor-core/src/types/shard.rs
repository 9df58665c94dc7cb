use super::event::Sequence;
use crate::error::AthanorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SHARD_KEY: &str = "All";

/// Stable identity of one independently progressing unit of projection work
///
/// Renders as `"{Name}:{Key}"`, or `"{Name}:V{n}:{Key}"` once the
/// projection version is bumped past 1 so that a new definition never
/// resumes from an incompatible predecessor's progress row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardName {
    pub projection_name: String,
    pub shard_key: String,
    pub version: u32,
}

impl ShardName {
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            shard_key: DEFAULT_SHARD_KEY.to_string(),
            version: 1,
        }
    }

    pub fn with_key(mut self, shard_key: impl Into<String>) -> Self {
        self.shard_key = shard_key.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Persisted key and management-call identity
    pub fn identity(&self) -> String {
        if self.version > 1 {
            format!(
                "{}:V{}:{}",
                self.projection_name, self.version, self.shard_key
            )
        } else {
            format!("{}:{}", self.projection_name, self.shard_key)
        }
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

impl FromStr for ShardName {
    type Err = AthanorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [name, key] if !name.is_empty() && !key.is_empty() => {
                Ok(ShardName::new(*name).with_key(*key))
            }
            [name, version, key] if !name.is_empty() && !key.is_empty() => {
                let version = version
                    .strip_prefix('V')
                    .and_then(|v| v.parse::<u32>().ok())
                    .ok_or_else(|| {
                        AthanorError::Config(format!("Invalid shard version in '{}'", s))
                    })?;
                Ok(ShardName::new(*name).with_key(*key).with_version(version))
            }
            _ => Err(AthanorError::Config(format!(
                "Invalid shard name '{}', expected Name:Key or Name:V<n>:Key",
                s
            ))),
        }
    }
}

/// Persisted progress row: the last sequence durably applied by a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_name: String,
    pub sequence: Sequence,
    pub database: String,
    pub updated_at: DateTime<Utc>,
}

impl ShardState {
    pub fn new(shard_name: impl Into<String>, sequence: Sequence, database: impl Into<String>) -> Self {
        Self {
            shard_name: shard_name.into(),
            sequence,
            database: database.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Runtime state of a shard agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardExecutionState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    /// Halted after a critical failure; stays here until restarted or rewound
    Errored,
}

impl ShardExecutionState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ShardExecutionState::Starting
                | ShardExecutionState::Running
                | ShardExecutionState::Paused
        )
    }
}

impl fmt::Display for ShardExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardExecutionState::Stopped => "stopped",
            ShardExecutionState::Starting => "starting",
            ShardExecutionState::Running => "running",
            ShardExecutionState::Paused => "paused",
            ShardExecutionState::Stopping => "stopping",
            ShardExecutionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a shard for operators and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub name: String,
    pub state: ShardExecutionState,
    pub position: Sequence,
    pub error: Option<String>,
    pub events_processed: u64,
    pub dead_letters: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_formats() {
        assert_eq!(ShardName::new("Fake").identity(), "Fake:All");
        assert_eq!(
            ShardName::new("Trips").with_key("Tenant1").identity(),
            "Trips:Tenant1"
        );
        assert_eq!(
            ShardName::new("Trips").with_version(3).identity(),
            "Trips:V3:All"
        );
    }

    #[test]
    fn test_parse_identity() {
        let parsed: ShardName = "Kafka:All".parse().unwrap();
        assert_eq!(parsed, ShardName::new("Kafka"));

        let parsed: ShardName = "Trips:V2:East".parse().unwrap();
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.shard_key, "East");

        assert!("NoKey".parse::<ShardName>().is_err());
        assert!("Trips:X2:East".parse::<ShardName>().is_err());
    }
}
