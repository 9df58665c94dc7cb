use crate::error::Result;
use crate::types::{
    CommitOutcome, DeadLetterEvent, EventFilter, EventRange, HighWaterProbe, Sequence,
    ShardCommit, ShardName, ShardState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Parameters for one page fetch
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub shard: ShardName,
    pub filter: EventFilter,
    /// Exclusive lower bound
    pub floor: Sequence,
    /// Inclusive upper bound
    pub ceiling: Sequence,
    /// Maximum number of matching events to return
    pub batch_size: usize,
}

/// Durable event store and progress storage as seen by the daemon
///
/// Implementations own the physical layout. The daemon relies only on the
/// contracts documented per method.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fetch the next page of matching events in `(floor, ceiling]`
    ///
    /// Returns at most `batch_size` events that pass `filter`, strictly
    /// ascending. When the batch fills up, the returned range's ceiling is
    /// the last returned sequence; otherwise it is the requested ceiling.
    /// A page with no matching events still spans the requested bounds.
    async fn fetch_page(
        &self,
        request: &PageRequest,
        token: &CancellationToken,
    ) -> Result<EventRange>;

    /// Report the highest reserved sequence and how far committed events
    /// run without a hole, starting after `from`
    async fn detect_high_water(
        &self,
        from: Sequence,
        token: &CancellationToken,
    ) -> Result<HighWaterProbe>;

    async fn load_progress(&self, shard_name: &str) -> Result<Option<ShardState>>;

    async fn all_progress(&self) -> Result<Vec<ShardState>>;

    /// Apply writes, dead letters and the progress move in one transaction
    ///
    /// Fails with `Conflict` and persists nothing when stored progress does
    /// not equal `commit.expected_sequence`. Must not begin once `token` is
    /// cancelled; once begun, runs to completion.
    async fn commit_progress_and_writes(
        &self,
        commit: ShardCommit,
        token: &CancellationToken,
    ) -> Result<CommitOutcome>;

    /// Set progress unconditionally, truncating `teardown` collections in
    /// the same transaction
    async fn reset_progress(
        &self,
        shard_name: &str,
        database: &str,
        sequence: Sequence,
        teardown: &[String],
    ) -> Result<()>;

    /// Record a dead letter outside any page commit
    ///
    /// Agents never call this; their dead letters travel inside
    /// [`ShardCommit`] so they land atomically with progress. It exists for
    /// operator tooling and imports that park events by hand.
    async fn append_dead_letter(&self, record: DeadLetterEvent) -> Result<()>;

    /// Most recent dead letters first
    async fn dead_letters(
        &self,
        shard_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>>;

    /// Greatest committed sequence whose timestamp is earlier than `timestamp`
    async fn sequence_before(&self, timestamp: DateTime<Utc>) -> Result<Sequence>;
}
