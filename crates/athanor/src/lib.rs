//! Athanor: asynchronous event projections
//!
//! Athanor keeps read models in step with an append-only event log:
//! - **Event store**: Global sequence, streams, read-model documents and
//!   shard progress in one SQLite database
//! - **Daemon**: One pipeline per shard with bounded fetch-ahead and
//!   atomic page commits
//! - **High-water detection**: Shards never read past a gap left by an
//!   uncommitted writer, and abandoned gaps are skipped
//! - **Ownership**: Hot/cold failover through a lease row
//!
//! # Quick Start
//!
//! ```no_run
//! use athanor::prelude::*;
//! use std::time::Duration;
//!
//! # async fn run(registry: SubscriptionRegistry) -> Result<()> {
//! // Open database and build a daemon for the registered subscriptions
//! let db = AthanorDb::open("./data", &registry)?;
//!
//! db.store().append("trip-1", vec![NewEvent::of_type("TripStarted")])?;
//!
//! // Run every shard until it has caught up
//! db.daemon().start_all().await?;
//! db.daemon().wait_for_non_stale_data(Duration::from_secs(5)).await?;
//! db.daemon().stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod prelude;

// Re-export core types
pub use athanor_core::{
    config::{
        BackoffStrategy, DaemonConfig, DaemonMode, HighWaterConfig, RewindBehavior,
        StartPosition, SubscriptionOptions,
    },
    error::{AthanorError, Result},
    memory::{InMemoryEventStore, InMemoryLock, InMemoryLocks},
    traits::{
        ChangeListener, DistributedLock, EventStore, NullChangeListener, PageRequest,
        ProjectionSession, ShardController, Subscription, SubscriptionSource,
    },
    types::{
        CommitInfo, CommitOutcome, DeadLetterEvent, Event, EventFilter, EventMetadata,
        EventRange, HighWaterStatistics, HighWaterStatus, NewEvent, ProjectionWrite, Sequence,
        ShardCommit, ShardExecutionState, ShardName, ShardState, ShardStatus, StreamId,
    },
    CancellationToken,
};

// Re-export implementations
pub use athanor_daemon::{
    shard_set_lock_id, AgentSettings, HotColdCoordinator, OwnershipCoordinator,
    ProjectionDaemon, RewindTarget, SequenceTracker, ShardAgent, SubscriptionRegistry,
};
pub use athanor_sqlite::{SqliteConfig, SqliteEventStore, SqliteLease, SynchronousMode};

// Re-export main types from this crate
pub use db::AthanorDb;
