//! Athanor Core: types and collaborator traits for the projection daemon
//!
//! This crate defines the abstractions shared by every athanor component:
//! - Events, shard names, pages and progress records
//! - The `EventStore` contract the daemon reads from and commits to
//! - The `Subscription` contract user projections implement
//! - The `DistributedLock` contract used for hot/cold ownership
//! - Configuration for subscriptions and the daemon
//!
//! An in-memory store and lock table live in [`memory`] for tests and
//! embedded use.

pub mod config;
pub mod error;
pub mod memory;
pub mod observe;
pub mod traits;
pub mod types;

pub use config::{
    BackoffStrategy, DaemonConfig, DaemonMode, HighWaterConfig, RewindBehavior, StartPosition,
    SubscriptionOptions,
};
pub use error::{AthanorError, Result};
pub use memory::{InMemoryEventStore, InMemoryLock, InMemoryLocks};
pub use tokio_util::sync::CancellationToken;
pub use traits::{
    ChangeListener, CriticalFailure, DistributedLock, EventStore, NullChangeListener, PageRequest,
    ProjectionSession, ShardController, Subscription, SubscriptionFactory, SubscriptionSource,
};
pub use types::{
    CommitInfo, CommitOutcome, DeadLetterEvent, Event, EventFilter, EventMetadata, EventRange,
    HighWaterProbe, HighWaterStatistics, HighWaterStatus, NewEvent, ProjectionWrite, Sequence,
    ShardCommit, ShardExecutionState, ShardName, ShardState, ShardStatus, StreamId,
    DEFAULT_SHARD_KEY,
};
