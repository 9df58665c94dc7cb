//! Athanor Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use athanor::prelude::*;
//! ```

// Core types
pub use crate::{
    AthanorDb, AthanorError, DeadLetterEvent, Event, EventRange, NewEvent, Result, Sequence,
    ShardExecutionState, ShardName, ShardState, ShardStatus, StreamId,
};

// Configs
pub use crate::{
    BackoffStrategy, DaemonConfig, DaemonMode, HighWaterConfig, RewindBehavior, SqliteConfig,
    StartPosition, SubscriptionOptions,
};

// Traits
pub use crate::{ChangeListener, DistributedLock, EventStore, Subscription};

// Handler capabilities
pub use crate::{
    CancellationToken, CommitInfo, NullChangeListener, ProjectionSession, ShardCommit,
    ShardController, SubscriptionSource,
};

// Implementations
pub use crate::{InMemoryEventStore, InMemoryLocks, SqliteEventStore, SqliteLease};

// Daemon
pub use crate::{OwnershipCoordinator, ProjectionDaemon, RewindTarget, SubscriptionRegistry};
