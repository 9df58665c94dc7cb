//! Daemon: asynchronous projection processing
//!
//! Drives user subscriptions over the event log, one independent pipeline
//! per shard.
//!
//! Key features:
//! - High-water detection with stale-gap skipping
//! - Bounded fetch-ahead (the hopper) with backpressure
//! - Atomic page commits: writes, dead letters and progress together
//! - Pause, resume and rewind per shard
//! - Hot/cold ownership through a distributed lock

pub mod agent;
pub mod daemon;
pub mod fetcher;
pub mod high_water;
pub mod ownership;
pub mod queue;
pub mod registry;
mod retry;
pub mod tracker;

pub use agent::{AgentSettings, RewindTarget, ShardAgent};
pub use daemon::ProjectionDaemon;
pub use fetcher::EventFetcher;
pub use high_water::{HighWaterAgent, HighWaterDetector};
pub use ownership::{shard_set_lock_id, HotColdCoordinator, OwnershipCoordinator};
pub use queue::{QueueOptions, ShardExecutionQueue};
pub use registry::{SubscriptionRegistration, SubscriptionRegistry};
pub use tracker::SequenceTracker;
