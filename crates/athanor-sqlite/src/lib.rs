//! SQLite backend for athanor
//!
//! One database file holds the event log, stream metadata, shard progress,
//! dead letters, projected documents and daemon leases.
//!
//! Key features:
//! - Sequence reservation separate from event commit, so in-flight writers
//!   leave visible gaps for high-water detection
//! - Atomic page commits: writes, dead letters and progress in one transaction
//! - Expiring lease rows implementing `DistributedLock`
//! - WAL mode for concurrent readers

pub mod config;
pub mod lease;
pub mod schema;
pub mod store;

pub use config::{SqliteConfig, SynchronousMode};
pub use lease::SqliteLease;
pub use store::SqliteEventStore;
