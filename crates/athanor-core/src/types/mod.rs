pub mod dead_letter;
pub mod event;
pub mod filter;
pub mod high_water;
pub mod range;
pub mod shard;
pub mod write;

pub use dead_letter::DeadLetterEvent;
pub use event::{Event, EventMetadata, NewEvent, Sequence, StreamId};
pub use filter::EventFilter;
pub use high_water::{HighWaterProbe, HighWaterStatistics, HighWaterStatus};
pub use range::EventRange;
pub use shard::{
    ShardExecutionState, ShardName, ShardState, ShardStatus, DEFAULT_SHARD_KEY,
};
pub use write::{CommitInfo, CommitOutcome, ProjectionWrite, ShardCommit};
