pub mod lock;
pub mod store;
pub mod subscription;

pub use lock::DistributedLock;
pub use store::{EventStore, PageRequest};
pub use subscription::{
    ChangeListener, CriticalFailure, NullChangeListener, ProjectionSession, ShardController,
    Subscription, SubscriptionFactory, SubscriptionSource,
};
