pub mod daemon;
pub mod retry;
pub mod subscription;

pub use daemon::{DaemonConfig, DaemonMode, HighWaterConfig};
pub use retry::BackoffStrategy;
pub use subscription::{RewindBehavior, StartPosition, SubscriptionOptions};
