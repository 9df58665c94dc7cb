use crate::error::Result;
use async_trait::async_trait;

/// Distributed mutex keyed by a numeric shard-set id
///
/// Each instance represents one node's handle; ownership is tracked per
/// instance. The primitive behind it (advisory lock, lease row, external
/// lease service) is an implementation choice.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock without waiting; `true` when this node now holds it
    async fn try_acquire(&self, lock_id: i64) -> Result<bool>;

    /// Health check for a held lock
    ///
    /// Lease-based implementations renew here. `false` or an error means
    /// ownership can no longer be assumed.
    async fn is_held(&self, lock_id: i64) -> Result<bool>;

    async fn release(&self, lock_id: i64) -> Result<()>;

    /// Resolves once this node's connection to the lock is known to be gone
    ///
    /// Lets a holder react between health checks. Backends without such a
    /// signal keep the default, which never resolves.
    async fn disconnected(&self) {
        std::future::pending::<()>().await
    }
}
