//! Shard-set ownership across nodes
//!
//! In `HotCold` mode every node competes for one distributed lock keyed by
//! the shard set. The holder runs the daemon; the rest poll. A failed health
//! check stops every agent before anything else happens, so two nodes never
//! write the same progress rows.

use athanor_core::config::DaemonMode;
use athanor_core::error::{AthanorError, Result};
use athanor_core::observe;
use athanor_core::traits::DistributedLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::daemon::ProjectionDaemon;
use crate::retry::sleep_or_cancel;

/// Stable lock id for a set of shard identities, independent of order
pub fn shard_set_lock_id(identities: &[String]) -> i64 {
    let mut sorted: Vec<&str> = identities.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    xxh3_64(sorted.join("\n").as_bytes()) as i64
}

pub struct HotColdCoordinator {
    daemon: Arc<ProjectionDaemon>,
    lock: Arc<dyn DistributedLock>,
    lock_id: i64,
    node_id: String,
    held: watch::Sender<bool>,
}

impl HotColdCoordinator {
    pub fn new(daemon: Arc<ProjectionDaemon>, lock: Arc<dyn DistributedLock>) -> Self {
        let lock_id = shard_set_lock_id(&daemon.shard_names());
        daemon.set_lease_held(false);
        let (held, _) = watch::channel(false);
        Self {
            daemon,
            lock,
            lock_id,
            node_id: Uuid::new_v4().to_string(),
            held,
        }
    }

    /// Name this node in logs
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        *self.held.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.held.subscribe()
    }

    /// Compete for the shard set until `token` fires
    ///
    /// On return no agent is running and the lock has been released.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let config = self.daemon.config();
        info!(node = %self.node_id, lock_id = self.lock_id, "Standing by for shard-set ownership");

        loop {
            match self.lock.try_acquire(self.lock_id).await {
                Ok(true) => {
                    self.set_held(true);
                    info!(node = %self.node_id, lock_id = self.lock_id, "Acquired shard-set ownership");
                    if let Err(e) = self.daemon.start_all().await {
                        warn!(node = %self.node_id, error = %e, "Not every shard started");
                    }

                    let lost = self.hold(&token).await;
                    if lost {
                        // refuse commits before the agents wind down
                        self.set_held(false);
                    }
                    self.daemon.stop_all().await;
                    self.set_held(false);

                    if let Err(e) = self.lock.release(self.lock_id).await {
                        debug!(node = %self.node_id, error = %e, "Lock release failed");
                    }
                    if !lost {
                        info!(node = %self.node_id, "Released shard-set ownership");
                        return Ok(());
                    }
                    warn!(node = %self.node_id, lock_id = self.lock_id, "Lost shard-set ownership, shards stopped");
                }
                Ok(false) => {
                    debug!(node = %self.node_id, lock_id = self.lock_id, "Shard set owned elsewhere");
                }
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, "Lock acquisition failed");
                }
            }

            if sleep_or_cancel(config.leadership_polling(), &token).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Health-check the held lock; `true` when ownership was lost
    ///
    /// A dropped lock connection ends the hold at once rather than at the
    /// next health check.
    async fn hold(&self, token: &CancellationToken) -> bool {
        let interval = self.daemon.config().health_check_interval();
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = self.lock.disconnected() => {
                    warn!(node = %self.node_id, lock_id = self.lock_id, "Lock connection lost");
                    return true;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match self.lock.is_held(self.lock_id).await {
                Ok(true) => continue,
                Ok(false) => return true,
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, "Lock health check failed");
                    return true;
                }
            }
        }
    }

    fn set_held(&self, held: bool) {
        self.daemon.set_lease_held(held);
        if self.held.send_replace(held) != held {
            observe::record_ownership_change(held);
        }
    }
}

/// Runs a daemon according to its configured [`DaemonMode`]
pub enum OwnershipCoordinator {
    Disabled,
    Solo(Arc<ProjectionDaemon>),
    HotCold(HotColdCoordinator),
}

impl OwnershipCoordinator {
    pub fn for_mode(
        daemon: Arc<ProjectionDaemon>,
        lock: Option<Arc<dyn DistributedLock>>,
    ) -> Result<Self> {
        match daemon.config().mode {
            DaemonMode::Disabled => Ok(OwnershipCoordinator::Disabled),
            DaemonMode::Solo => Ok(OwnershipCoordinator::Solo(daemon)),
            DaemonMode::HotCold => {
                let lock = lock.ok_or_else(|| {
                    AthanorError::Config("HotCold mode requires a distributed lock".into())
                })?;
                Ok(OwnershipCoordinator::HotCold(HotColdCoordinator::new(
                    daemon, lock,
                )))
            }
            DaemonMode::HotHot => Err(AthanorError::Config(
                "HotHot mode is not supported".into(),
            )),
        }
    }

    /// Drive the daemon until `token` fires, then stop it
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        match self {
            OwnershipCoordinator::Disabled => {
                info!("Projection daemon disabled, not running shards");
                Ok(())
            }
            OwnershipCoordinator::Solo(daemon) => {
                if let Err(e) = daemon.start_all().await {
                    warn!(error = %e, "Not every shard started");
                }
                token.cancelled().await;
                daemon.stop_all().await;
                Ok(())
            }
            OwnershipCoordinator::HotCold(coordinator) => coordinator.run(token).await,
        }
    }
}
