//! Unified athanor database interface
//!
//! Bundles the SQLite event store with a projection daemon built from a
//! subscription registry.

use crate::{
    AthanorError, DaemonConfig, DaemonMode, DistributedLock, EventStore, HotColdCoordinator,
    OwnershipCoordinator, ProjectionDaemon, Result, SqliteConfig, SqliteEventStore, SqliteLease,
    SubscriptionRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// File name of the database inside the base directory
pub const DATABASE_FILE: &str = "athanor.db";

/// Event store plus the daemon projecting it
pub struct AthanorDb {
    store: Arc<SqliteEventStore>,
    daemon: Arc<ProjectionDaemon>,
    base_path: PathBuf,
    node_id: String,
}

impl AthanorDb {
    /// Open an athanor database at the given directory
    ///
    /// Creates `{path}/athanor.db` on first use.
    pub fn open<P: AsRef<Path>>(path: P, registry: &SubscriptionRegistry) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        let sqlite_config = SqliteConfig::new(base_path.join(DATABASE_FILE));
        Self::open_with_config(base_path, sqlite_config, DaemonConfig::default(), registry)
    }

    /// Open with custom configurations
    pub fn open_with_config(
        base_path: PathBuf,
        sqlite_config: SqliteConfig,
        daemon_config: DaemonConfig,
        registry: &SubscriptionRegistry,
    ) -> Result<Self> {
        let store = Arc::new(SqliteEventStore::open(sqlite_config)?);
        let daemon = Arc::new(ProjectionDaemon::new(
            daemon_config,
            store.clone() as Arc<dyn EventStore>,
            registry,
        )?);

        Ok(Self {
            store,
            daemon,
            base_path,
            node_id: Uuid::new_v4().to_string(),
        })
    }

    /// Open only the store at `path`, for inspection and offline tooling
    pub fn open_store<P: AsRef<Path>>(path: P) -> Result<SqliteEventStore> {
        let file = path.as_ref().join(DATABASE_FILE);
        if !file.exists() {
            return Err(AthanorError::NotFound(format!(
                "no athanor database at {}",
                file.display()
            )));
        }
        SqliteEventStore::open(SqliteConfig::new(file))
    }

    pub fn store(&self) -> &Arc<SqliteEventStore> {
        &self.store
    }

    pub fn daemon(&self) -> &Arc<ProjectionDaemon> {
        &self.daemon
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Identity this process uses for ownership leases
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Coordinator for the configured daemon mode
    ///
    /// `HotCold` leases ownership through this database on a dedicated
    /// connection, so a dropped connection shows up as lost ownership.
    pub fn coordinator(&self) -> Result<OwnershipCoordinator> {
        if self.daemon.config().mode != DaemonMode::HotCold {
            return OwnershipCoordinator::for_mode(self.daemon.clone(), None);
        }

        let lease = SqliteLease::open(self.store.config(), self.node_id.clone())?;
        let lock: Arc<dyn DistributedLock> = Arc::new(lease);
        Ok(OwnershipCoordinator::HotCold(
            HotColdCoordinator::new(self.daemon.clone(), lock).with_node_id(self.node_id.clone()),
        ))
    }

    /// Run the daemon under its ownership mode until `token` fires
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(node = %self.node_id, path = %self.base_path.display(), "Running athanor daemon");
        self.coordinator()?.run(token).await
    }
}
