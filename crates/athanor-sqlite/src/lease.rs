//! Expiring lease rows used as the ownership lock for hot/cold daemons
//!
//! A lease is held while `lease_until` is in the future. `is_held` renews it,
//! so the health check doubles as the heartbeat; a failed renewal means the
//! node has lost ownership or its connection. Each node also tracks when its
//! own lease runs out, so a holder that cannot renew in time learns about it
//! without waiting for the next health check.

use athanor_core::{
    error::{AthanorError, Result},
    traits::DistributedLock,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SqliteConfig;
use crate::schema;
use crate::store::{blocking, db_err, SqliteEventStore};

pub struct SqliteLease {
    conn: Arc<Mutex<Connection>>,
    node_id: String,
    lease_duration: Duration,
    /// Local deadline of the last successful acquire or renewal
    valid_until: Mutex<Option<Instant>>,
}

impl SqliteLease {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        node_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            conn,
            node_id: node_id.into(),
            lease_duration,
            valid_until: Mutex::new(None),
        }
    }

    /// Open a dedicated connection, as a separate process would
    pub fn open(config: &SqliteConfig, node_id: impl Into<String>) -> Result<Self> {
        let conn = SqliteEventStore::connect(config)?;
        schema::init_schema(&conn)?;
        Ok(Self::new(
            Arc::new(Mutex::new(conn)),
            node_id,
            config.lease_duration(),
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Record the outcome of an acquire or renewal started at `attempted`
    fn track(&self, attempted: Instant, held: bool) {
        *self.valid_until.lock() = held.then(|| attempted + self.lease_duration);
    }
}

#[async_trait]
impl DistributedLock for SqliteLease {
    async fn try_acquire(&self, lock_id: i64) -> Result<bool> {
        let attempted = Instant::now();
        let node_id = self.node_id.clone();
        let lease_ms = self.lease_duration.as_millis() as i64;
        let acquired = blocking(&self.conn, move |conn| {
            let now = Self::now_ms();
            let changed = conn
                .execute(
                    "INSERT INTO daemon_leases (lock_id, leased_by, lease_until)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(lock_id) DO UPDATE SET
                        leased_by = excluded.leased_by,
                        lease_until = excluded.lease_until
                     WHERE daemon_leases.leased_by = excluded.leased_by
                        OR daemon_leases.lease_until < ?4",
                    params![lock_id, node_id, now + lease_ms, now],
                )
                .map_err(|e| AthanorError::Lock(e.to_string()))?;
            Ok(changed > 0)
        })
        .await;

        self.track(attempted, matches!(acquired, Ok(true)));
        let acquired = acquired?;
        if acquired {
            debug!(lock_id, node = %self.node_id, "Acquired lease");
        }
        Ok(acquired)
    }

    async fn is_held(&self, lock_id: i64) -> Result<bool> {
        let attempted = Instant::now();
        let node_id = self.node_id.clone();
        let lease_ms = self.lease_duration.as_millis() as i64;
        let renewed = blocking(&self.conn, move |conn| {
            let now = Self::now_ms();
            let changed = conn
                .execute(
                    "UPDATE daemon_leases SET lease_until = ?3
                     WHERE lock_id = ?1 AND leased_by = ?2 AND lease_until >= ?4",
                    params![lock_id, node_id, now + lease_ms, now],
                )
                .map_err(|e| AthanorError::Lock(e.to_string()))?;
            Ok(changed == 1)
        })
        .await;

        self.track(attempted, matches!(renewed, Ok(true)));
        renewed
    }

    async fn release(&self, lock_id: i64) -> Result<()> {
        *self.valid_until.lock() = None;
        let node_id = self.node_id.clone();
        blocking(&self.conn, move |conn| {
            conn.execute(
                "DELETE FROM daemon_leases WHERE lock_id = ?1 AND leased_by = ?2",
                params![lock_id, node_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await?;
        debug!(lock_id, node = %self.node_id, "Released lease");
        Ok(())
    }

    /// Resolves once the lease has run out without a renewal
    async fn disconnected(&self) {
        loop {
            let deadline = *self.valid_until.lock();
            let Some(deadline) = deadline else {
                return;
            };
            tokio::time::sleep_until(deadline).await;
            if *self.valid_until.lock() == Some(deadline) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let dir = TempDir::new().unwrap();
        let config = SqliteConfig::new(dir.path().join("lease.db"));
        let store = SqliteEventStore::open(config.clone()).unwrap();

        let a = store.lease("node-a");
        let b = SqliteLease::open(&config, "node-b").unwrap();

        assert!(a.try_acquire(7).await.unwrap());
        assert!(a.try_acquire(7).await.unwrap());
        assert!(!b.try_acquire(7).await.unwrap());
        assert!(a.is_held(7).await.unwrap());
        assert!(!b.is_held(7).await.unwrap());

        a.release(7).await.unwrap();
        assert!(!a.is_held(7).await.unwrap());
        assert!(b.try_acquire(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let dir = TempDir::new().unwrap();
        let config = SqliteConfig::new(dir.path().join("lease.db")).with_lease_duration_ms(0);
        let store = SqliteEventStore::open(config.clone()).unwrap();

        let a = store.lease("node-a");
        let b = store.lease("node-b");
        assert!(a.try_acquire(1).await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!a.is_held(1).await.unwrap());
        assert!(b.try_acquire(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrenewed_lease_reports_disconnect() {
        let dir = TempDir::new().unwrap();
        let config = SqliteConfig::new(dir.path().join("lease.db")).with_lease_duration_ms(100);
        let store = SqliteEventStore::open(config).unwrap();
        let a = store.lease("node-a");

        // nothing held yet
        tokio::time::timeout(Duration::from_millis(50), a.disconnected())
            .await
            .unwrap();

        assert!(a.try_acquire(3).await.unwrap());
        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(2), a.disconnected())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        // a renewal pushes the deadline out
        assert!(a.try_acquire(3).await.unwrap());
        assert!(tokio::time::timeout(Duration::from_millis(20), a.disconnected())
            .await
            .is_err());
    }
}
