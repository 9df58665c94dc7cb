//! Per-shard progress registry with async waiters

use athanor_core::error::{AthanorError, Result};
use athanor_core::types::Sequence;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Thread-safe map of shard identity to the last committed sequence
///
/// Agents mark after every commit; tests and read-after-write callers wait
/// on it instead of polling the store.
#[derive(Default)]
pub struct SequenceTracker {
    marks: Mutex<HashMap<String, Sequence>>,
    changed: Notify,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a shard's position and wake every waiter
    ///
    /// Positions only move backwards through a rewind, which uses this same
    /// call.
    pub fn mark(&self, shard: &str, sequence: Sequence) {
        self.marks.lock().insert(shard.to_string(), sequence);
        self.changed.notify_waiters();
    }

    pub fn current(&self, shard: &str) -> Sequence {
        self.marks.lock().get(shard).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Sequence> {
        self.marks
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn remove(&self, shard: &str) {
        self.marks.lock().remove(shard);
        self.changed.notify_waiters();
    }

    /// Wait until `shard` has reached at least `sequence`
    pub async fn wait_for(
        &self,
        shard: &str,
        sequence: Sequence,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current(shard) >= sequence {
                return Ok(());
            }

            tokio::select! {
                _ = token.cancelled() => return Err(AthanorError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// [`Self::wait_for`] bounded by `timeout`
    pub async fn wait_for_timeout(
        &self,
        shard: &str,
        sequence: Sequence,
        timeout: Duration,
    ) -> Result<()> {
        let token = CancellationToken::new();
        match tokio::time::timeout(timeout, self.wait_for(shard, sequence, &token)).await {
            Ok(result) => result,
            Err(_) => Err(AthanorError::NonStaleTimeout {
                timeout,
                lagging: vec![format!(
                    "{} at {} (wanted {})",
                    shard,
                    self.current(shard),
                    sequence
                )],
            }),
        }
    }
}
