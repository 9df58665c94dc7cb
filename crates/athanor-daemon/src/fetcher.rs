use athanor_core::config::BackoffStrategy;
use athanor_core::error::{AthanorError, Result};
use athanor_core::traits::{EventStore, PageRequest};
use athanor_core::types::{EventFilter, EventRange, Sequence, ShardName};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::retry_transient;

/// Pulls filtered pages for one shard
///
/// Transient store errors are retried until the token fires. Every page is
/// checked for ordering and bounds before it is handed on.
pub struct EventFetcher {
    store: Arc<dyn EventStore>,
    shard: ShardName,
    filter: EventFilter,
    backoff: BackoffStrategy,
}

impl EventFetcher {
    pub fn new(store: Arc<dyn EventStore>, shard: ShardName, filter: EventFilter) -> Self {
        Self {
            store,
            shard,
            filter,
            backoff: BackoffStrategy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// Next page in `(floor, ceiling]` holding at most `batch_size` matching events
    pub async fn fetch(
        &self,
        floor: Sequence,
        ceiling: Sequence,
        batch_size: usize,
        token: &CancellationToken,
    ) -> Result<EventRange> {
        if ceiling < floor {
            return Err(AthanorError::InvalidState(format!(
                "{}: ceiling {} is below floor {}",
                self.shard, ceiling, floor
            )));
        }
        if ceiling == floor || batch_size == 0 {
            return Ok(EventRange::new(self.shard.clone(), floor, floor));
        }

        let request = PageRequest {
            shard: self.shard.clone(),
            filter: self.filter.clone(),
            floor,
            ceiling,
            batch_size,
        };

        let page = retry_transient("fetch_page", &self.backoff, token, || {
            self.store.fetch_page(&request, token)
        })
        .await?;

        if page.floor != floor || page.ceiling > ceiling || page.ceiling < floor {
            return Err(AthanorError::OrderingViolation {
                shard: self.shard.identity(),
                expected: floor,
                actual: page.floor,
            });
        }
        if let Some(sequence) = page.find_violation() {
            return Err(AthanorError::OrderingViolation {
                shard: self.shard.identity(),
                expected: page.floor,
                actual: sequence,
            });
        }

        debug!(shard = %self.shard, floor, ceiling = page.ceiling, events = page.len(), "Fetched page");
        Ok(page)
    }
}
