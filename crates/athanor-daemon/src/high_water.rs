//! High-water mark detection
//!
//! The detector computes the greatest sequence with no earlier gaps. A gap
//! left by an uncommitted writer holds the mark still; once it has held for
//! longer than the stale timeout it is treated as abandoned and skipped.
//!
//! The agent runs the detector on a timer and publishes each mark through a
//! `watch` channel that every shard queue reads as its ceiling.

use athanor_core::config::{BackoffStrategy, HighWaterConfig};
use athanor_core::error::{AthanorError, Result};
use athanor_core::observe;
use athanor_core::traits::EventStore;
use athanor_core::types::{HighWaterStatistics, HighWaterStatus, Sequence};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::sleep_or_cancel;

struct DetectorState {
    last_mark: Sequence,
    current_mark: Sequence,
    highest_sequence: Sequence,
    stale_since: Option<Instant>,
    skipped_gaps: u64,
    last_updated: chrono::DateTime<Utc>,
}

pub struct HighWaterDetector {
    store: Arc<dyn EventStore>,
    config: HighWaterConfig,
    state: Mutex<DetectorState>,
}

impl HighWaterDetector {
    pub fn new(store: Arc<dyn EventStore>, config: HighWaterConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(DetectorState {
                last_mark: 0,
                current_mark: 0,
                highest_sequence: 0,
                stale_since: None,
                skipped_gaps: 0,
                last_updated: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &HighWaterConfig {
        &self.config
    }

    pub fn current_mark(&self) -> Sequence {
        self.state.lock().current_mark
    }

    pub fn statistics(&self) -> HighWaterStatistics {
        let state = self.state.lock();
        HighWaterStatistics {
            last_mark: state.last_mark,
            current_mark: state.current_mark,
            highest_sequence: state.highest_sequence,
            skipped_gaps: state.skipped_gaps,
            last_updated: state.last_updated,
        }
    }

    /// One detection pass
    ///
    /// On error the recorded mark is left untouched, so the last known-good
    /// value keeps being reported.
    pub async fn detect_in_safe_zone(&self, token: &CancellationToken) -> Result<HighWaterStatus> {
        let from = self.current_mark();
        let probe = self.store.detect_high_water(from, token).await?;
        let mut mark = from.max(probe.contiguous_through);
        let mut highest = probe.highest_sequence;
        let mut is_stale = false;

        let stale_for = {
            let mut state = self.state.lock();
            if !probe.has_gap() {
                state.stale_since = None;
                None
            } else if mark > from {
                // gap now sits right above a fresh mark
                state.stale_since = Some(Instant::now());
                None
            } else {
                let since = *state.stale_since.get_or_insert_with(Instant::now);
                Some(since.elapsed())
            }
        };

        if let Some(elapsed) = stale_for {
            if elapsed >= self.config.stale_timeout() {
                let skipped = mark + 1;
                warn!(
                    sequence = skipped,
                    highest,
                    ?elapsed,
                    "Skipping stale gap in the event sequence"
                );
                let probe = self.store.detect_high_water(skipped, token).await?;
                mark = skipped.max(probe.contiguous_through);
                highest = probe.highest_sequence;
                is_stale = true;
                observe::record_high_water(mark, true);
            }
        }

        let mut state = self.state.lock();
        if is_stale {
            state.skipped_gaps += 1;
            state.stale_since = None;
        }
        if mark != state.current_mark {
            state.last_mark = state.current_mark;
            state.current_mark = mark;
            state.last_updated = Utc::now();
            observe::record_high_water(mark, false);
        }
        state.highest_sequence = highest;

        Ok(HighWaterStatus {
            current_mark: mark,
            highest_sequence: highest,
            is_stale,
        })
    }
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Background loop driving a [`HighWaterDetector`]
pub struct HighWaterAgent {
    detector: Arc<HighWaterDetector>,
    backoff: BackoffStrategy,
    sender: Arc<watch::Sender<Sequence>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl HighWaterAgent {
    pub fn new(detector: Arc<HighWaterDetector>, backoff: BackoffStrategy) -> Self {
        let (sender, _) = watch::channel(detector.current_mark());
        Self {
            detector,
            backoff,
            sender: Arc::new(sender),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn detector(&self) -> &Arc<HighWaterDetector> {
        &self.detector
    }

    /// Receiver of published marks
    pub fn subscribe(&self) -> watch::Receiver<Sequence> {
        self.sender.subscribe()
    }

    pub fn current_mark(&self) -> Sequence {
        *self.sender.borrow()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a detection pass now and publish the result
    pub async fn check_now(&self, token: &CancellationToken) -> Result<HighWaterStatus> {
        let status = self.detector.detect_in_safe_zone(token).await?;
        publish(&self.sender, status.current_mark);
        Ok(status)
    }

    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(detect_loop(
            self.detector.clone(),
            self.sender.clone(),
            self.backoff.clone(),
            token.clone(),
        ));
        info!("High-water agent started");
        *running = Some(Running { token, task });
    }

    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(Running { token, task }) = running {
            token.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "High-water task ended abnormally");
            }
            info!("High-water agent stopped");
        }
    }
}

fn publish(sender: &watch::Sender<Sequence>, mark: Sequence) {
    sender.send_if_modified(|current| {
        if mark > *current {
            *current = mark;
            true
        } else {
            false
        }
    });
}

async fn detect_loop(
    detector: Arc<HighWaterDetector>,
    sender: Arc<watch::Sender<Sequence>>,
    backoff: BackoffStrategy,
    token: CancellationToken,
) {
    let mut failures = 0usize;
    loop {
        let delay = match detector.detect_in_safe_zone(&token).await {
            Ok(status) => {
                failures = 0;
                publish(&sender, status.current_mark);
                debug!(
                    mark = status.current_mark,
                    highest = status.highest_sequence,
                    "High-water pass"
                );
                if status.caught_up() {
                    detector.config().polling_interval()
                } else {
                    detector.config().fast_polling()
                }
            }
            Err(AthanorError::Cancelled) => return,
            Err(e) => {
                let delay = backoff.calculate(failures);
                failures = failures.saturating_add(1);
                warn!(error = %e, ?delay, "High-water detection failed, keeping last mark");
                delay
            }
        };

        if sleep_or_cancel(delay, &token).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::memory::InMemoryEventStore;
    use athanor_core::types::NewEvent;
    use std::time::Duration;

    fn config(stale_ms: u64) -> HighWaterConfig {
        HighWaterConfig::default()
            .with_polling_interval_ms(10)
            .with_fast_polling_ms(5)
            .with_stale_timeout_ms(stale_ms)
    }

    fn append(store: &InMemoryEventStore, n: usize) {
        store
            .append("s", (0..n).map(|_| NewEvent::of_type("A")).collect())
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_follows_contiguous_events() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, 5);
        let detector = HighWaterDetector::new(store.clone(), config(1000));
        let token = CancellationToken::new();

        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert_eq!(status.current_mark, 5);
        assert!(status.caught_up());

        append(&store, 2);
        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert_eq!(status.current_mark, 7);
        assert_eq!(detector.statistics().last_mark, 5);
    }

    #[tokio::test]
    async fn test_gap_holds_mark_until_committed() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, 3);
        let reserved = store.reserve_sequence();
        append(&store, 2);

        let detector = HighWaterDetector::new(store.clone(), config(60_000));
        let token = CancellationToken::new();

        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert_eq!(status.current_mark, 3);
        assert_eq!(status.highest_sequence, 6);
        assert!(!status.is_stale);

        store
            .commit_reserved(reserved, "late", NewEvent::of_type("B"))
            .unwrap();
        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert_eq!(status.current_mark, 6);
    }

    #[tokio::test]
    async fn test_stale_gap_is_skipped() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, 3);
        store.reserve_sequence();
        append(&store, 2);

        let detector = HighWaterDetector::new(store.clone(), config(20));
        let token = CancellationToken::new();

        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert_eq!(status.current_mark, 3);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = detector.detect_in_safe_zone(&token).await.unwrap();
        assert!(status.is_stale);
        assert_eq!(status.current_mark, 6);
        assert_eq!(detector.statistics().skipped_gaps, 1);
    }

    #[tokio::test]
    async fn test_error_keeps_last_mark() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, 4);
        let detector = HighWaterDetector::new(store.clone(), config(1000));
        let token = CancellationToken::new();
        detector.detect_in_safe_zone(&token).await.unwrap();

        append(&store, 4);
        store.fail_next_detects(1);
        assert!(detector.detect_in_safe_zone(&token).await.is_err());
        assert_eq!(detector.current_mark(), 4);
    }

    #[tokio::test]
    async fn test_agent_publishes_marks() {
        let store = Arc::new(InMemoryEventStore::new());
        let detector = Arc::new(HighWaterDetector::new(store.clone(), config(1000)));
        let agent = HighWaterAgent::new(detector, BackoffStrategy::Fixed { delay_ms: 1 });
        let mut marks = agent.subscribe();

        agent.start().await;
        append(&store, 3);

        tokio::time::timeout(Duration::from_secs(2), async {
            while *marks.borrow_and_update() < 3 {
                marks.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        agent.stop().await;
        assert!(!agent.is_running().await);
        assert_eq!(agent.current_mark(), 3);
    }
}
