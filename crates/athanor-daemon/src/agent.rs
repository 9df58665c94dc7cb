//! Per-shard state machine
//!
//! `Stopped -> Starting -> Running -> (Paused | Stopping) -> Stopped`, plus
//! `Running -> Errored -> Stopped` for faults that need an operator.
//!
//! Each page goes through the subscription, then its writes, dead letters
//! and the progress move are committed in one store transaction. A page is
//! either fully committed or leaves no trace.

use athanor_core::config::{
    BackoffStrategy, DaemonConfig, RewindBehavior, StartPosition, SubscriptionOptions,
};
use athanor_core::error::{AthanorError, Result};
use athanor_core::observe;
use athanor_core::traits::{EventStore, ProjectionSession, ShardController, SubscriptionSource};
use athanor_core::types::{
    CommitInfo, CommitOutcome, EventRange, Sequence, ShardCommit, ShardExecutionState, ShardName,
    ShardStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fetcher::EventFetcher;
use crate::queue::{QueueOptions, ShardExecutionQueue};
use crate::retry::sleep_or_cancel;
use crate::tracker::SequenceTracker;

/// Where a rewind moves a shard to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindTarget {
    Sequence(Sequence),
    /// The last event appended before this instant
    Time(DateTime<Utc>),
}

impl Default for RewindTarget {
    fn default() -> Self {
        RewindTarget::Sequence(0)
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Attempts after the first before a failing page halts the shard
    pub max_commit_retries: usize,
    pub retry_backoff: BackoffStrategy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

impl AgentSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_commit_retries: config.max_commit_retries,
            retry_backoff: config.retry_backoff.clone(),
        }
    }
}

#[derive(Default)]
struct Counters {
    error: Option<String>,
    events_processed: u64,
    dead_letters: u64,
    peak_buffered: usize,
}

enum PageApplied {
    Committed { dead_letters: usize },
    Skipped { actual: Sequence },
}

struct AgentCore {
    shard: ShardName,
    identity: String,
    options: SubscriptionOptions,
    database: String,
    store: Arc<dyn EventStore>,
    source: SubscriptionSource,
    tracker: Arc<SequenceTracker>,
    fetcher: Arc<EventFetcher>,
    ceiling: watch::Receiver<Sequence>,
    lease: watch::Receiver<bool>,
    settings: AgentSettings,
    state: watch::Sender<ShardExecutionState>,
    paused: watch::Sender<bool>,
    counters: Mutex<Counters>,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ShardAgent {
    core: Arc<AgentCore>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl ShardAgent {
    pub fn new(
        options: SubscriptionOptions,
        source: SubscriptionSource,
        store: Arc<dyn EventStore>,
        tracker: Arc<SequenceTracker>,
        ceiling: watch::Receiver<Sequence>,
        lease: watch::Receiver<bool>,
        database: impl Into<String>,
        settings: AgentSettings,
    ) -> Self {
        let shard = options.shard_name();
        let fetcher = EventFetcher::new(store.clone(), shard.clone(), options.filter())
            .with_backoff(settings.retry_backoff.clone());
        let (state, _) = watch::channel(ShardExecutionState::Stopped);
        let (paused, _) = watch::channel(false);

        Self {
            core: Arc::new(AgentCore {
                identity: shard.identity(),
                shard,
                options,
                database: database.into(),
                store,
                source,
                tracker,
                fetcher: Arc::new(fetcher),
                ceiling,
                lease,
                settings,
                state,
                paused,
                counters: Mutex::new(Counters::default()),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn shard(&self) -> &ShardName {
        &self.core.shard
    }

    /// Persisted identity, e.g. `Trips:All`
    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.core.options
    }

    pub fn state(&self) -> ShardExecutionState {
        *self.core.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ShardExecutionState> {
        self.core.state.subscribe()
    }

    /// Last committed sequence seen by this process
    pub fn position(&self) -> Sequence {
        self.core.tracker.current(&self.core.identity)
    }

    pub fn peak_buffered(&self) -> usize {
        self.core.counters.lock().peak_buffered
    }

    pub fn status(&self) -> ShardStatus {
        let counters = self.core.counters.lock();
        ShardStatus {
            name: self.core.identity.clone(),
            state: self.state(),
            position: self.position(),
            error: counters.error.clone(),
            events_processed: counters.events_processed,
            dead_letters: counters.dead_letters,
        }
    }

    /// Load progress and begin processing; no-op while already running
    pub async fn start(&self) -> Result<()> {
        let mut running = self.lifecycle.lock().await;
        self.start_locked(&mut running).await
    }

    /// Cooperative stop: the page in flight commits completely or not at all
    ///
    /// An errored shard stays `Errored`; only `start` or `rewind` clear it.
    pub async fn stop(&self) {
        let mut running = self.lifecycle.lock().await;
        self.stop_locked(&mut running).await;
    }

    /// Hold page processing without releasing the shard
    pub fn pause(&self) -> Result<()> {
        let core = &self.core;
        if self.state() != ShardExecutionState::Running {
            return Err(AthanorError::InvalidState(format!(
                "{} cannot pause while {}",
                core.identity,
                self.state()
            )));
        }
        core.paused.send_replace(true);
        core.transition(ShardExecutionState::Paused);
        info!(shard = %core.identity, "Shard paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let core = &self.core;
        if self.state() != ShardExecutionState::Paused {
            return Err(AthanorError::InvalidState(format!(
                "{} cannot resume while {}",
                core.identity,
                self.state()
            )));
        }
        core.transition(ShardExecutionState::Running);
        core.paused.send_replace(false);
        info!(shard = %core.identity, "Shard resumed");
        Ok(())
    }

    /// Reset progress to `target` and replay from there
    ///
    /// The target may not lie past the shard's stored progress. Safe while
    /// running: the shard is stopped first. A shard that was not
    /// stopped (including an errored one) is restarted afterwards.
    pub async fn rewind(&self, target: RewindTarget) -> Result<()> {
        let core = &self.core;
        let floor = match target {
            RewindTarget::Sequence(sequence) => sequence,
            RewindTarget::Time(timestamp) => core.store.sequence_before(timestamp).await?,
        };

        let teardown = match &core.options.rewind_behavior {
            RewindBehavior::ResetProgress => Vec::new(),
            RewindBehavior::Teardown { collections } => {
                if floor != 0 {
                    return Err(AthanorError::InvalidState(format!(
                        "{} tears down its read model and can only rewind to 0, not {}",
                        core.identity, floor
                    )));
                }
                collections.clone()
            }
        };

        // progress only moves forward while running, so checking before the stop holds
        let current = core
            .store
            .load_progress(&core.identity)
            .await?
            .map(|progress| progress.sequence)
            .unwrap_or(0);
        if floor > current {
            return Err(AthanorError::InvalidState(format!(
                "{} is at {}; a rewind cannot move it forward to {}",
                core.identity, current, floor
            )));
        }

        let mut running = self.lifecycle.lock().await;
        let previous = self.state();
        self.stop_locked(&mut running).await;

        core.store
            .reset_progress(&core.identity, &core.database, floor, &teardown)
            .await?;
        core.tracker.mark(&core.identity, floor);
        core.counters.lock().error = None;
        info!(shard = %core.identity, floor, teardown = teardown.len(), "Shard rewound");

        if previous != ShardExecutionState::Stopped {
            self.start_locked(&mut running).await?;
        }
        Ok(())
    }

    async fn start_locked(&self, running: &mut Option<Running>) -> Result<()> {
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = running.take() {
            let _ = finished.task.await;
        }

        let core = &self.core;
        core.transition(ShardExecutionState::Starting);
        core.paused.send_replace(false);
        core.counters.lock().error = None;

        let token = CancellationToken::new();
        let floor = match core.initial_floor(&token).await {
            Ok(floor) => floor,
            Err(e) => {
                warn!(shard = %core.identity, error = %e, "Shard failed to start");
                core.counters.lock().error = Some(e.to_string());
                core.transition(ShardExecutionState::Stopped);
                return Err(e);
            }
        };

        core.tracker.mark(&core.identity, floor);
        core.transition(ShardExecutionState::Running);
        let task = tokio::spawn(run_shard(core.clone(), floor, token.clone()));
        *running = Some(Running { token, task });

        info!(shard = %core.identity, floor, "Shard started");
        Ok(())
    }

    async fn stop_locked(&self, running: &mut Option<Running>) {
        let core = &self.core;
        let Some(Running { token, task }) = running.take() else {
            if !matches!(
                self.state(),
                ShardExecutionState::Stopped | ShardExecutionState::Errored
            ) {
                core.transition(ShardExecutionState::Stopped);
            }
            return;
        };

        let errored = self.state() == ShardExecutionState::Errored;
        if !errored {
            core.transition(ShardExecutionState::Stopping);
        }
        token.cancel();
        if let Err(e) = task.await {
            warn!(shard = %core.identity, error = %e, "Shard task ended abnormally");
        }
        // the task may have halted while stopping
        if self.state() != ShardExecutionState::Errored {
            core.transition(ShardExecutionState::Stopped);
        }
        info!(shard = %core.identity, position = self.position(), errored, "Shard stopped");
    }
}

impl AgentCore {
    fn transition(&self, state: ShardExecutionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(shard = %self.identity, from = %previous, to = %state, "Shard state changed");
            observe::record_shard_state(&self.identity, state);
        }
    }

    fn fail(&self, e: &AthanorError) {
        error!(shard = %self.identity, error = %e, "Shard halted");
        self.counters.lock().error = Some(e.to_string());
        self.transition(ShardExecutionState::Errored);
    }

    /// Persisted progress, or the configured start position on first run
    async fn initial_floor(&self, token: &CancellationToken) -> Result<Sequence> {
        if let Some(progress) = self.store.load_progress(&self.identity).await? {
            return Ok(progress.sequence);
        }

        let floor = match self.options.start_position {
            StartPosition::FromBeginning => 0,
            StartPosition::FromSequence(sequence) => sequence,
            StartPosition::FromTime(timestamp) => self.store.sequence_before(timestamp).await?,
            StartPosition::FromPresent => {
                self.store
                    .detect_high_water(0, token)
                    .await?
                    .highest_sequence
            }
        };

        // first commit expects this row
        self.store
            .reset_progress(&self.identity, &self.database, floor, &[])
            .await?;
        Ok(floor)
    }

    async fn apply_with_retries(
        &self,
        page: &EventRange,
        token: &CancellationToken,
    ) -> Result<PageApplied> {
        let mut attempt = 0usize;
        loop {
            match self.apply_page(page, token).await {
                Ok(applied) => return Ok(applied),
                Err(e) if is_retryable(&e) && attempt < self.settings.max_commit_retries => {
                    let delay = self.settings.retry_backoff.calculate(attempt);
                    attempt += 1;
                    warn!(
                        shard = %self.identity,
                        floor = page.floor,
                        ceiling = page.ceiling,
                        attempt,
                        error = %e,
                        ?delay,
                        "Page failed, retrying"
                    );
                    sleep_or_cancel(delay, token).await?;
                }
                Err(e) => {
                    if is_retryable(&e) {
                        error!(shard = %self.identity, attempts = attempt + 1, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn apply_page(&self, page: &EventRange, token: &CancellationToken) -> Result<PageApplied> {
        let controller = ShardController::new(self.shard.clone());
        let mut session = ProjectionSession::new();
        let listener = self
            .source
            .process_events(page, &controller, &mut session, token)
            .await?;

        let (critical, dead_letters) = controller.take();
        if let Some(failure) = critical {
            return Err(failure.into_error(&self.shard));
        }

        let dead_lettered: Vec<(Sequence, String)> = dead_letters
            .iter()
            .map(|d| (d.event_sequence, d.exception_message.clone()))
            .collect();
        let commit = ShardCommit {
            shard_name: self.identity.clone(),
            database: self.database.clone(),
            expected_sequence: page.floor,
            new_sequence: page.ceiling,
            writes: session.into_writes(),
            dead_letters,
        };
        listener.before_commit(&commit).await?;

        if !*self.lease.borrow() {
            return Err(AthanorError::OwnershipLost(self.identity.clone()));
        }
        let started = Instant::now();
        let outcome = self.store.commit_progress_and_writes(commit, token).await;
        observe::record_commit(started.elapsed(), outcome.is_ok());

        match outcome? {
            CommitOutcome::Committed { writes_applied } => {
                for (sequence, message) in &dead_lettered {
                    warn!(shard = %self.identity, sequence, message = %message, "Event dead-lettered");
                    observe::record_dead_letter(&self.identity);
                }
                let info = CommitInfo {
                    shard_name: self.identity.clone(),
                    floor: page.floor,
                    ceiling: page.ceiling,
                    events_applied: page.len(),
                    writes_applied,
                    dead_letters: dead_lettered.len(),
                };
                if let Err(e) = listener.after_commit(&info).await {
                    warn!(shard = %self.identity, error = %e, "after_commit hook failed");
                }
                Ok(PageApplied::Committed {
                    dead_letters: dead_lettered.len(),
                })
            }
            CommitOutcome::Conflict { actual } if actual >= page.ceiling => {
                warn!(
                    shard = %self.identity,
                    ceiling = page.ceiling,
                    actual,
                    "Progress already past page, skipping"
                );
                Ok(PageApplied::Skipped { actual })
            }
            CommitOutcome::Conflict { actual } if actual < page.floor => {
                Err(AthanorError::ProgressConflict {
                    shard: self.identity.clone(),
                    expected: page.floor,
                    actual,
                })
            }
            CommitOutcome::Conflict { actual } => Err(AthanorError::OrderingViolation {
                shard: self.identity.clone(),
                expected: page.floor,
                actual,
            }),
        }
    }

    fn record_applied(&self, page: &EventRange, applied: &PageApplied, peak_buffered: usize) {
        let mut counters = self.counters.lock();
        counters.peak_buffered = counters.peak_buffered.max(peak_buffered);
        if let PageApplied::Committed { dead_letters } = applied {
            counters.events_processed += page.len() as u64;
            counters.dead_letters += *dead_letters as u64;
            observe::record_page_applied(&self.identity, page.len() as u64);
        }
    }
}

fn is_retryable(e: &AthanorError) -> bool {
    !matches!(
        e,
        AthanorError::CriticalFailure { .. }
            | AthanorError::Cancelled
            | AthanorError::OrderingViolation { .. }
            | AthanorError::ProgressConflict { .. }
            | AthanorError::OwnershipLost(_)
    )
}

async fn wait_while_paused(
    paused: &mut watch::Receiver<bool>,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        if !*paused.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => return Err(AthanorError::Cancelled),
            changed = paused.changed() => {
                if changed.is_err() {
                    return Err(AthanorError::Cancelled);
                }
            }
        }
    }
}

async fn run_shard(core: Arc<AgentCore>, floor: Sequence, token: CancellationToken) {
    let options = QueueOptions {
        batch_size: core.options.batch_size,
        maximum_hopper_size: core.options.maximum_hopper_size,
    };
    let mut queue = ShardExecutionQueue::start(
        core.fetcher.clone(),
        options,
        floor,
        core.ceiling.clone(),
        token.child_token(),
    );
    let mut paused = core.paused.subscribe();

    let failure = loop {
        let next = tokio::select! {
            _ = token.cancelled() => break None,
            next = queue.next_page() => next,
        };
        let page = match next {
            None => break None,
            Some(Err(e)) => break Some(e),
            Some(Ok(page)) => page,
        };

        // a page fetched before a pause waits for resume
        if wait_while_paused(&mut paused, &token).await.is_err() {
            break None;
        }

        match core.apply_with_retries(&page, &token).await {
            Ok(applied) => {
                queue.release(page.len());
                core.record_applied(&page, &applied, queue.peak_buffered());
                let position = match applied {
                    PageApplied::Committed { .. } => page.ceiling,
                    PageApplied::Skipped { actual } => actual.min(page.ceiling),
                };
                core.tracker.mark(&core.identity, position);
                debug!(shard = %core.identity, position, events = page.len(), "Page applied");
            }
            Err(AthanorError::Cancelled) => break None,
            Err(AthanorError::OwnershipLost(_)) => {
                warn!(shard = %core.identity, floor = page.floor, "Ownership lost, page abandoned");
                core.transition(ShardExecutionState::Stopping);
                break None;
            }
            Err(e) => break Some(e),
        }
    };

    queue.stop().await;
    if let Some(e) = failure {
        core.fail(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::memory::InMemoryEventStore;
    use athanor_core::traits::{ChangeListener, NullChangeListener, Subscription};
    use athanor_core::types::NewEvent;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Sequence>>,
        critical_on: Option<Sequence>,
        dead_letter_on: Option<Sequence>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Sequence> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Subscription for Recorder {
        async fn process_events(
            &self,
            page: &EventRange,
            controller: &ShardController,
            session: &mut ProjectionSession,
            _token: &CancellationToken,
        ) -> Result<Box<dyn ChangeListener>> {
            for event in &page.events {
                if Some(event.sequence) == self.critical_on {
                    controller.report_critical_failure("corrupt", event.sequence - 1);
                    return Ok(NullChangeListener::boxed());
                }
                if Some(event.sequence) == self.dead_letter_on {
                    let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad payload");
                    controller.record_dead_letter_event(event, &err);
                    continue;
                }
                self.seen.lock().push(event.sequence);
                session.upsert(
                    "seen",
                    event.sequence.to_string(),
                    &serde_json::json!({ "type": event.event_type }),
                )?;
            }
            Ok(NullChangeListener::boxed())
        }
    }

    /// Writes its page, then takes a while before handing it back
    struct Slow {
        entered: tokio::sync::Notify,
    }

    #[async_trait]
    impl Subscription for Slow {
        async fn process_events(
            &self,
            page: &EventRange,
            _controller: &ShardController,
            session: &mut ProjectionSession,
            _token: &CancellationToken,
        ) -> Result<Box<dyn ChangeListener>> {
            for event in &page.events {
                session.upsert("seen", event.sequence.to_string(), &event.event_type)?;
            }
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(NullChangeListener::boxed())
        }
    }

    struct Harness {
        store: Arc<InMemoryEventStore>,
        tracker: Arc<SequenceTracker>,
        ceiling: watch::Sender<Sequence>,
        lease: watch::Sender<bool>,
    }

    impl Harness {
        fn new(events: usize) -> Self {
            let store = Arc::new(InMemoryEventStore::new());
            if events > 0 {
                store
                    .append("s", (0..events).map(|_| NewEvent::of_type("A")).collect())
                    .unwrap();
            }
            let (ceiling, _) = watch::channel(store.highest_sequence());
            let (lease, _) = watch::channel(true);
            Self {
                store,
                tracker: Arc::new(SequenceTracker::new()),
                ceiling,
                lease,
            }
        }

        fn agent(&self, options: SubscriptionOptions, recorder: Arc<Recorder>) -> ShardAgent {
            self.agent_with(options, SubscriptionSource::Instance(recorder))
        }

        fn agent_with(&self, options: SubscriptionOptions, source: SubscriptionSource) -> ShardAgent {
            ShardAgent::new(
                options,
                source,
                self.store.clone(),
                self.tracker.clone(),
                self.ceiling.subscribe(),
                self.lease.subscribe(),
                "Default",
                AgentSettings {
                    max_commit_retries: 2,
                    retry_backoff: BackoffStrategy::Fixed { delay_ms: 1 },
                },
            )
        }

        async fn wait(&self, shard: &str, sequence: Sequence) {
            self.tracker
                .wait_for_timeout(shard, sequence, Duration::from_secs(2))
                .await
                .unwrap();
        }
    }

    async fn wait_for_state(agent: &ShardAgent, state: ShardExecutionState) {
        let mut states = agent.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != state {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions::new("Fake").with_batch_size(3)
    }

    #[tokio::test]
    async fn test_processes_all_events_and_commits_progress() {
        let harness = Harness::new(10);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        assert_eq!(agent.state(), ShardExecutionState::Running);
        harness.wait("Fake:All", 10).await;

        assert_eq!(recorder.seen(), (1..=10).collect::<Vec<_>>());
        let progress = harness.store.load_progress("Fake:All").await.unwrap().unwrap();
        assert_eq!(progress.sequence, 10);
        assert_eq!(harness.store.documents("seen").len(), 10);

        agent.stop().await;
        assert_eq!(agent.state(), ShardExecutionState::Stopped);
        assert_eq!(agent.status().events_processed, 10);
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_progress() {
        let harness = Harness::new(6);
        harness.store.force_progress("Fake:All", 4);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        harness.wait("Fake:All", 6).await;
        agent.stop().await;

        assert_eq!(recorder.seen(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_start_position_from_sequence() {
        let harness = Harness::new(8);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(
            options().with_start_position(StartPosition::FromSequence(5)),
            recorder.clone(),
        );

        agent.start().await.unwrap();
        harness.wait("Fake:All", 8).await;
        agent.stop().await;

        assert_eq!(recorder.seen(), vec![6, 7, 8]);
    }

    #[tokio::test]
    async fn test_critical_failure_halts_and_rolls_back() {
        let harness = Harness::new(9);
        let recorder = Arc::new(Recorder {
            critical_on: Some(5),
            ..Default::default()
        });
        let agent = harness.agent(options(), recorder);

        agent.start().await.unwrap();
        wait_for_state(&agent, ShardExecutionState::Errored).await;

        let progress = harness.store.load_progress("Fake:All").await.unwrap().unwrap();
        assert_eq!(progress.sequence, 3);
        assert!(harness.store.document("seen", "4").is_none());
        assert!(agent.status().error.unwrap().contains("corrupt"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.state(), ShardExecutionState::Errored);
        assert_eq!(harness.store.load_progress("Fake:All").await.unwrap().unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_lets_shard_continue() {
        let harness = Harness::new(6);
        let recorder = Arc::new(Recorder {
            dead_letter_on: Some(2),
            ..Default::default()
        });
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        harness.wait("Fake:All", 6).await;
        agent.stop().await;

        assert_eq!(recorder.seen(), vec![1, 3, 4, 5, 6]);
        let records = harness.store.dead_letters(Some("Fake:All"), 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_sequence, 2);
        assert_eq!(agent.status().dead_letters, 1);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        let harness = Harness::new(3);
        harness.store.fail_next_commits(2);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        harness.wait("Fake:All", 3).await;
        agent.stop().await;

        assert_eq!(harness.store.documents("seen").len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_error_the_shard() {
        let harness = Harness::new(3);
        harness.store.fail_next_commits(10);
        let agent = harness.agent(options(), Arc::new(Recorder::default()));

        agent.start().await.unwrap();
        wait_for_state(&agent, ShardExecutionState::Errored).await;
        assert_eq!(harness.store.commit_calls(), 3);
        let progress = harness.store.load_progress("Fake:All").await.unwrap().unwrap();
        assert_eq!(progress.sequence, 0);
    }

    #[tokio::test]
    async fn test_pause_holds_processing_until_resume() {
        let harness = Harness::new(3);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        harness.wait("Fake:All", 3).await;
        agent.pause().unwrap();
        assert_eq!(agent.state(), ShardExecutionState::Paused);

        harness
            .store
            .append("s", vec![NewEvent::of_type("A"), NewEvent::of_type("A")])
            .unwrap();
        harness.ceiling.send_replace(5);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agent.position(), 3);

        agent.resume().unwrap();
        harness.wait("Fake:All", 5).await;
        agent.stop().await;
        assert_eq!(recorder.seen().len(), 5);
    }

    #[tokio::test]
    async fn test_rewind_replays_from_floor() {
        let harness = Harness::new(6);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        agent.start().await.unwrap();
        harness.wait("Fake:All", 6).await;

        agent.rewind(RewindTarget::Sequence(2)).await.unwrap();
        assert_eq!(agent.state(), ShardExecutionState::Running);
        harness.wait("Fake:All", 6).await;
        agent.stop().await;

        let seen = recorder.seen();
        assert_eq!(seen.len(), 10);
        assert_eq!(&seen[6..], &[3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_rewind_clears_errored_state() {
        let harness = Harness::new(4);
        harness.store.fail_next_commits(10);
        let agent = harness.agent(options(), Arc::new(Recorder::default()));

        agent.start().await.unwrap();
        wait_for_state(&agent, ShardExecutionState::Errored).await;

        harness.store.fail_next_commits(0);
        agent.rewind(RewindTarget::default()).await.unwrap();
        harness.wait("Fake:All", 4).await;
        assert!(agent.status().error.is_none());
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_teardown_rewind_only_to_zero() {
        let harness = Harness::new(4);
        let agent = harness.agent(
            options().with_rewind_behavior(RewindBehavior::Teardown {
                collections: vec!["seen".to_string()],
            }),
            Arc::new(Recorder::default()),
        );

        agent.start().await.unwrap();
        harness.wait("Fake:All", 4).await;

        let err = agent.rewind(RewindTarget::Sequence(2)).await.unwrap_err();
        assert!(matches!(err, AthanorError::InvalidState(_)));

        agent.stop().await;
        agent.rewind(RewindTarget::Sequence(0)).await.unwrap();
        assert!(harness.store.documents("seen").is_empty());
        assert_eq!(agent.state(), ShardExecutionState::Stopped);
    }

    #[tokio::test]
    async fn test_conflict_with_advanced_progress_skips_page() {
        let harness = Harness::new(6);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(options(), recorder.clone());

        harness.ceiling.send_replace(0);
        agent.start().await.unwrap();
        harness.store.force_progress("Fake:All", 3);
        harness.ceiling.send_replace(3);
        harness.wait("Fake:All", 3).await;
        harness.ceiling.send_replace(6);
        harness.wait("Fake:All", 6).await;
        agent.stop().await;

        let documents = harness.store.documents("seen");
        assert_eq!(documents.keys().collect::<Vec<_>>(), vec!["4", "5", "6"]);
        assert_eq!(recorder.seen().len(), 6);
        assert_eq!(agent.state(), ShardExecutionState::Stopped);
    }

    async fn stored_progress(harness: &Harness) -> Sequence {
        harness
            .store
            .load_progress("Fake:All")
            .await
            .unwrap()
            .map(|p| p.sequence)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_stop_keeps_errored_state() {
        let harness = Harness::new(9);
        let recorder = Arc::new(Recorder {
            critical_on: Some(5),
            ..Default::default()
        });
        let agent = harness.agent(options(), recorder);

        agent.start().await.unwrap();
        wait_for_state(&agent, ShardExecutionState::Errored).await;

        agent.stop().await;
        assert_eq!(agent.state(), ShardExecutionState::Errored);
        assert!(agent.status().error.unwrap().contains("corrupt"));
        assert_eq!(stored_progress(&harness).await, 3);
    }

    #[tokio::test]
    async fn test_progress_behind_floor_halts_with_conflict() {
        let harness = Harness::new(6);
        harness.ceiling.send_replace(3);
        let agent = harness.agent(
            options().with_start_position(StartPosition::FromSequence(3)),
            Arc::new(Recorder::default()),
        );

        agent.start().await.unwrap();
        harness.store.force_progress("Fake:All", 1);
        harness.ceiling.send_replace(6);
        wait_for_state(&agent, ShardExecutionState::Errored).await;

        assert!(agent.status().error.unwrap().contains("Progress conflict"));
        assert_eq!(harness.store.commit_calls(), 1);
        assert_eq!(stored_progress(&harness).await, 1);
        assert!(harness.store.documents("seen").is_empty());
    }

    #[tokio::test]
    async fn test_progress_inside_page_halts_with_ordering_violation() {
        let harness = Harness::new(6);
        harness.ceiling.send_replace(0);
        let agent = harness.agent(options(), Arc::new(Recorder::default()));

        agent.start().await.unwrap();
        harness.store.force_progress("Fake:All", 2);
        harness.ceiling.send_replace(6);
        wait_for_state(&agent, ShardExecutionState::Errored).await;

        assert!(agent.status().error.unwrap().contains("Ordering violation"));
        assert_eq!(harness.store.commit_calls(), 1);
        assert_eq!(stored_progress(&harness).await, 2);
        assert!(harness.store.documents("seen").is_empty());
    }

    #[tokio::test]
    async fn test_start_position_from_present() {
        let harness = Harness::new(5);
        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(
            options().with_start_position(StartPosition::FromPresent),
            recorder.clone(),
        );

        agent.start().await.unwrap();
        assert_eq!(stored_progress(&harness).await, 5);

        harness
            .store
            .append("s", vec![NewEvent::of_type("A"), NewEvent::of_type("A")])
            .unwrap();
        harness.ceiling.send_replace(7);
        harness.wait("Fake:All", 7).await;
        agent.stop().await;

        assert_eq!(recorder.seen(), vec![6, 7]);
    }

    #[tokio::test]
    async fn test_start_position_from_time() {
        let harness = Harness::new(0);
        let early = Utc::now() - chrono::Duration::hours(2);
        let late = Utc::now() - chrono::Duration::hours(1);
        harness
            .store
            .append_typed("s", None, (0..3).map(|_| NewEvent::of_type("A")).collect(), early)
            .unwrap();
        harness
            .store
            .append_typed("s", None, (0..2).map(|_| NewEvent::of_type("B")).collect(), late)
            .unwrap();
        harness.ceiling.send_replace(5);

        let recorder = Arc::new(Recorder::default());
        let agent = harness.agent(
            options().with_start_position(StartPosition::FromTime(
                early + chrono::Duration::minutes(30),
            )),
            recorder.clone(),
        );

        agent.start().await.unwrap();
        harness.wait("Fake:All", 5).await;
        agent.stop().await;

        assert_eq!(recorder.seen(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_stop_during_slow_page_persists_nothing() {
        let harness = Harness::new(3);
        let slow = Arc::new(Slow {
            entered: tokio::sync::Notify::new(),
        });
        let agent = harness.agent_with(options(), SubscriptionSource::Instance(slow.clone()));

        agent.start().await.unwrap();
        slow.entered.notified().await;
        agent.stop().await;

        assert_eq!(agent.state(), ShardExecutionState::Stopped);
        assert_eq!(harness.store.commit_calls(), 0);
        assert_eq!(stored_progress(&harness).await, 0);
        assert!(harness.store.documents("seen").is_empty());
    }

    #[tokio::test]
    async fn test_commit_refused_without_lease() {
        let harness = Harness::new(3);
        harness.lease.send_replace(false);
        let agent = harness.agent(options(), Arc::new(Recorder::default()));

        agent.start().await.unwrap();
        wait_for_state(&agent, ShardExecutionState::Stopping).await;

        assert_eq!(harness.store.commit_calls(), 0);
        assert_eq!(stored_progress(&harness).await, 0);
        assert!(harness.store.documents("seen").is_empty());
        assert!(agent.status().error.is_none());

        agent.stop().await;
        assert_eq!(agent.state(), ShardExecutionState::Stopped);
    }

    #[tokio::test]
    async fn test_rewind_cannot_move_forward() {
        let harness = Harness::new(6);
        let agent = harness.agent(options(), Arc::new(Recorder::default()));

        agent.start().await.unwrap();
        harness.wait("Fake:All", 6).await;

        let err = agent.rewind(RewindTarget::Sequence(9)).await.unwrap_err();
        assert!(matches!(err, AthanorError::InvalidState(_)));
        assert_eq!(agent.state(), ShardExecutionState::Running);
        assert_eq!(stored_progress(&harness).await, 6);
        agent.stop().await;
    }
}
