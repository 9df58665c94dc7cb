//! Coordinator for every shard agent of one database
//!
//! The daemon owns the high-water agent, the shared sequence tracker and
//! one [`ShardAgent`] per registered subscription. Each agent is its own
//! failure domain: an errored or unstartable shard does not hold back the
//! others.

use athanor_core::config::{DaemonConfig, DaemonMode};
use athanor_core::error::{AthanorError, Result};
use athanor_core::traits::EventStore;
use athanor_core::types::{
    DeadLetterEvent, HighWaterStatistics, Sequence, ShardExecutionState, ShardState, ShardStatus,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentSettings, RewindTarget, ShardAgent};
use crate::high_water::{HighWaterAgent, HighWaterDetector};
use crate::registry::SubscriptionRegistry;
use crate::tracker::SequenceTracker;

pub struct ProjectionDaemon {
    config: DaemonConfig,
    store: Arc<dyn EventStore>,
    tracker: Arc<SequenceTracker>,
    high_water: HighWaterAgent,
    /// Whether this node may commit; cleared the moment ownership is lost
    lease: watch::Sender<bool>,
    agents: BTreeMap<String, Arc<ShardAgent>>,
}

impl ProjectionDaemon {
    /// Build agents for every subscription scoped to `config.database`
    ///
    /// Fails before anything runs on invalid configuration or duplicate
    /// shard identities.
    pub fn new(
        config: DaemonConfig,
        store: Arc<dyn EventStore>,
        registry: &SubscriptionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        registry.validate()?;

        let detector = Arc::new(HighWaterDetector::new(
            store.clone(),
            config.high_water.clone(),
        ));
        let high_water = HighWaterAgent::new(detector, config.retry_backoff.clone());
        let tracker = Arc::new(SequenceTracker::new());
        let settings = AgentSettings::from_config(&config);
        let (lease, _) = watch::channel(true);

        let mut agents = BTreeMap::new();
        for registration in registry.for_database(&config.database) {
            let agent = ShardAgent::new(
                registration.options.clone(),
                registration.source.clone(),
                store.clone(),
                tracker.clone(),
                high_water.subscribe(),
                lease.subscribe(),
                config.database.clone(),
                settings.clone(),
            );
            agents.insert(agent.identity().to_string(), Arc::new(agent));
        }

        info!(
            database = %config.database,
            mode = ?config.mode,
            shards = agents.len(),
            "Projection daemon configured"
        );

        Ok(Self {
            config,
            store,
            tracker,
            high_water,
            lease,
            agents,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    pub fn is_enabled(&self) -> bool {
        self.config.mode != DaemonMode::Disabled
    }

    /// Allow or refuse commits from every agent
    ///
    /// A refused commit abandons its page without halting the shard.
    pub fn set_lease_held(&self, held: bool) {
        self.lease.send_replace(held);
    }

    pub fn lease_held(&self) -> bool {
        *self.lease.borrow()
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn agent(&self, shard: &str) -> Result<&Arc<ShardAgent>> {
        self.agents
            .get(shard)
            .ok_or_else(|| AthanorError::ShardNotFound(shard.to_string()))
    }

    /// Start high-water detection and every agent that is not errored
    ///
    /// All agents are attempted; the first failure is returned afterwards.
    /// Errored shards wait for an explicit `start_agent` or rewind.
    pub async fn start_all(&self) -> Result<()> {
        if !self.is_enabled() {
            info!("Projection daemon is disabled");
            return Ok(());
        }

        self.high_water.start().await;
        let mut first_error = None;
        for (name, agent) in &self.agents {
            if agent.state() == ShardExecutionState::Errored {
                warn!(shard = %name, "Shard is errored, leaving it halted");
                continue;
            }
            if let Err(e) = agent.start().await {
                warn!(shard = %name, error = %e, "Shard failed to start");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(shards = self.agents.len(), "All shards started");
                Ok(())
            }
        }
    }

    pub async fn stop_all(&self) {
        join_all(self.agents.values().map(|agent| agent.stop())).await;
        self.high_water.stop().await;
        info!(shards = self.agents.len(), "All shards stopped");
    }

    pub async fn start_agent(&self, shard: &str) -> Result<()> {
        let agent = self.agent(shard)?;
        if !self.is_enabled() {
            return Err(AthanorError::InvalidState(format!(
                "cannot start {} while the daemon is disabled",
                shard
            )));
        }
        self.high_water.start().await;
        agent.start().await
    }

    pub async fn stop_agent(&self, shard: &str) -> Result<()> {
        self.agent(shard)?.stop().await;
        Ok(())
    }

    pub fn pause(&self, shard: &str) -> Result<()> {
        self.agent(shard)?.pause()
    }

    pub fn resume(&self, shard: &str) -> Result<()> {
        self.agent(shard)?.resume()
    }

    pub async fn rewind_subscription(&self, shard: &str, target: RewindTarget) -> Result<()> {
        self.agent(shard)?.rewind(target).await
    }

    /// Persisted progress of a registered shard
    pub async fn progress(&self, shard: &str) -> Result<Option<ShardState>> {
        self.agent(shard)?;
        self.store.load_progress(shard).await
    }

    pub async fn all_progress(&self) -> Result<Vec<ShardState>> {
        self.store.all_progress().await
    }

    /// Last published high-water mark
    pub fn high_water_mark(&self) -> Sequence {
        self.high_water.current_mark()
    }

    pub fn high_water_statistics(&self) -> HighWaterStatistics {
        self.high_water.detector().statistics()
    }

    pub fn statuses(&self) -> Vec<ShardStatus> {
        self.agents.values().map(|agent| agent.status()).collect()
    }

    pub async fn dead_letters(
        &self,
        shard: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>> {
        self.store.dead_letters(shard, limit).await
    }

    /// Block until every active shard has caught up with the high-water
    /// mark as of this call
    ///
    /// Fails with `NonStaleTimeout` naming the lagging shards once `timeout`
    /// elapses, and immediately when a lagging shard is errored.
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let token = CancellationToken::new();
        let target = match self.high_water.check_now(&token).await {
            Ok(status) => status.current_mark,
            Err(e) => {
                warn!(error = %e, "High-water check failed, using last published mark");
                self.high_water.current_mark()
            }
        };

        loop {
            let lagging: Vec<&Arc<ShardAgent>> = self
                .agents
                .values()
                .filter(|agent| agent.state() != ShardExecutionState::Stopped)
                .filter(|agent| agent.position() < target)
                .collect();

            if lagging.is_empty() {
                return Ok(());
            }

            if let Some(errored) = lagging
                .iter()
                .find(|agent| agent.state() == ShardExecutionState::Errored)
            {
                let status = errored.status();
                return Err(AthanorError::InvalidState(format!(
                    "shard {} is errored at {}: {}",
                    status.name,
                    status.position,
                    status.error.unwrap_or_default()
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AthanorError::NonStaleTimeout {
                    timeout,
                    lagging: lagging
                        .iter()
                        .map(|agent| format!("{}@{}/{}", agent.identity(), agent.position(), target))
                        .collect(),
                });
            }

            let pause = self.config.non_stale_polling().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::config::{HighWaterConfig, SubscriptionOptions};
    use athanor_core::memory::InMemoryEventStore;
    use athanor_core::traits::{
        ChangeListener, NullChangeListener, ProjectionSession, ShardController, Subscription,
    };
    use athanor_core::types::{EventRange, NewEvent};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counter {
        events: Mutex<usize>,
    }

    #[async_trait]
    impl Subscription for Counter {
        async fn process_events(
            &self,
            page: &EventRange,
            _controller: &ShardController,
            _session: &mut ProjectionSession,
            _token: &CancellationToken,
        ) -> Result<Box<dyn ChangeListener>> {
            *self.events.lock() += page.len();
            Ok(NullChangeListener::boxed())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Subscription for Stuck {
        async fn process_events(
            &self,
            _page: &EventRange,
            _controller: &ShardController,
            _session: &mut ProjectionSession,
            _token: &CancellationToken,
        ) -> Result<Box<dyn ChangeListener>> {
            Err(AthanorError::Projection("always fails".into()))
        }
    }

    fn config() -> DaemonConfig {
        DaemonConfig::default()
            .with_high_water(
                HighWaterConfig::default()
                    .with_polling_interval_ms(10)
                    .with_fast_polling_ms(5),
            )
            .with_max_commit_retries(1)
            .with_retry_backoff(athanor_core::config::BackoffStrategy::Fixed { delay_ms: 1 })
    }

    fn seeded(n: usize) -> Arc<InMemoryEventStore> {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append("s", (0..n).map(|_| NewEvent::of_type("A")).collect())
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_start_all_and_wait_for_non_stale() {
        let store = seeded(12);
        let counter = Arc::new(Counter::default());
        let mut registry = SubscriptionRegistry::new();
        registry
            .register(
                SubscriptionOptions::new("One").with_batch_size(5),
                athanor_core::traits::SubscriptionSource::Instance(counter.clone()),
            )
            .subscribe(SubscriptionOptions::new("Two"), Counter::default());

        let daemon = ProjectionDaemon::new(config(), store.clone(), &registry).unwrap();
        assert_eq!(daemon.shard_names(), vec!["One:All", "Two:All"]);

        daemon.start_all().await.unwrap();
        daemon
            .wait_for_non_stale_data(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(*counter.events.lock(), 12);
        assert_eq!(daemon.high_water_mark(), 12);
        let progress = daemon.progress("One:All").await.unwrap().unwrap();
        assert_eq!(progress.sequence, 12);

        daemon.stop_all().await;
        assert!(daemon
            .statuses()
            .iter()
            .all(|s| s.state == ShardExecutionState::Stopped));
    }

    #[tokio::test]
    async fn test_duplicate_names_fail_before_start() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .subscribe(SubscriptionOptions::new("Kafka"), Counter::default())
            .subscribe(SubscriptionOptions::new("Kafka"), Counter::default());

        let result = ProjectionDaemon::new(config(), seeded(1), &registry);
        assert!(matches!(
            result.err(),
            Some(AthanorError::DuplicateSubscriptionNames(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_shard_is_reported() {
        let daemon =
            ProjectionDaemon::new(config(), seeded(1), &SubscriptionRegistry::new()).unwrap();
        assert!(matches!(
            daemon.start_agent("Missing:All").await,
            Err(AthanorError::ShardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_errored_shard_fails_non_stale_wait() {
        let store = seeded(3);
        let mut registry = SubscriptionRegistry::new();
        registry
            .subscribe(SubscriptionOptions::new("Good"), Counter::default())
            .subscribe(SubscriptionOptions::new("Stuck"), Stuck);

        let daemon = ProjectionDaemon::new(config(), store, &registry).unwrap();
        daemon.start_all().await.unwrap();

        let err = daemon
            .wait_for_non_stale_data(Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Stuck:All"));

        let good = daemon.agent("Good:All").unwrap();
        assert_eq!(good.state(), ShardExecutionState::Running);
        daemon.stop_all().await;
    }

    #[tokio::test]
    async fn test_start_all_leaves_errored_shard_halted() {
        let store = seeded(3);
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionOptions::new("Stuck"), Stuck);

        let daemon = ProjectionDaemon::new(config(), store.clone(), &registry).unwrap();
        daemon.start_all().await.unwrap();
        let stuck = daemon.agent("Stuck:All").unwrap().clone();
        let mut states = stuck.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != ShardExecutionState::Errored {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        daemon.stop_all().await;
        assert_eq!(stuck.state(), ShardExecutionState::Errored);

        daemon.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stuck.state(), ShardExecutionState::Errored);
        assert!(stuck.status().error.unwrap().contains("always fails"));
        assert_eq!(daemon.progress("Stuck:All").await.unwrap().unwrap().sequence, 0);
        daemon.stop_all().await;
    }

    #[tokio::test]
    async fn test_non_stale_times_out_on_paused_shard() {
        let store = seeded(2);
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionOptions::new("Slow"), Counter::default());

        let daemon = ProjectionDaemon::new(config(), store.clone(), &registry).unwrap();
        daemon.start_all().await.unwrap();
        daemon
            .wait_for_non_stale_data(Duration::from_secs(2))
            .await
            .unwrap();

        daemon.pause("Slow:All").unwrap();
        store
            .append("s", vec![NewEvent::of_type("A")])
            .unwrap();

        let err = daemon
            .wait_for_non_stale_data(Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            AthanorError::NonStaleTimeout { lagging, .. } => {
                assert_eq!(lagging, vec!["Slow:All@2/3".to_string()]);
            }
            other => panic!("expected timeout, got {}", other),
        }
        daemon.stop_all().await;
    }

    #[tokio::test]
    async fn test_disabled_daemon_does_nothing() {
        let store = seeded(3);
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionOptions::new("Idle"), Counter::default());

        let daemon = ProjectionDaemon::new(
            config().with_mode(DaemonMode::Disabled),
            store.clone(),
            &registry,
        )
        .unwrap();
        daemon.start_all().await.unwrap();
        daemon
            .wait_for_non_stale_data(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.load_progress("Idle:All").await.unwrap().is_none());
    }
}
