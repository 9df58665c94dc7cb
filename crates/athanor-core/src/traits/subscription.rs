use crate::error::{AthanorError, Result};
use crate::types::{
    CommitInfo, DeadLetterEvent, Event, EventRange, ProjectionWrite, Sequence, ShardCommit,
    ShardName,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// User-supplied projection or subscription logic
///
/// Called once per page. Writes go to `session` and are only persisted if
/// the whole page commits.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn process_events(
        &self,
        page: &EventRange,
        controller: &ShardController,
        session: &mut ProjectionSession,
        token: &CancellationToken,
    ) -> Result<Box<dyn ChangeListener>>;
}

/// Hooks around a page's commit transaction
///
/// A `before_commit` error aborts the commit. `after_commit` runs once the
/// transaction is durable; its errors are logged only.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn before_commit(&self, _commit: &ShardCommit) -> Result<()> {
        Ok(())
    }

    async fn after_commit(&self, _info: &CommitInfo) -> Result<()> {
        Ok(())
    }
}

/// Listener with no hooks
pub struct NullChangeListener;

impl ChangeListener for NullChangeListener {}

impl NullChangeListener {
    pub fn boxed() -> Box<dyn ChangeListener> {
        Box::new(NullChangeListener)
    }
}

pub type SubscriptionFactory = Arc<dyn Fn() -> Box<dyn Subscription> + Send + Sync>;

/// How a shard obtains its handler
#[derive(Clone)]
pub enum SubscriptionSource {
    /// One shared instance for the shard's lifetime
    Instance(Arc<dyn Subscription>),
    /// A fresh instance per page, e.g. built from a service scope
    Scoped(SubscriptionFactory),
}

impl SubscriptionSource {
    pub fn instance<S: Subscription + 'static>(subscription: S) -> Self {
        SubscriptionSource::Instance(Arc::new(subscription))
    }

    pub fn scoped<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn Subscription> + Send + Sync + 'static,
    {
        SubscriptionSource::Scoped(Arc::new(factory))
    }

    pub async fn process_events(
        &self,
        page: &EventRange,
        controller: &ShardController,
        session: &mut ProjectionSession,
        token: &CancellationToken,
    ) -> Result<Box<dyn ChangeListener>> {
        match self {
            SubscriptionSource::Instance(subscription) => {
                subscription
                    .process_events(page, controller, session, token)
                    .await
            }
            SubscriptionSource::Scoped(factory) => {
                let subscription = factory();
                subscription
                    .process_events(page, controller, session, token)
                    .await
            }
        }
    }
}

/// Buffered read-model mutations for one page
#[derive(Debug, Default)]
pub struct ProjectionSession {
    writes: Vec<ProjectionWrite>,
}

impl ProjectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert<T: Serialize>(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        document: &T,
    ) -> Result<()> {
        let document = serde_json::to_value(document)?;
        self.writes.push(ProjectionWrite::Upsert {
            collection: collection.into(),
            id: id.into(),
            document,
        });
        Ok(())
    }

    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) {
        self.writes.push(ProjectionWrite::Delete {
            collection: collection.into(),
            id: id.into(),
        });
    }

    pub fn truncate(&mut self, collection: impl Into<String>) {
        self.writes.push(ProjectionWrite::Truncate {
            collection: collection.into(),
        });
    }

    pub fn push(&mut self, write: ProjectionWrite) {
        self.writes.push(write);
    }

    pub fn writes(&self) -> &[ProjectionWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<ProjectionWrite> {
        self.writes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriticalFailure {
    pub message: String,
    pub last_good_sequence: Sequence,
}

#[derive(Default)]
struct ControllerState {
    critical: Option<CriticalFailure>,
    dead_letters: Vec<DeadLetterEvent>,
}

/// Capabilities a handler can invoke while processing a page
pub struct ShardController {
    shard: ShardName,
    state: Mutex<ControllerState>,
}

impl ShardController {
    pub fn new(shard: ShardName) -> Self {
        Self {
            shard,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// Halt the shard: the in-flight page is rolled back and no further
    /// pages are processed until an operator restarts or rewinds it
    pub fn report_critical_failure(
        &self,
        error: impl std::fmt::Display,
        last_good_sequence: Sequence,
    ) {
        let mut state = self.state.lock();
        if state.critical.is_none() {
            state.critical = Some(CriticalFailure {
                message: error.to_string(),
                last_good_sequence,
            });
        }
    }

    /// Record `event` as a dead letter and treat it as handled
    pub fn record_dead_letter_event<E>(&self, event: &Event, error: &E)
    where
        E: std::error::Error + ?Sized,
    {
        let exception_type = short_type_name(std::any::type_name::<E>());
        let record = DeadLetterEvent::new(
            self.shard.identity(),
            self.shard.projection_name.clone(),
            event,
            exception_type,
            error.to_string(),
        );
        self.state.lock().dead_letters.push(record);
    }

    pub fn has_critical_failure(&self) -> bool {
        self.state.lock().critical.is_some()
    }

    /// Drain what the handler reported
    pub fn take(&self) -> (Option<CriticalFailure>, Vec<DeadLetterEvent>) {
        let mut state = self.state.lock();
        (
            state.critical.take(),
            std::mem::take(&mut state.dead_letters),
        )
    }
}

impl CriticalFailure {
    pub fn into_error(self, shard: &ShardName) -> AthanorError {
        AthanorError::CriticalFailure {
            shard: shard.identity(),
            sequence: self.last_good_sequence,
            message: self.message,
        }
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMetadata, StreamId};
    use chrono::Utc;

    fn test_event(sequence: Sequence) -> Event {
        Event {
            sequence,
            stream_id: StreamId::new("s1"),
            version: sequence,
            event_type: "A".to_string(),
            stream_type: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
            metadata: EventMetadata::default(),
            tenant_id: None,
            archived: false,
        }
    }

    #[test]
    fn test_session_buffers_writes() {
        let mut session = ProjectionSession::new();
        session
            .upsert("trips", "t1", &serde_json::json!({"miles": 3}))
            .unwrap();
        session.delete("trips", "t0");
        session.truncate("totals");

        assert_eq!(session.len(), 3);
        assert_eq!(session.writes()[0].collection(), "trips");
        assert_eq!(session.into_writes()[2].collection(), "totals");
    }

    #[test]
    fn test_controller_records_dead_letters() {
        let controller = ShardController::new(ShardName::new("Fake"));
        let error = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad payload");
        controller.record_dead_letter_event(&test_event(7), &error);

        let (critical, dead_letters) = controller.take();
        assert!(critical.is_none());
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].event_sequence, 7);
        assert_eq!(dead_letters[0].shard_name, "Fake:All");
        assert_eq!(dead_letters[0].exception_type, "Error");
        assert_eq!(dead_letters[0].exception_message, "bad payload");

        let (_, drained) = controller.take();
        assert!(drained.is_empty());
    }

    #[test]
    fn test_first_critical_failure_wins() {
        let shard = ShardName::new("Fake");
        let controller = ShardController::new(shard.clone());
        controller.report_critical_failure("corrupt", 4);
        controller.report_critical_failure("later", 9);
        assert!(controller.has_critical_failure());

        let (critical, _) = controller.take();
        let err = critical.unwrap().into_error(&shard);
        assert!(matches!(
            err,
            AthanorError::CriticalFailure { sequence: 4, .. }
        ));
    }
}
