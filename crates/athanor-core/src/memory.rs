//! In-memory event store and lock table
//!
//! Reference implementations of [`EventStore`] and [`DistributedLock`] for
//! tests and embedded use. Beyond the trait contracts they can reserve a
//! sequence without committing it (a visible gap), archive streams, and
//! inject transient failures.

use crate::error::{AthanorError, Result};
use crate::traits::{DistributedLock, EventStore, PageRequest};
use crate::types::{
    CommitOutcome, DeadLetterEvent, Event, EventRange, HighWaterProbe, NewEvent,
    ProjectionWrite, Sequence, ShardCommit, ShardState, StreamId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct StreamInfo {
    version: u64,
    stream_type: Option<String>,
    archived: bool,
}

#[derive(Default)]
struct StoreState {
    /// `None` marks a reserved but uncommitted sequence
    slots: BTreeMap<Sequence, Option<Event>>,
    last_reserved: Sequence,
    streams: HashMap<StreamId, StreamInfo>,
    progress: BTreeMap<String, ShardState>,
    dead_letters: Vec<DeadLetterEvent>,
    documents: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    fail_fetches: usize,
    fail_commits: usize,
    fail_detects: usize,
    fetch_calls: u64,
    commit_calls: u64,
}

impl StoreState {
    fn reserve(&mut self) -> Sequence {
        self.last_reserved += 1;
        self.slots.insert(self.last_reserved, None);
        self.last_reserved
    }

    fn build_event(
        &mut self,
        sequence: Sequence,
        stream: &StreamId,
        stream_type: Option<&str>,
        event: NewEvent,
        timestamp: DateTime<Utc>,
    ) -> Event {
        let info = self.streams.entry(stream.clone()).or_default();
        if info.stream_type.is_none() {
            info.stream_type = stream_type.map(str::to_string);
        }
        info.version += 1;
        Event {
            sequence,
            stream_id: stream.clone(),
            version: info.version,
            event_type: event.event_type,
            stream_type: info.stream_type.clone(),
            data: event.data,
            timestamp,
            metadata: event.metadata,
            tenant_id: None,
            archived: false,
        }
    }

    fn visible(&self, event: &Event) -> Event {
        let mut event = event.clone();
        event.archived = self
            .streams
            .get(&event.stream_id)
            .map(|s| s.archived)
            .unwrap_or(false);
        event
    }

    fn current_progress(&self, shard_name: &str) -> Sequence {
        self.progress
            .get(shard_name)
            .map(|s| s.sequence)
            .unwrap_or(0)
    }

    fn apply_write(&mut self, write: ProjectionWrite) {
        match write {
            ProjectionWrite::Upsert {
                collection,
                id,
                document,
            } => {
                self.documents
                    .entry(collection)
                    .or_default()
                    .insert(id, document);
            }
            ProjectionWrite::Delete { collection, id } => {
                if let Some(docs) = self.documents.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
            ProjectionWrite::Truncate { collection } => {
                self.documents.remove(&collection);
            }
        }
    }
}

/// Event store held entirely in process memory
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<StoreState>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events to a stream, returning their global sequences
    pub fn append(
        &self,
        stream: impl Into<StreamId>,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Sequence>> {
        self.append_typed(stream, None, events, Utc::now())
    }

    /// Append with a stream type and explicit timestamp
    pub fn append_typed(
        &self,
        stream: impl Into<StreamId>,
        stream_type: Option<&str>,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Sequence>> {
        let stream = stream.into();
        let mut state = self.state.lock();
        let mut sequences = Vec::with_capacity(events.len());
        for event in events {
            let sequence = state.reserve();
            let built = state.build_event(sequence, &stream, stream_type, event, timestamp);
            state.slots.insert(sequence, Some(built));
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    /// Reserve a sequence as an in-flight writer would, leaving a gap
    pub fn reserve_sequence(&self) -> Sequence {
        self.state.lock().reserve()
    }

    /// Commit an event into a previously reserved sequence
    pub fn commit_reserved(
        &self,
        sequence: Sequence,
        stream: impl Into<StreamId>,
        event: NewEvent,
    ) -> Result<()> {
        let stream = stream.into();
        let mut state = self.state.lock();
        match state.slots.get(&sequence) {
            Some(None) => {
                let built = state.build_event(sequence, &stream, None, event, Utc::now());
                state.slots.insert(sequence, Some(built));
                Ok(())
            }
            Some(Some(_)) => Err(AthanorError::InvalidState(format!(
                "Sequence {} is already committed",
                sequence
            ))),
            None => Err(AthanorError::NotFound(format!(
                "Sequence {} was never reserved",
                sequence
            ))),
        }
    }

    /// Soft-exclude a stream's events from unfiltered projections
    pub fn archive_stream(&self, stream: impl Into<StreamId>) {
        let stream = stream.into();
        self.state.lock().streams.entry(stream).or_default().archived = true;
    }

    /// Overwrite a shard's progress out of band, as a competing writer would
    pub fn force_progress(&self, shard_name: &str, sequence: Sequence) {
        self.state.lock().progress.insert(
            shard_name.to_string(),
            ShardState::new(shard_name, sequence, "Default"),
        );
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state.lock().fail_fetches = count;
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().fail_commits = count;
    }

    pub fn fail_next_detects(&self, count: usize) {
        self.state.lock().fail_detects = count;
    }

    pub fn fetch_calls(&self) -> u64 {
        self.state.lock().fetch_calls
    }

    pub fn commit_calls(&self) -> u64 {
        self.state.lock().commit_calls
    }

    pub fn highest_sequence(&self) -> Sequence {
        self.state.lock().last_reserved
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn documents(&self, collection: &str) -> BTreeMap<String, serde_json::Value> {
        self.state
            .lock()
            .documents
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        token: &CancellationToken,
    ) -> Result<EventRange> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }

        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(AthanorError::Storage("injected fetch failure".into()));
        }

        let mut events = Vec::new();
        if request.ceiling > request.floor {
            for slot in state
                .slots
                .range(request.floor + 1..=request.ceiling)
                .filter_map(|(_, slot)| slot.as_ref())
            {
                let event = state.visible(slot);
                if request.filter.matches(&event) {
                    events.push(event);
                    if events.len() >= request.batch_size {
                        break;
                    }
                }
            }
        }

        let ceiling = if events.len() >= request.batch_size {
            events
                .last()
                .map(|e| e.sequence)
                .unwrap_or(request.ceiling)
        } else {
            request.ceiling
        };

        Ok(EventRange::new(request.shard.clone(), request.floor, ceiling).with_events(events))
    }

    async fn detect_high_water(
        &self,
        from: Sequence,
        token: &CancellationToken,
    ) -> Result<HighWaterProbe> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }

        let mut state = self.state.lock();
        if state.fail_detects > 0 {
            state.fail_detects -= 1;
            return Err(AthanorError::Storage("injected detect failure".into()));
        }

        let mut contiguous = from;
        while let Some(Some(_)) = state.slots.get(&(contiguous + 1)) {
            contiguous += 1;
        }

        Ok(HighWaterProbe {
            highest_sequence: state.last_reserved,
            contiguous_through: contiguous.min(state.last_reserved.max(from)),
        })
    }

    async fn load_progress(&self, shard_name: &str) -> Result<Option<ShardState>> {
        Ok(self.state.lock().progress.get(shard_name).cloned())
    }

    async fn all_progress(&self) -> Result<Vec<ShardState>> {
        Ok(self.state.lock().progress.values().cloned().collect())
    }

    async fn commit_progress_and_writes(
        &self,
        commit: ShardCommit,
        token: &CancellationToken,
    ) -> Result<CommitOutcome> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }

        let mut state = self.state.lock();
        state.commit_calls += 1;
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(AthanorError::Storage("injected commit failure".into()));
        }

        let actual = state.current_progress(&commit.shard_name);
        if actual != commit.expected_sequence {
            return Ok(CommitOutcome::Conflict { actual });
        }

        let writes_applied = commit.writes.len();
        for write in commit.writes {
            state.apply_write(write);
        }
        state.dead_letters.extend(commit.dead_letters);
        state.progress.insert(
            commit.shard_name.clone(),
            ShardState::new(commit.shard_name, commit.new_sequence, commit.database),
        );

        Ok(CommitOutcome::Committed { writes_applied })
    }

    async fn reset_progress(
        &self,
        shard_name: &str,
        database: &str,
        sequence: Sequence,
        teardown: &[String],
    ) -> Result<()> {
        debug!(shard = shard_name, sequence, teardown = teardown.len(), "Resetting progress");
        let mut state = self.state.lock();
        for collection in teardown {
            state.documents.remove(collection);
        }
        state.progress.insert(
            shard_name.to_string(),
            ShardState::new(shard_name, sequence, database),
        );
        Ok(())
    }

    async fn append_dead_letter(&self, record: DeadLetterEvent) -> Result<()> {
        self.state.lock().dead_letters.push(record);
        Ok(())
    }

    async fn dead_letters(
        &self,
        shard_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|d| shard_name.map_or(true, |name| d.shard_name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sequence_before(&self, timestamp: DateTime<Utc>) -> Result<Sequence> {
        let state = self.state.lock();
        Ok(state
            .slots
            .values()
            .filter_map(|slot| slot.as_ref())
            .filter(|event| event.timestamp < timestamp)
            .map(|event| event.sequence)
            .max()
            .unwrap_or(0))
    }
}

#[derive(Default)]
struct LockTableState {
    owners: HashMap<i64, String>,
    severed: HashSet<String>,
}

/// Shared lock table standing in for a database's advisory locks
#[derive(Clone)]
pub struct InMemoryLocks {
    state: Arc<Mutex<LockTableState>>,
    /// Bumped on every sever so waiting holders re-check
    severings: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryLocks {
    fn default() -> Self {
        let (severings, _) = watch::channel(0);
        Self {
            state: Arc::default(),
            severings: Arc::new(severings),
        }
    }
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for one node
    pub fn node(&self, node_id: impl Into<String>) -> InMemoryLock {
        InMemoryLock {
            node_id: node_id.into(),
            table: self.clone(),
        }
    }

    pub fn owner(&self, lock_id: i64) -> Option<String> {
        self.state.lock().owners.get(&lock_id).cloned()
    }

    /// Simulate a dropped connection: the node loses every lock it holds
    /// and cannot acquire new ones until restored
    pub fn sever(&self, node_id: &str) {
        let mut state = self.state.lock();
        state.owners.retain(|_, owner| owner != node_id);
        state.severed.insert(node_id.to_string());
        drop(state);
        self.severings.send_modify(|generation| *generation += 1);
        debug!(node = node_id, "Severed lock connection");
    }

    pub fn restore(&self, node_id: &str) {
        self.state.lock().severed.remove(node_id);
    }
}

/// One node's handle on an [`InMemoryLocks`] table
pub struct InMemoryLock {
    node_id: String,
    table: InMemoryLocks,
}

impl InMemoryLock {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, lock_id: i64) -> Result<bool> {
        let mut state = self.table.state.lock();
        if state.severed.contains(&self.node_id) {
            return Err(AthanorError::Lock(format!(
                "node {} is disconnected",
                self.node_id
            )));
        }
        match state.owners.get(&lock_id) {
            Some(owner) => Ok(owner == &self.node_id),
            None => {
                state.owners.insert(lock_id, self.node_id.clone());
                Ok(true)
            }
        }
    }

    async fn is_held(&self, lock_id: i64) -> Result<bool> {
        let state = self.table.state.lock();
        if state.severed.contains(&self.node_id) {
            return Err(AthanorError::Lock(format!(
                "node {} is disconnected",
                self.node_id
            )));
        }
        Ok(state.owners.get(&lock_id) == Some(&self.node_id))
    }

    async fn release(&self, lock_id: i64) -> Result<()> {
        let mut state = self.table.state.lock();
        if state.owners.get(&lock_id) == Some(&self.node_id) {
            state.owners.remove(&lock_id);
        }
        Ok(())
    }

    async fn disconnected(&self) {
        let mut changes = self.table.severings.subscribe();
        loop {
            let severed = self.table.state.lock().severed.contains(&self.node_id);
            if severed {
                return;
            }
            if changes.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventFilter, ShardName};

    fn page(floor: Sequence, ceiling: Sequence, batch_size: usize) -> PageRequest {
        PageRequest {
            shard: ShardName::new("Fake"),
            filter: EventFilter::all(),
            floor,
            ceiling,
            batch_size,
        }
    }

    fn events(types: &[&str]) -> Vec<NewEvent> {
        types.iter().map(|t| NewEvent::of_type(*t)).collect()
    }

    #[tokio::test]
    async fn test_append_assigns_sequences_and_versions() {
        let store = InMemoryEventStore::new();
        let first = store.append("s1", events(&["A", "B"])).unwrap();
        let second = store.append("s2", events(&["C"])).unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);

        let token = CancellationToken::new();
        let range = store.fetch_page(&page(0, 3, 10), &token).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.events[1].version, 2);
        assert_eq!(range.events[2].version, 1);
    }

    #[tokio::test]
    async fn test_full_batch_narrows_ceiling() {
        let store = InMemoryEventStore::new();
        store.append("s1", events(&["A", "B", "C", "D"])).unwrap();

        let token = CancellationToken::new();
        let range = store.fetch_page(&page(0, 4, 2), &token).await.unwrap();
        assert_eq!(range.ceiling, 2);
        assert_eq!(range.len(), 2);

        let range = store.fetch_page(&page(2, 4, 10), &token).await.unwrap();
        assert_eq!(range.ceiling, 4);
        assert_eq!(range.len(), 2);
    }

    #[tokio::test]
    async fn test_detects_reserved_gap() {
        let store = InMemoryEventStore::new();
        store.append("s1", events(&["A", "B"])).unwrap();
        let reserved = store.reserve_sequence();
        store.append("s1", events(&["C"])).unwrap();

        let token = CancellationToken::new();
        let probe = store.detect_high_water(0, &token).await.unwrap();
        assert_eq!(probe.highest_sequence, 4);
        assert_eq!(probe.contiguous_through, 2);
        assert!(probe.has_gap());

        store
            .commit_reserved(reserved, "s2", NewEvent::of_type("D"))
            .unwrap();
        let probe = store.detect_high_water(2, &token).await.unwrap();
        assert_eq!(probe.contiguous_through, 4);
        assert!(!probe.has_gap());
    }

    #[tokio::test]
    async fn test_commit_conflict_writes_nothing() {
        let store = InMemoryEventStore::new();
        store.force_progress("Fake:All", 5);

        let token = CancellationToken::new();
        let outcome = store
            .commit_progress_and_writes(
                ShardCommit {
                    shard_name: "Fake:All".into(),
                    database: "Default".into(),
                    expected_sequence: 0,
                    new_sequence: 3,
                    writes: vec![ProjectionWrite::Upsert {
                        collection: "docs".into(),
                        id: "1".into(),
                        document: serde_json::json!({}),
                    }],
                    dead_letters: vec![],
                },
                &token,
            )
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Conflict { actual: 5 });
        assert!(store.document("docs", "1").is_none());
    }

    #[tokio::test]
    async fn test_lock_table_exclusive_and_severable() {
        let locks = InMemoryLocks::new();
        let a = locks.node("a");
        let b = locks.node("b");

        assert!(a.try_acquire(42).await.unwrap());
        assert!(!b.try_acquire(42).await.unwrap());
        assert!(a.is_held(42).await.unwrap());

        locks.sever("a");
        assert!(a.is_held(42).await.is_err());
        assert!(b.try_acquire(42).await.unwrap());
        assert_eq!(locks.owner(42).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_disconnected_resolves_on_sever() {
        let locks = InMemoryLocks::new();
        let a = locks.node("a");
        assert!(a.try_acquire(1).await.unwrap());

        let waiting = tokio::spawn({
            let a = locks.node("a");
            async move { a.disconnected().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        locks.sever("b");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        locks.sever("a");
        tokio::time::timeout(std::time::Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }
}
