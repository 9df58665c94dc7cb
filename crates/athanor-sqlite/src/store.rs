use athanor_core::{
    error::{AthanorError, Result},
    traits::{EventStore, PageRequest},
    types::{
        CommitOutcome, DeadLetterEvent, Event, EventMetadata, EventRange, HighWaterProbe,
        NewEvent, ProjectionWrite, Sequence, ShardCommit, ShardState, StreamId,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::lease::SqliteLease;
use crate::schema;

pub(crate) fn db_err(e: rusqlite::Error) -> AthanorError {
    AthanorError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so text comparison orders by time
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AthanorError::Serialization(format!("bad timestamp {:?}: {}", raw, e)))
}

const EVENT_SELECT: &str = "SELECT e.seq_id, e.stream_id, e.version, e.event_type, s.stream_type,
        e.data, e.timestamp, e.metadata, e.tenant_id, COALESCE(s.archived, 0)
 FROM events e LEFT JOIN streams s ON s.stream_id = e.stream_id";

struct EventRow {
    sequence: i64,
    stream_id: String,
    version: i64,
    event_type: String,
    stream_type: Option<String>,
    data: String,
    timestamp: String,
    metadata: String,
    tenant_id: Option<String>,
    archived: bool,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            stream_id: row.get(1)?,
            version: row.get(2)?,
            event_type: row.get(3)?,
            stream_type: row.get(4)?,
            data: row.get(5)?,
            timestamp: row.get(6)?,
            metadata: row.get(7)?,
            tenant_id: row.get(8)?,
            archived: row.get(9)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        let metadata: EventMetadata = serde_json::from_str(&self.metadata)?;
        Ok(Event {
            sequence: self.sequence as Sequence,
            stream_id: StreamId::new(self.stream_id),
            version: self.version as u64,
            event_type: self.event_type,
            stream_type: self.stream_type,
            data: serde_json::from_str(&self.data)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            metadata,
            tenant_id: self.tenant_id,
            archived: self.archived,
        })
    }
}

fn last_reserved(conn: &Connection) -> Result<Sequence> {
    let last: i64 = conn
        .query_row(
            "SELECT last_reserved FROM event_sequence WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(last as Sequence)
}

fn reserve_in(conn: &Connection) -> Result<Sequence> {
    let sequence: i64 = conn
        .query_row(
            "UPDATE event_sequence SET last_reserved = last_reserved + 1 WHERE id = 0
             RETURNING last_reserved",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(sequence as Sequence)
}

fn ensure_stream(conn: &Connection, stream: &StreamId, stream_type: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO streams (stream_id, stream_type) VALUES (?1, ?2)",
        params![stream.as_str(), stream_type],
    )
    .map_err(db_err)?;
    if stream_type.is_some() {
        conn.execute(
            "UPDATE streams SET stream_type = ?2 WHERE stream_id = ?1 AND stream_type IS NULL",
            params![stream.as_str(), stream_type],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn insert_event(
    conn: &Connection,
    sequence: Sequence,
    stream: &StreamId,
    event: &NewEvent,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    let version: i64 = conn
        .query_row(
            "UPDATE streams SET version = version + 1 WHERE stream_id = ?1 RETURNING version",
            [stream.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    conn.execute(
        "INSERT INTO events (seq_id, stream_id, version, event_type, data, metadata, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            sequence as i64,
            stream.as_str(),
            version,
            event.event_type,
            serde_json::to_string(&event.data)?,
            serde_json::to_string(&event.metadata)?,
            format_timestamp(timestamp),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn current_progress(conn: &Connection, shard_name: &str) -> Result<Sequence> {
    let sequence: Option<i64> = conn
        .query_row(
            "SELECT last_seq_id FROM progression WHERE name = ?1",
            [shard_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(sequence.unwrap_or(0) as Sequence)
}

fn upsert_progress(
    conn: &Connection,
    shard_name: &str,
    sequence: Sequence,
    database: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO progression (name, last_seq_id, database_name, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            last_seq_id = excluded.last_seq_id,
            database_name = excluded.database_name,
            updated_at = excluded.updated_at",
        params![
            shard_name,
            sequence as i64,
            database,
            format_timestamp(Utc::now())
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn apply_write(conn: &Connection, write: &ProjectionWrite) -> Result<()> {
    match write {
        ProjectionWrite::Upsert {
            collection,
            id,
            document,
        } => {
            conn.execute(
                "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body",
                params![collection, id, serde_json::to_string(document)?],
            )
            .map_err(db_err)?;
        }
        ProjectionWrite::Delete { collection, id } => {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map_err(db_err)?;
        }
        ProjectionWrite::Truncate { collection } => {
            conn.execute("DELETE FROM documents WHERE collection = ?1", [collection])
                .map_err(db_err)?;
        }
    }
    Ok(())
}

fn insert_dead_letter(conn: &Connection, record: &DeadLetterEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO dead_letters (shard_name, projection_name, event_sequence, event_type,
                                   exception_type, exception_message, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.shard_name,
            record.projection_name,
            record.event_sequence as i64,
            record.event_type,
            record.exception_type,
            record.exception_message,
            format_timestamp(record.recorded_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// SQLite-backed event store, read-model and progress storage
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
}

impl SqliteEventStore {
    pub fn open(config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Self::connect(&config)?;
        schema::init_schema(&conn)?;
        info!(path = %config.path.display(), "Opened athanor database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub(crate) fn connect(config: &SqliteConfig) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(db_err)?;

        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| AthanorError::Config(e.to_string()))?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| AthanorError::Config(e.to_string()))?;
        }
        conn.pragma_update(None, "synchronous", config.synchronous.as_pragma())
            .map_err(|e| AthanorError::Config(e.to_string()))?;

        Ok(conn)
    }

    /// Underlying connection, for custom read-model queries
    pub fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Ownership lease for `node_id` sharing this store's connection
    pub fn lease(&self, node_id: impl Into<String>) -> SqliteLease {
        SqliteLease::new(self.conn.clone(), node_id, self.config.lease_duration())
    }

    pub fn append(
        &self,
        stream: impl Into<StreamId>,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Sequence>> {
        self.append_typed(stream, None, events, Utc::now())
    }

    /// Append events in one transaction, returning their sequences
    pub fn append_typed(
        &self,
        stream: impl Into<StreamId>,
        stream_type: Option<&str>,
        events: Vec<NewEvent>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Sequence>> {
        let stream = stream.into();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        ensure_stream(&tx, &stream, stream_type)?;
        let mut sequences = Vec::with_capacity(events.len());
        for event in &events {
            let sequence = reserve_in(&tx)?;
            insert_event(&tx, sequence, &stream, event, timestamp)?;
            sequences.push(sequence);
        }

        tx.commit().map_err(db_err)?;
        debug!(stream = %stream, count = sequences.len(), "Appended events");
        Ok(sequences)
    }

    /// Allocate a sequence without committing an event into it
    pub fn reserve_sequence(&self) -> Result<Sequence> {
        let conn = self.conn.lock();
        reserve_in(&conn)
    }

    /// Fill a sequence obtained from [`Self::reserve_sequence`]
    pub fn commit_reserved(
        &self,
        sequence: Sequence,
        stream: impl Into<StreamId>,
        event: NewEvent,
    ) -> Result<()> {
        let stream = stream.into();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        if sequence > last_reserved(&tx)? {
            return Err(AthanorError::NotFound(format!(
                "Sequence {} was never reserved",
                sequence
            )));
        }
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE seq_id = ?1)",
                [sequence as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists {
            return Err(AthanorError::InvalidState(format!(
                "Sequence {} is already committed",
                sequence
            )));
        }

        ensure_stream(&tx, &stream, None)?;
        insert_event(&tx, sequence, &stream, &event, Utc::now())?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Soft-exclude a stream's events from projections
    pub fn archive_stream(&self, stream: impl Into<StreamId>) -> Result<()> {
        let stream = stream.into();
        let conn = self.conn.lock();
        ensure_stream(&conn, &stream, None)?;
        conn.execute(
            "UPDATE streams SET archived = 1 WHERE stream_id = ?1",
            [stream.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn highest_sequence(&self) -> Result<Sequence> {
        let conn = self.conn.lock();
        last_reserved(&conn)
    }

    pub fn document(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(AthanorError::from))
            .transpose()
    }

    pub fn documents(&self, collection: &str) -> Result<BTreeMap<String, serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, body FROM documents WHERE collection = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut documents = BTreeMap::new();
        for row in rows {
            let (id, body) = row.map_err(db_err)?;
            documents.insert(id, serde_json::from_str(&body)?);
        }
        Ok(documents)
    }
}

fn fetch_page_in(conn: &Connection, request: &PageRequest) -> Result<EventRange> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "{} WHERE e.seq_id > ?1 AND e.seq_id <= ?2 ORDER BY e.seq_id",
            EVENT_SELECT
        ))
        .map_err(db_err)?;
    let mut rows = stmt
        .query(params![request.floor as i64, request.ceiling as i64])
        .map_err(db_err)?;

    let mut events = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let event = EventRow::from_row(row).map_err(db_err)?.into_event()?;
        if request.filter.matches(&event) {
            events.push(event);
            if events.len() >= request.batch_size {
                break;
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

fn detect_high_water_in(conn: &Connection, from: Sequence) -> Result<HighWaterProbe> {
    let highest = last_reserved(conn)?;

    let mut stmt = conn
        .prepare_cached("SELECT seq_id FROM events WHERE seq_id > ?1 ORDER BY seq_id")
        .map_err(db_err)?;
    let mut rows = stmt.query([from as i64]).map_err(db_err)?;

    let mut contiguous = from;
    while let Some(row) = rows.next().map_err(db_err)? {
        let sequence: i64 = row.get(0).map_err(db_err)?;
        if sequence as Sequence != contiguous + 1 {
            break;
        }
        contiguous += 1;
    }

    Ok(HighWaterProbe {
        highest_sequence: highest,
        contiguous_through: contiguous,
    })
}

fn shard_state_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_shard_state(
    (name, sequence, database, updated_at): (String, i64, String, String),
) -> Result<ShardState> {
    Ok(ShardState {
        shard_name: name,
        sequence: sequence as Sequence,
        database,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn load_progress_in(conn: &Connection, shard_name: &str) -> Result<Option<ShardState>> {
    conn.query_row(
        "SELECT name, last_seq_id, database_name, updated_at FROM progression WHERE name = ?1",
        [shard_name],
        shard_state_from_row,
    )
    .optional()
    .map_err(db_err)?
    .map(into_shard_state)
    .transpose()
}

fn all_progress_in(conn: &Connection) -> Result<Vec<ShardState>> {
    let mut stmt = conn
        .prepare("SELECT name, last_seq_id, database_name, updated_at FROM progression ORDER BY name")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], shard_state_from_row)
        .map_err(db_err)?;

    let mut states = Vec::new();
    for row in rows {
        states.push(into_shard_state(row.map_err(db_err)?)?);
    }
    Ok(states)
}

fn commit_in(conn: &mut Connection, commit: &ShardCommit) -> Result<CommitOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;

    let actual = current_progress(&tx, &commit.shard_name)?;
    if actual != commit.expected_sequence {
        return Ok(CommitOutcome::Conflict { actual });
    }

    for write in &commit.writes {
        apply_write(&tx, write)?;
    }
    for record in &commit.dead_letters {
        insert_dead_letter(&tx, record)?;
    }
    upsert_progress(
        &tx,
        &commit.shard_name,
        commit.new_sequence,
        &commit.database,
    )?;

    tx.commit().map_err(db_err)?;
    Ok(CommitOutcome::Committed {
        writes_applied: commit.writes.len(),
    })
}

fn reset_progress_in(
    conn: &mut Connection,
    shard_name: &str,
    database: &str,
    sequence: Sequence,
    teardown: &[String],
) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;

    for collection in teardown {
        tx.execute("DELETE FROM documents WHERE collection = ?1", [collection])
            .map_err(db_err)?;
    }
    upsert_progress(&tx, shard_name, sequence, database)?;

    tx.commit().map_err(db_err)?;
    Ok(())
}

fn dead_letters_in(
    conn: &Connection,
    shard_name: Option<&str>,
    limit: usize,
) -> Result<Vec<DeadLetterEvent>> {
    let mut stmt = conn
        .prepare(
            "SELECT shard_name, projection_name, event_sequence, event_type,
                    exception_type, exception_message, recorded_at
             FROM dead_letters
             WHERE (?1 IS NULL OR shard_name = ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![shard_name, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .map_err(db_err)?;

    let mut records = Vec::new();
    for row in rows {
        let (shard, projection, sequence, event_type, exception_type, message, recorded_at) =
            row.map_err(db_err)?;
        records.push(DeadLetterEvent {
            shard_name: shard,
            projection_name: projection,
            event_sequence: sequence as Sequence,
            event_type,
            exception_type,
            exception_message: message,
            recorded_at: parse_timestamp(&recorded_at)?,
        });
    }
    Ok(records)
}

fn sequence_before_in(conn: &Connection, timestamp: DateTime<Utc>) -> Result<Sequence> {
    let sequence: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq_id), 0) FROM events WHERE timestamp < ?1",
            [format_timestamp(timestamp)],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(sequence as Sequence)
}

/// Run `f` against a shared connection on the blocking thread pool
///
/// Holding the connection mutex and waiting on `busy_timeout` must not
/// stall a runtime worker.
pub(crate) async fn blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock();
        f(&mut *guard)
    })
        .await
        .map_err(|e| AthanorError::Internal(format!("Task join error: {}", e)))?
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        token: &CancellationToken,
    ) -> Result<EventRange> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }
        let request = request.clone();
        blocking(&self.conn, move |conn| fetch_page_in(conn, &request)).await
    }

    async fn detect_high_water(
        &self,
        from: Sequence,
        token: &CancellationToken,
    ) -> Result<HighWaterProbe> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }
        blocking(&self.conn, move |conn| detect_high_water_in(conn, from)).await
    }

    async fn load_progress(&self, shard_name: &str) -> Result<Option<ShardState>> {
        let shard_name = shard_name.to_string();
        blocking(&self.conn, move |conn| load_progress_in(conn, &shard_name)).await
    }

    async fn all_progress(&self) -> Result<Vec<ShardState>> {
        blocking(&self.conn, |conn| all_progress_in(conn)).await
    }

    async fn commit_progress_and_writes(
        &self,
        commit: ShardCommit,
        token: &CancellationToken,
    ) -> Result<CommitOutcome> {
        if token.is_cancelled() {
            return Err(AthanorError::Cancelled);
        }
        // once handed to the pool the transaction runs to completion
        blocking(&self.conn, move |conn| commit_in(conn, &commit)).await
    }

    async fn reset_progress(
        &self,
        shard_name: &str,
        database: &str,
        sequence: Sequence,
        teardown: &[String],
    ) -> Result<()> {
        let shard_name = shard_name.to_string();
        let database = database.to_string();
        let teardown = teardown.to_vec();
        blocking(&self.conn, move |conn| {
            reset_progress_in(conn, &shard_name, &database, sequence, &teardown)
        })
        .await
    }

    async fn append_dead_letter(&self, record: DeadLetterEvent) -> Result<()> {
        blocking(&self.conn, move |conn| insert_dead_letter(conn, &record)).await
    }

    async fn dead_letters(
        &self,
        shard_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEvent>> {
        let shard_name = shard_name.map(str::to_string);
        blocking(&self.conn, move |conn| {
            dead_letters_in(conn, shard_name.as_deref(), limit)
        })
        .await
    }

    async fn sequence_before(&self, timestamp: DateTime<Utc>) -> Result<Sequence> {
        blocking(&self.conn, move |conn| sequence_before_in(conn, timestamp)).await
    }
}
