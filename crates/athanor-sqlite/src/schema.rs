use athanor_core::error::{AthanorError, Result};
use rusqlite::Connection;

/// Current schema version recorded in `athanor_meta`
pub const SCHEMA_VERSION: u32 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS athanor_meta (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    schema_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS event_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    last_reserved INTEGER NOT NULL
);
INSERT OR IGNORE INTO event_sequence (id, last_reserved) VALUES (0, 0);

CREATE TABLE IF NOT EXISTS streams (
    stream_id TEXT PRIMARY KEY,
    stream_type TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
    seq_id INTEGER PRIMARY KEY,
    stream_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    metadata TEXT NOT NULL,
    tenant_id TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp);

CREATE TABLE IF NOT EXISTS progression (
    name TEXT PRIMARY KEY,
    last_seq_id INTEGER NOT NULL,
    database_name TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shard_name TEXT NOT NULL,
    projection_name TEXT NOT NULL,
    event_sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    exception_type TEXT NOT NULL,
    exception_message TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_shard ON dead_letters (shard_name);

CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS daemon_leases (
    lock_id INTEGER PRIMARY KEY,
    leased_by TEXT NOT NULL,
    lease_until INTEGER NOT NULL
);
";

/// Create all tables if missing and record the schema version
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(DDL)
        .map_err(|e| AthanorError::Storage(e.to_string()))?;

    conn.execute(
        "INSERT OR IGNORE INTO athanor_meta (id, schema_version) VALUES (0, ?1)",
        [SCHEMA_VERSION as i64],
    )
    .map_err(|e| AthanorError::Storage(e.to_string()))?;

    let version = schema_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(AthanorError::InvalidState(format!(
            "Database schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn
        .query_row(
            "SELECT schema_version FROM athanor_meta WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .map_err(|e| AthanorError::Storage(e.to_string()))?;

    Ok(version as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let reserved: i64 = conn
            .query_row("SELECT last_reserved FROM event_sequence", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(reserved, 0);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("UPDATE athanor_meta SET schema_version = 99", [])
            .unwrap();
        assert!(matches!(
            init_schema(&conn),
            Err(AthanorError::InvalidState(_))
        ));
    }
}
