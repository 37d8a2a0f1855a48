//! `SQLite`-backed implementation of [`StateApi`] and [`AttemptApi`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use syncledger_types::state::{StateType, StateWrapper, StreamStateEntry};
use syncledger_types::stats::{SaveStatsRequest, StreamSyncStats, SyncStats};
use syncledger_types::stream::{AttemptContext, ConnectionId, StreamKey};

use crate::api::{AttemptApi, StateApi};
use crate::error::{self, StateError};

/// Key used for the single row of GLOBAL and LEGACY documents.
const WHOLE_DOCUMENT_KEY: &str = "";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connection_states (
    connection_id TEXT NOT NULL,
    stream_key TEXT NOT NULL,
    state_type TEXT NOT NULL,
    state_json TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, stream_key)
);

CREATE TABLE IF NOT EXISTS attempt_stats (
    job_id INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    records_emitted INTEGER NOT NULL,
    bytes_emitted INTEGER NOT NULL,
    records_committed INTEGER,
    bytes_committed INTEGER,
    records_rejected INTEGER NOT NULL DEFAULT 0,
    estimated_records INTEGER,
    estimated_bytes INTEGER,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS attempt_stream_stats (
    job_id INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    stream_key TEXT NOT NULL,
    records_emitted INTEGER NOT NULL,
    bytes_emitted INTEGER NOT NULL,
    records_committed INTEGER,
    bytes_committed INTEGER,
    records_rejected INTEGER NOT NULL DEFAULT 0,
    estimated_records INTEGER,
    estimated_bytes INTEGER,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_id, attempt_number, stream_key)
);
";

/// `SQLite`-backed connection state and attempt stats storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence
/// or [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read back the stats stored for an attempt.
    ///
    /// Stream rows are ordered by stream key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure or an undecodable row.
    pub fn get_attempt_stats(
        &self,
        attempt: AttemptContext,
    ) -> error::Result<Option<SaveStatsRequest>> {
        let conn = self.lock_conn()?;
        let stats = conn
            .query_row(
                "SELECT records_emitted, bytes_emitted, records_committed, bytes_committed, \
                 estimated_records, estimated_bytes, records_rejected \
                 FROM attempt_stats WHERE job_id = ?1 AND attempt_number = ?2",
                rusqlite::params![attempt.job_id, attempt.attempt_number],
                |row| stats_from_row(row, 0),
            )
            .optional()
            .map_err(|e| StateError::sqlite_context("get_attempt_stats: totals", e))?;
        let Some(stats) = stats else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT stream_key, records_emitted, bytes_emitted, records_committed, \
                 bytes_committed, estimated_records, estimated_bytes, records_rejected \
                 FROM attempt_stream_stats WHERE job_id = ?1 AND attempt_number = ?2",
            )
            .map_err(|e| StateError::sqlite_context("get_attempt_stats: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![attempt.job_id, attempt.attempt_number],
                |row| Ok((row.get::<_, String>(0)?, stats_from_row(row, 1)?)),
            )
            .map_err(|e| StateError::sqlite_context("get_attempt_stats: streams", e))?;

        let mut stream_stats = Vec::new();
        for row in rows {
            let (key, stats) = row?;
            let stream: StreamKey = serde_json::from_str(&key)?;
            stream_stats.push(StreamSyncStats { stream, stats });
        }
        stream_stats.sort_by(|a, b| a.stream.cmp(&b.stream));

        Ok(Some(SaveStatsRequest {
            attempt,
            stats,
            stream_stats,
        }))
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Current UTC time as RFC 3339.
    fn now_rfc3339() -> String {
        Utc::now().to_rfc3339()
    }

    #[cfg(test)]
    fn state_row_count(&self, connection: &ConnectionId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM connection_states WHERE connection_id = ?1",
            [connection.as_str()],
            |row| row.get(0),
        )?)
    }
}

#[allow(clippy::cast_sign_loss)]
fn stats_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<SyncStats> {
    let opt = |idx: usize| -> rusqlite::Result<Option<u64>> {
        Ok(row.get::<_, Option<i64>>(offset + idx)?.map(|v| v as u64))
    };
    Ok(SyncStats {
        records_emitted: row.get::<_, i64>(offset)? as u64,
        bytes_emitted: row.get::<_, i64>(offset + 1)? as u64,
        records_committed: opt(2)?,
        bytes_committed: opt(3)?,
        records_rejected: row.get::<_, i64>(offset + 6)? as u64,
        estimated_records: opt(4)?,
        estimated_bytes: opt(5)?,
    })
}

#[allow(clippy::cast_possible_wrap)]
fn to_sql_opt(value: Option<u64>) -> Option<i64> {
    value.map(|v| v as i64)
}

impl StateApi for SqliteStateStore {
    fn get_state(&self, connection: &ConnectionId) -> error::Result<Option<StateWrapper>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stream_key, state_type, state_json \
                 FROM connection_states WHERE connection_id = ?1",
            )
            .map_err(|e| StateError::sqlite_context("get_state: prepare", e))?;
        let rows = stmt
            .query_map([connection.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| StateError::sqlite_context("get_state: query", e))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let Some((_, first_type, _)) = rows.first() else {
            return Ok(None);
        };
        let state_type = StateType::parse(first_type)
            .ok_or_else(|| StateError::Corrupt(format!("unknown state type {first_type:?}")))?;
        if rows.iter().any(|(_, ty, _)| ty != first_type) {
            return Err(StateError::Corrupt(format!(
                "connection {connection} mixes state types"
            )));
        }

        match state_type {
            StateType::Stream => {
                let mut streams = Vec::with_capacity(rows.len());
                for (key, _, json) in rows {
                    let descriptor: StreamKey = serde_json::from_str(&key)?;
                    let state: Option<serde_json::Value> =
                        json.as_deref().map(serde_json::from_str).transpose()?;
                    streams.push(StreamStateEntry::new(descriptor, state));
                }
                streams.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
                Ok(Some(StateWrapper::Stream { streams }))
            }
            StateType::Global | StateType::Legacy => {
                let (_, _, json) = &rows[0];
                let json = json.as_deref().ok_or_else(|| {
                    StateError::Corrupt(format!("{state_type} state for {connection} is null"))
                })?;
                Ok(Some(serde_json::from_str(json)?))
            }
        }
    }

    fn create_or_update_state(
        &self,
        connection: &ConnectionId,
        state: &StateWrapper,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let now = Self::now_rfc3339();
        let state_type = state.state_type();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::sqlite_context("create_or_update_state: begin tx", e))?;

        // A shape change replaces whatever was stored before.
        tx.execute(
            "DELETE FROM connection_states WHERE connection_id = ?1 AND state_type <> ?2",
            rusqlite::params![connection.as_str(), state_type.as_str()],
        )
        .map_err(|e| StateError::sqlite_context("create_or_update_state: clear", e))?;

        match state {
            StateWrapper::Stream { streams } => {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO connection_states \
                         (connection_id, stream_key, state_type, state_json, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5) \
                         ON CONFLICT(connection_id, stream_key) \
                         DO UPDATE SET state_json = ?4, updated_at = ?5",
                    )
                    .map_err(|e| StateError::sqlite_context("create_or_update_state: prepare", e))?;
                for entry in streams {
                    let key = serde_json::to_string(&entry.descriptor)?;
                    let json = entry.state.as_ref().map(serde_json::to_string).transpose()?;
                    stmt.execute(rusqlite::params![
                        connection.as_str(),
                        key,
                        state_type.as_str(),
                        json,
                        now,
                    ])
                    .map_err(|e| StateError::sqlite_context("create_or_update_state: upsert", e))?;
                }
            }
            StateWrapper::Global { .. } | StateWrapper::Legacy { .. } => {
                let json = serde_json::to_string(state)?;
                tx.execute(
                    "INSERT INTO connection_states \
                     (connection_id, stream_key, state_type, state_json, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(connection_id, stream_key) \
                     DO UPDATE SET state_json = ?4, updated_at = ?5",
                    rusqlite::params![
                        connection.as_str(),
                        WHOLE_DOCUMENT_KEY,
                        state_type.as_str(),
                        json,
                        now,
                    ],
                )
                .map_err(|e| StateError::sqlite_context("create_or_update_state: upsert", e))?;
            }
        }

        tx.commit()
            .map_err(|e| StateError::sqlite_context("create_or_update_state: commit", e))?;
        Ok(())
    }
}

impl AttemptApi for SqliteStateStore {
    #[allow(clippy::cast_possible_wrap)]
    fn save_stats(&self, request: &SaveStatsRequest) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let now = Self::now_rfc3339();
        let AttemptContext {
            job_id,
            attempt_number,
        } = request.attempt;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::sqlite_context("save_stats: begin tx", e))?;

        let totals = &request.stats;
        tx.execute(
            "INSERT INTO attempt_stats \
             (job_id, attempt_number, records_emitted, bytes_emitted, records_committed, \
              bytes_committed, estimated_records, estimated_bytes, updated_at, records_rejected) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(job_id, attempt_number) DO UPDATE SET \
             records_emitted = ?3, bytes_emitted = ?4, records_committed = ?5, \
             bytes_committed = ?6, estimated_records = ?7, estimated_bytes = ?8, updated_at = ?9, \
             records_rejected = ?10",
            rusqlite::params![
                job_id,
                attempt_number,
                totals.records_emitted as i64,
                totals.bytes_emitted as i64,
                to_sql_opt(totals.records_committed),
                to_sql_opt(totals.bytes_committed),
                to_sql_opt(totals.estimated_records),
                to_sql_opt(totals.estimated_bytes),
                now,
                totals.records_rejected as i64,
            ],
        )
        .map_err(|e| StateError::sqlite_context("save_stats: upsert totals", e))?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO attempt_stream_stats \
                 (job_id, attempt_number, stream_key, records_emitted, bytes_emitted, \
                  records_committed, bytes_committed, estimated_records, estimated_bytes, updated_at, \
                  records_rejected) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(job_id, attempt_number, stream_key) DO UPDATE SET \
                 records_emitted = ?4, bytes_emitted = ?5, records_committed = ?6, \
                 bytes_committed = ?7, estimated_records = ?8, estimated_bytes = ?9, \
                 updated_at = ?10, records_rejected = ?11",
            )
            .map_err(|e| StateError::sqlite_context("save_stats: prepare", e))?;
        for row in &request.stream_stats {
            let key = serde_json::to_string(&row.stream)?;
            let stats = &row.stats;
            stmt.execute(rusqlite::params![
                job_id,
                attempt_number,
                key,
                stats.records_emitted as i64,
                stats.bytes_emitted as i64,
                to_sql_opt(stats.records_committed),
                to_sql_opt(stats.bytes_committed),
                to_sql_opt(stats.estimated_records),
                to_sql_opt(stats.estimated_bytes),
                now,
                stats.records_rejected as i64,
            ])
            .map_err(|e| StateError::sqlite_context("save_stats: upsert stream", e))?;
        }
        drop(stmt);

        tx.commit()
            .map_err(|e| StateError::sqlite_context("save_stats: commit", e))?;
        Ok(())
    }
}
