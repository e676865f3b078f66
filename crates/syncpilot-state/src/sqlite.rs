//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are stored
//! as RFC 3339 strings with millisecond precision and come from an injectable
//! [`Clock`] so schedules can be tested against a frozen time.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection as SqliteConnection, OptionalExtension, Row};
use syncpilot_types::{
    system_clock, AttemptFailureSummary, AttemptNumber, AttemptRecord, AttemptStatus, Clock,
    Connection, ConnectionId, ConnectionStatus, JobId, JobKind, JobRecord, JobStatus,
    RetryCounters, SyncStats,
};

use crate::backend::{AttemptLogLine, StateBackend};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    scheduled INTEGER NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    stats_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_connection ON jobs (connection_id, id);

CREATE TABLE IF NOT EXISTS attempts (
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    records_emitted INTEGER NOT NULL DEFAULT 0,
    records_committed INTEGER NOT NULL DEFAULT 0,
    bytes_emitted INTEGER NOT NULL DEFAULT 0,
    bytes_committed INTEGER NOT NULL DEFAULT 0,
    failure_summary_json TEXT,
    created_at TEXT NOT NULL,
    ended_at TEXT,
    PRIMARY KEY (job_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS attempt_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    logged_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempt_logs_attempt ON attempt_logs (job_id, attempt_number);

CREATE TABLE IF NOT EXISTS retry_states (
    connection_id TEXT NOT NULL,
    job_id INTEGER NOT NULL,
    successive_complete_failures INTEGER NOT NULL,
    total_complete_failures INTEGER NOT NULL,
    successive_partial_failures INTEGER NOT NULL,
    total_partial_failures INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, job_id)
);

CREATE TABLE IF NOT EXISTS stream_resets (
    connection_id TEXT NOT NULL,
    stream TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, stream)
);

CREATE TABLE IF NOT EXISTS run_requests (
    connection_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const JOB_COLUMNS: &str = "id, connection_id, kind, scheduled, status, failure_reason, \
                           stats_json, created_at, updated_at, started_at";

const ATTEMPT_COLUMNS: &str = "job_id, attempt_number, status, records_emitted, \
                               records_committed, bytes_emitted, bytes_committed, \
                               failure_summary_json, created_at, ended_at";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<SqliteConnection>,
    clock: Clock,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = SqliteConnection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self { conn: Mutex::new(conn), clock: system_clock() })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self { conn: Mutex::new(conn), clock: system_clock() })
    }

    /// Replace the clock used to stamp rows.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, SqliteConnection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn now(&self) -> String {
        format_ts((self.clock)())
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> error::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct JobRow {
    id: i64,
    connection_id: String,
    kind: String,
    scheduled: bool,
    status: String,
    failure_reason: Option<String>,
    stats_json: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            connection_id: row.get(1)?,
            kind: row.get(2)?,
            scheduled: row.get(3)?,
            status: row.get(4)?,
            failure_reason: row.get(5)?,
            stats_json: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            started_at: row.get(9)?,
        })
    }

    fn into_record(self) -> error::Result<JobRecord> {
        let connection_id = self
            .connection_id
            .parse()
            .map_err(|e| StateError::Corrupt(format!("job {} connection id: {e}", self.id)))?;
        let kind = JobKind::parse(&self.kind)
            .ok_or_else(|| StateError::Corrupt(format!("job {} kind {:?}", self.id, self.kind)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StateError::Corrupt(format!("job {} status {:?}", self.id, self.status)))?;
        let stats = self
            .stats_json
            .as_deref()
            .map(serde_json::from_str::<SyncStats>)
            .transpose()?;
        Ok(JobRecord {
            id: self.id,
            connection_id,
            kind,
            scheduled: self.scheduled,
            status,
            failure_reason: self.failure_reason,
            stats,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_opt_ts(self.started_at)?,
        })
    }
}

struct AttemptRow {
    job_id: i64,
    attempt_number: i64,
    status: String,
    stats: [i64; 4],
    failure_summary_json: Option<String>,
    created_at: String,
    ended_at: Option<String>,
}

impl AttemptRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            attempt_number: row.get(1)?,
            status: row.get(2)?,
            stats: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
            failure_summary_json: row.get(7)?,
            created_at: row.get(8)?,
            ended_at: row.get(9)?,
        })
    }

    fn into_record(self) -> error::Result<AttemptRecord> {
        let status = AttemptStatus::parse(&self.status).ok_or_else(|| {
            StateError::Corrupt(format!(
                "attempt {}/{} status {:?}",
                self.job_id, self.attempt_number, self.status
            ))
        })?;
        let failure_summary = self
            .failure_summary_json
            .as_deref()
            .map(serde_json::from_str::<AttemptFailureSummary>)
            .transpose()?;
        Ok(AttemptRecord {
            job_id: self.job_id,
            attempt_number: to_u32(self.attempt_number),
            status,
            stats: SyncStats {
                records_emitted: to_u64(self.stats[0]),
                records_committed: to_u64(self.stats[1]),
                bytes_emitted: to_u64(self.stats[2]),
                bytes_committed: to_u64(self.stats[3]),
            },
            failure_summary,
            created_at: parse_ts(&self.created_at)?,
            ended_at: parse_opt_ts(self.ended_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// StateBackend
// ---------------------------------------------------------------------------

impl StateBackend for SqliteStateBackend {
    fn upsert_connection(&self, connection: &Connection) -> error::Result<()> {
        let body = serde_json::to_string(connection)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO connections (id, body, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET body = ?2, updated_at = ?3",
            rusqlite::params![connection.id().to_string(), body, self.now()],
        )?;
        Ok(())
    }

    fn get_connection(&self, connection_id: ConnectionId) -> error::Result<Option<Connection>> {
        let conn = self.lock_conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM connections WHERE id = ?1",
                [connection_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.as_deref().map(serde_json::from_str).transpose()?)
    }

    fn list_connections(&self) -> error::Result<Vec<Connection>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT body FROM connections ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StateError::from))
            .collect()
    }

    fn set_connection_status(
        &self,
        connection_id: ConnectionId,
        status: ConnectionStatus,
    ) -> error::Result<()> {
        let mut connection = self
            .get_connection(connection_id)?
            .ok_or(StateError::UnknownConnection(connection_id))?;
        connection.status = status;
        connection.updated_at = Some((self.clock)());
        self.upsert_connection(&connection)
    }

    fn create_job(
        &self,
        connection_id: ConnectionId,
        kind: JobKind,
        scheduled: bool,
    ) -> error::Result<JobId> {
        let conn = self.lock_conn()?;
        let now = self.now();
        conn.execute(
            "INSERT INTO jobs (connection_id, kind, scheduled, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![
                connection_id.to_string(),
                kind.as_str(),
                scheduled,
                JobStatus::Pending.as_str(),
                now,
            ],
        )
        .map_err(|e| StateError::context("create_job: insert", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_job(&self, job_id: JobId) -> error::Result<Option<JobRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [job_id],
                JobRow::read,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    fn list_jobs(&self, connection_id: ConnectionId) -> error::Result<Vec<JobRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE connection_id = ?1 ORDER BY id DESC"
        ))?;
        let rows = stmt
            .query_map([connection_id.to_string()], JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, failure_reason = COALESCE(?2, failure_reason), \
             updated_at = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), failure_reason, self.now(), job_id],
        )?;
        if changed == 0 {
            return Err(StateError::UnknownJob(job_id));
        }
        Ok(())
    }

    fn mark_job_started(&self, job_id: JobId) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE jobs SET started_at = COALESCE(started_at, ?1) WHERE id = ?2",
            rusqlite::params![self.now(), job_id],
        )?;
        Ok(())
    }

    fn set_job_stats(&self, job_id: JobId, stats: &SyncStats) -> error::Result<()> {
        let json = serde_json::to_string(stats)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE jobs SET stats_json = ?1 WHERE id = ?2",
            rusqlite::params![json, job_id],
        )?;
        Ok(())
    }

    fn create_attempt(&self, job_id: JobId) -> error::Result<AttemptNumber> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("create_attempt: begin tx", e))?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM jobs WHERE id = ?1", [job_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StateError::UnknownJob(job_id));
        }
        let next: i64 = tx.query_row(
            "SELECT COUNT(*) FROM attempts WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        let now = self.now();
        tx.execute(
            "INSERT INTO attempts (job_id, attempt_number, status, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![job_id, next, AttemptStatus::Running.as_str(), now],
        )
        .map_err(|e| StateError::context("create_attempt: insert", e))?;
        tx.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![JobStatus::Running.as_str(), now, job_id],
        )?;
        tx.commit()
            .map_err(|e| StateError::context("create_attempt: commit", e))?;
        Ok(to_u32(next))
    }

    fn get_attempt(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
    ) -> error::Result<Option<AttemptRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE job_id = ?1 AND attempt_number = ?2"
                ),
                rusqlite::params![job_id, attempt_number],
                AttemptRow::read,
            )
            .optional()?;
        row.map(AttemptRow::into_record).transpose()
    }

    fn list_attempts(&self, job_id: JobId) -> error::Result<Vec<AttemptRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE job_id = ?1 ORDER BY attempt_number"
        ))?;
        let rows = stmt
            .query_map([job_id], AttemptRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(AttemptRow::into_record).collect()
    }

    fn finish_attempt(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
        status: AttemptStatus,
        stats: Option<&SyncStats>,
        failure_summary: Option<&AttemptFailureSummary>,
    ) -> error::Result<()> {
        let summary_json = failure_summary.map(serde_json::to_string).transpose()?;
        let stats = stats.copied().unwrap_or_default();
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE attempts SET status = ?1, records_emitted = ?2, records_committed = ?3, \
             bytes_emitted = ?4, bytes_committed = ?5, \
             failure_summary_json = COALESCE(?6, failure_summary_json), ended_at = ?7 \
             WHERE job_id = ?8 AND attempt_number = ?9",
            rusqlite::params![
                status.as_str(),
                to_i64(stats.records_emitted),
                to_i64(stats.records_committed),
                to_i64(stats.bytes_emitted),
                to_i64(stats.bytes_committed),
                summary_json,
                self.now(),
                job_id,
                attempt_number,
            ],
        )
        .map_err(|e| StateError::context("finish_attempt: update", e))?;
        Ok(())
    }

    fn append_attempt_log(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
        level: &str,
        message: &str,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO attempt_logs (job_id, attempt_number, level, message, logged_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![job_id, attempt_number, level, message, self.now()],
        )?;
        Ok(())
    }

    fn attempt_logs(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
    ) -> error::Result<Vec<AttemptLogLine>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT level, message, logged_at FROM attempt_logs \
             WHERE job_id = ?1 AND attempt_number = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, attempt_number], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(level, message, logged_at)| {
                Ok(AttemptLogLine { level, message, logged_at: parse_ts(&logged_at)? })
            })
            .collect()
    }

    fn get_retry_counters(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
    ) -> error::Result<Option<RetryCounters>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT successive_complete_failures, total_complete_failures, \
             successive_partial_failures, total_partial_failures \
             FROM retry_states WHERE connection_id = ?1 AND job_id = ?2",
            rusqlite::params![connection_id.to_string(), job_id],
            read_counters,
        )
        .optional()
        .map_err(StateError::from)
    }

    fn put_retry_counters(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
        counters: &RetryCounters,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO retry_states (connection_id, job_id, successive_complete_failures, \
             total_complete_failures, successive_partial_failures, total_partial_failures, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(connection_id, job_id) DO UPDATE SET \
             successive_complete_failures = ?3, total_complete_failures = ?4, \
             successive_partial_failures = ?5, total_partial_failures = ?6, updated_at = ?7",
            rusqlite::params![
                connection_id.to_string(),
                job_id,
                counters.successive_complete_failures,
                counters.total_complete_failures,
                counters.successive_partial_failures,
                counters.total_partial_failures,
                self.now(),
            ],
        )?;
        Ok(())
    }

    fn latest_retry_counters(
        &self,
        connection_id: ConnectionId,
    ) -> error::Result<Option<(JobId, RetryCounters)>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT successive_complete_failures, total_complete_failures, \
             successive_partial_failures, total_partial_failures, job_id \
             FROM retry_states WHERE connection_id = ?1 \
             ORDER BY updated_at DESC, job_id DESC LIMIT 1",
            [connection_id.to_string()],
            |row| Ok((row.get::<_, i64>(4)?, read_counters(row)?)),
        )
        .optional()
        .map_err(StateError::from)
    }

    fn add_stream_resets(&self, connection_id: ConnectionId, streams: &[String]) -> error::Result<()> {
        if streams.is_empty() {
            return Ok(());
        }
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("add_stream_resets: begin tx", e))?;
        let now = self.now();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO stream_resets (connection_id, stream, created_at) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for stream in streams {
                stmt.execute(rusqlite::params![connection_id.to_string(), stream, now])?;
            }
        }
        tx.commit()
            .map_err(|e| StateError::context("add_stream_resets: commit", e))?;
        Ok(())
    }

    fn pending_stream_resets(&self, connection_id: ConnectionId) -> error::Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT stream FROM stream_resets WHERE connection_id = ?1 ORDER BY stream",
        )?;
        let streams = stmt
            .query_map([connection_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(streams)
    }

    fn delete_stream_resets(&self, connection_id: ConnectionId) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM stream_resets WHERE connection_id = ?1",
            [connection_id.to_string()],
        )?;
        Ok(removed as u64)
    }

    fn save_run_request(&self, connection_id: ConnectionId, payload: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO run_requests (connection_id, payload, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(connection_id) DO UPDATE SET payload = ?2, updated_at = ?3",
            rusqlite::params![connection_id.to_string(), payload, self.now()],
        )?;
        Ok(())
    }

    fn load_run_request(&self, connection_id: ConnectionId) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT payload FROM run_requests WHERE connection_id = ?1",
            [connection_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StateError::from)
    }
}

fn read_counters(row: &Row<'_>) -> rusqlite::Result<RetryCounters> {
    Ok(RetryCounters {
        successive_complete_failures: row.get(0)?,
        total_complete_failures: row.get(1)?,
        successive_partial_failures: row.get(2)?,
        total_partial_failures: row.get(3)?,
    })
}
