//! Async SQLite-backed store for tasks, runs, reports, audit events and jobs.
//!
//! All access goes through a single [`tokio_rusqlite::Connection`], which
//! serialises statements on one background thread. Status changes that can
//! race (job claim, job completion, run transitions) are written as
//! conditional `UPDATE ... WHERE status = ?` statements and report whether
//! they took effect.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::AuditEvent;

mod jobs;
mod runs;
mod tasks;

pub use jobs::JobTiming;

pub type StoreResult<T> = std::result::Result<T, tokio_rusqlite::Error>;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id           TEXT PRIMARY KEY,
                        project      TEXT NOT NULL,
                        title        TEXT NOT NULL,
                        description  TEXT,
                        priority     INTEGER NOT NULL,
                        status       TEXT NOT NULL,
                        stage        TEXT NOT NULL,
                        blocked_by   TEXT NOT NULL,
                        completed    INTEGER NOT NULL DEFAULT 0,
                        completed_at TEXT,
                        created_at   TEXT NOT NULL,
                        updated_at   TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);

                    CREATE TABLE IF NOT EXISTS runs (
                        id         TEXT PRIMARY KEY,
                        project    TEXT NOT NULL,
                        title      TEXT NOT NULL,
                        state      TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS reports (
                        id         TEXT PRIMARY KEY,
                        run_id     TEXT NOT NULL,
                        role       TEXT NOT NULL,
                        status     TEXT NOT NULL,
                        summary    TEXT NOT NULL,
                        details    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_reports_run_role ON reports(run_id, role);

                    CREATE TABLE IF NOT EXISTS audit_events (
                        id          TEXT PRIMARY KEY,
                        timestamp   TEXT NOT NULL,
                        actor       TEXT NOT NULL,
                        action      TEXT NOT NULL,
                        entity_type TEXT NOT NULL,
                        entity_id   TEXT NOT NULL,
                        details     TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_id);

                    CREATE TABLE IF NOT EXISTS jobs (
                        seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
                        id                   TEXT NOT NULL UNIQUE,
                        job_type             TEXT NOT NULL,
                        status               TEXT NOT NULL,
                        priority             INTEGER NOT NULL,
                        payload              TEXT NOT NULL,
                        result               TEXT,
                        error                TEXT,
                        timeout_secs         INTEGER NOT NULL,
                        created_at           TEXT NOT NULL,
                        started_at           TEXT,
                        completed_at         TEXT,
                        worker_id            TEXT,
                        position_at_creation INTEGER NOT NULL DEFAULT 0,
                        dedupe_key           TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_jobs_dequeue
                        ON jobs(status, priority, created_at, seq);
                    CREATE INDEX IF NOT EXISTS idx_jobs_dedupe ON jobs(dedupe_key);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub async fn append_audit(&self, event: &AuditEvent) -> StoreResult<()> {
        let row = AuditRow::from_event(event)?;
        self.conn
            .call(move |conn| {
                row.insert(conn)?;
                Ok(())
            })
            .await
    }

    /// All audit events for one entity, oldest first.
    pub async fn audit_trail(&self, entity_id: Uuid) -> StoreResult<Vec<AuditEvent>> {
        let id_str = entity_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, actor, action, entity_type, entity_id, details
                     FROM audit_events WHERE entity_id = ?1
                     ORDER BY timestamp ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_audit(row)?);
                }
                Ok(out)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Audit row helpers
// ---------------------------------------------------------------------------

/// An audit event flattened to SQL values so it can move into a `call` closure.
pub(crate) struct AuditRow {
    id: String,
    timestamp: String,
    actor: String,
    action: String,
    entity_type: String,
    entity_id: String,
    details: String,
}

impl AuditRow {
    pub(crate) fn from_event(event: &AuditEvent) -> rusqlite::Result<Self> {
        Ok(Self {
            id: event.id.to_string(),
            timestamp: ts_to_sql(&event.timestamp),
            actor: event.actor.clone(),
            action: enum_to_sql(&event.action)?,
            entity_type: enum_to_sql(&event.entity_type)?,
            entity_id: event.entity_id.to_string(),
            details: event.details.to_string(),
        })
    }

    pub(crate) fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO audit_events (id, timestamp, actor, action, entity_type, entity_id, details)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                self.id,
                self.timestamp,
                self.actor,
                self.action,
                self.entity_type,
                self.entity_id,
                self.details,
            ],
        )?;
        Ok(())
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let id_str: String = row.get(0)?;
    let timestamp_str: String = row.get(1)?;
    let action_str: String = row.get(3)?;
    let entity_type_str: String = row.get(4)?;
    let entity_id_str: String = row.get(5)?;
    let details_str: String = row.get(6)?;

    Ok(AuditEvent {
        id: uuid_from_sql(0, &id_str)?,
        timestamp: ts_from_sql(1, &timestamp_str)?,
        actor: row.get(2)?,
        action: enum_from_sql(3, &action_str)?,
        entity_type: enum_from_sql(4, &entity_type_str)?,
        entity_id: uuid_from_sql(5, &entity_id_str)?,
        details: json_from_sql(6, &details_str)?,
    })
}

// ---------------------------------------------------------------------------
// helpers – values <-> SQLite
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: Serialize>(val: &T) -> rusqlite::Result<String> {
    match serde_json::to_value(val) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(rusqlite::Error::ToSqlConversionFailure(
            format!("expected a unit variant, got {other}").into(),
        )),
        Err(e) => Err(rusqlite::Error::ToSqlConversionFailure(Box::new(e))),
    }
}

pub(crate) fn enum_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| conversion_failure(idx, e))
}

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn opt_ts_from_sql(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| ts_from_sql(idx, &s)).transpose()
}

pub(crate) fn uuid_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn json_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn json_to_sql<T: Serialize>(val: &T) -> rusqlite::Result<String> {
    serde_json::to_string(val).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
