use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use uuid::Uuid;

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql,
    uuid_from_sql, Store, StoreResult,
};
use crate::types::{Job, JobPriority, JobStatus};

const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, result, error,
    timeout_secs, created_at, started_at, completed_at, worker_id, position_at_creation,
    dedupe_key";

const ACTIVE_STATUSES: &str = "('pending', 'running')";
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'timeout')";

/// Timestamps of one job, used for rolling wait/run averages.
#[derive(Debug, Clone)]
pub struct JobTiming {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobRow {
    id: String,
    job_type: String,
    status: String,
    priority: i64,
    payload: String,
    timeout_secs: i64,
    created_at: String,
    dedupe_key: Option<String>,
}

impl JobRow {
    fn from_job(job: &Job) -> rusqlite::Result<Self> {
        Ok(Self {
            id: job.id.to_string(),
            job_type: job.job_type.clone(),
            status: enum_to_sql(&job.status)?,
            priority: job.priority.as_i64(),
            payload: job.payload.to_string(),
            timeout_secs: i64::try_from(job.timeout_secs).unwrap_or(i64::MAX),
            created_at: ts_to_sql(&job.created_at),
            dedupe_key: job.dedupe_key.clone(),
        })
    }

    /// Insert as a fresh pending job; returns the pending count seen before it.
    fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<u64> {
        let position: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, payload, timeout_secs,
                created_at, position_at_creation, dedupe_key)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                self.id,
                self.job_type,
                self.status,
                self.priority,
                self.payload,
                self.timeout_secs,
                self.created_at,
                position as i64,
                self.dedupe_key,
            ],
        )?;
        Ok(position)
    }
}

impl Store {
    // -----------------------------------------------------------------------
    // Job insert / lookup
    // -----------------------------------------------------------------------

    /// Insert a pending job. The returned job carries `position_at_creation`.
    pub async fn insert_job(&self, job: &Job) -> StoreResult<Job> {
        let row = JobRow::from_job(job)?;
        let mut job = job.clone();
        let position = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let position = row.insert(&tx)?;
                tx.commit()?;
                Ok(position)
            })
            .await?;
        job.position_at_creation = position;
        Ok(job)
    }

    /// Insert a pending job unless an active (pending or running) job already
    /// holds the same dedupe key. Returns the stored job and whether it is new.
    pub async fn insert_job_unique(&self, job: &Job) -> StoreResult<(Job, bool)> {
        let row = JobRow::from_job(job)?;
        let key = job.dedupe_key.clone();
        let mut fresh = job.clone();
        let existing = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(key) = &key {
                    let found = {
                        let mut stmt = tx.prepare(&format!(
                            "SELECT {JOB_COLUMNS} FROM jobs
                             WHERE dedupe_key = ?1 AND status IN {ACTIVE_STATUSES}
                             ORDER BY seq ASC LIMIT 1"
                        ))?;
                        let mut rows = stmt.query(rusqlite::params![key])?;
                        match rows.next()? {
                            Some(r) => Some(row_to_job(r)?),
                            None => None,
                        }
                    };
                    if let Some(existing) = found {
                        return Ok(Err(existing));
                    }
                }
                let position = row.insert(&tx)?;
                tx.commit()?;
                Ok(Ok(position))
            })
            .await?;

        match existing {
            Ok(position) => {
                fresh.position_at_creation = position;
                Ok((fresh, true))
            }
            Err(existing) => Ok((existing, false)),
        }
    }

    pub async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_job(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// The pending job that dequeues first: lowest priority value, then
    /// earliest creation, then insertion order. `types` restricts job types.
    pub async fn next_pending_job(&self, types: Option<Vec<String>>) -> StoreResult<Option<Job>> {
        self.conn
            .call(move |conn| {
                let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending'");
                let mut params: Vec<SqlValue> = Vec::new();
                if let Some(types) = types {
                    if types.is_empty() {
                        return Ok(None);
                    }
                    let marks = vec!["?"; types.len()].join(", ");
                    sql.push_str(&format!(" AND job_type IN ({marks})"));
                    params.extend(types.into_iter().map(SqlValue::Text));
                }
                sql.push_str(" ORDER BY priority ASC, created_at ASC, seq ASC LIMIT 1");

                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_job(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list_jobs_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        let status_str = enum_to_sql(&status)?;
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                     ORDER BY priority ASC, created_at ASC, seq ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![status_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_job(row)?);
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Conditional status changes
    // -----------------------------------------------------------------------

    /// Atomically move a job from pending to running.
    ///
    /// Returns `true` only for the single caller whose update matched a
    /// pending row.
    pub async fn claim_job(
        &self,
        id: Uuid,
        worker_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let worker_id = worker_id.to_string();
        let started_at = ts_to_sql(&started_at);
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET status = 'running', started_at = ?1, worker_id = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![started_at, worker_id, id_str],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Move a job from `from` to the terminal status `to`, recording its
    /// result or error. Returns `false` when the job was not in `from`.
    pub async fn finish_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let from_str = enum_to_sql(&from)?;
        let to_str = enum_to_sql(&to)?;
        let result = result.map(|v| v.to_string());
        let completed_at = ts_to_sql(&completed_at);
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET status = ?1, result = ?2, error = ?3, completed_at = ?4
                     WHERE id = ?5 AND status = ?6",
                    rusqlite::params![to_str, result, error, completed_at, id_str, from_str],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Queue introspection
    // -----------------------------------------------------------------------

    /// 1-based dequeue position of a pending job, `None` if it is not pending.
    pub async fn pending_position(&self, id: Uuid) -> StoreResult<Option<u64>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT priority, created_at, seq FROM jobs
                     WHERE id = ?1 AND status = 'pending'",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let priority: i64 = row.get(0)?;
                let created_at: String = row.get(1)?;
                let seq: i64 = row.get(2)?;

                let ahead: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = 'pending' AND (
                        priority < ?1
                        OR (priority = ?1 AND created_at < ?2)
                        OR (priority = ?1 AND created_at = ?2 AND seq < ?3))",
                    rusqlite::params![priority, created_at, seq],
                    |r| r.get(0),
                )?;
                Ok(Some(ahead + 1))
            })
            .await
    }

    /// Number of pending jobs per job type.
    pub async fn pending_counts_by_type(&self) -> StoreResult<BTreeMap<String, u64>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_type, COUNT(*) FROM jobs WHERE status = 'pending'
                     GROUP BY job_type",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = BTreeMap::new();
                while let Some(row) = rows.next()? {
                    out.insert(row.get::<_, String>(0)?, row.get::<_, u64>(1)?);
                }
                Ok(out)
            })
            .await
    }

    /// Timings of jobs started or completed at or after `since`.
    pub async fn job_timings_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<JobTiming>> {
        let since = ts_to_sql(&since);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT created_at, started_at, completed_at FROM jobs
                     WHERE started_at >= ?1 OR completed_at >= ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let created_at: String = row.get(0)?;
                    out.push(JobTiming {
                        created_at: ts_from_sql(0, &created_at)?,
                        started_at: opt_ts_from_sql(1, row.get(1)?)?,
                        completed_at: opt_ts_from_sql(2, row.get(2)?)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// How many jobs with `key` are currently in one of `statuses`.
    pub async fn count_jobs_by_key(&self, key: &str, statuses: &[JobStatus]) -> StoreResult<u64> {
        let key = key.to_string();
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(key)];
        for status in statuses {
            params.push(SqlValue::Text(enum_to_sql(status)?));
        }
        self.conn
            .call(move |conn| {
                if params.len() == 1 {
                    return Ok(0);
                }
                let marks = vec!["?"; params.len() - 1].join(", ");
                let sql = format!(
                    "SELECT COUNT(*) FROM jobs WHERE dedupe_key = ? AND status IN ({marks})"
                );
                let count: u64 = conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(params.iter()),
                    |r| r.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Permanently delete terminal jobs completed before `cutoff`.
    pub async fn delete_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = ts_to_sql(&cutoff);
        self.conn
            .call(move |conn| {
                let removed = conn.execute(
                    &format!(
                        "DELETE FROM jobs WHERE status IN {TERMINAL_STATUSES}
                         AND completed_at IS NOT NULL AND completed_at < ?1"
                    ),
                    rusqlite::params![cutoff],
                )?;
                Ok(removed)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let priority_val: i64 = row.get(3)?;
    let payload_str: String = row.get(4)?;
    let result_str: Option<String> = row.get(5)?;
    let timeout_secs: i64 = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let position: i64 = row.get(12)?;

    let priority = JobPriority::from_i64(priority_val).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            format!("job priority out of range: {priority_val}").into(),
        )
    })?;

    Ok(Job {
        id: uuid_from_sql(0, &id_str)?,
        job_type: row.get(1)?,
        status: enum_from_sql(2, &status_str)?,
        priority,
        payload: json_from_sql(4, &payload_str)?,
        result: result_str.map(|s| json_from_sql(5, &s)).transpose()?,
        error: row.get(6)?,
        timeout_secs: timeout_secs.max(0) as u64,
        created_at: ts_from_sql(8, &created_at_str)?,
        started_at: opt_ts_from_sql(9, row.get(9)?)?,
        completed_at: opt_ts_from_sql(10, row.get(10)?)?,
        worker_id: row.get(11)?,
        position_at_creation: position.max(0) as u64,
        dedupe_key: row.get(13)?,
    })
}
