//! Concurrency-safe priority queue of execution requests.
//!
//! Jobs dequeue by numeric priority (1 = Critical first), then creation time,
//! then insertion order. Every status change is a conditional update on the
//! expected prior status, so exactly one caller wins a claim and a terminal
//! status is written once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cv_core::store::{JobTiming, Store};
use cv_core::types::{Job, JobPriority, JobStatus, DEFAULT_JOB_TIMEOUT_SECS};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Window for the rolling wait/run averages in [`QueueStatus`].
const STATUS_WINDOW_SECS: i64 = 60 * 60;

/// What to enqueue.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    /// Falls back to the queue's default timeout.
    pub timeout_secs: Option<u64>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            timeout_secs: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// How [`JobQueue::wait_for`] ended.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The job reached a terminal status.
    Finished(Job),
    /// The wait elapsed first; carries the job as last seen.
    TimedOut(Job),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending_by_type: BTreeMap<String, u64>,
    pub running: Vec<Job>,
    /// Mean `started_at - created_at` over jobs started in the last hour.
    pub avg_wait_secs: Option<f64>,
    /// Mean `completed_at - started_at` over jobs completed in the last hour.
    pub avg_run_secs: Option<f64>,
}

pub struct JobQueue {
    store: Arc<Store>,
    default_timeout_secs: u64,
    /// Cancellation tokens of jobs a worker is executing right now.
    inflight: DashMap<Uuid, CancellationToken>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_default_timeout(store, DEFAULT_JOB_TIMEOUT_SECS)
    }

    pub fn with_default_timeout(store: Arc<Store>, default_timeout_secs: u64) -> Self {
        Self {
            store,
            default_timeout_secs,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Enqueue / dequeue
    // -----------------------------------------------------------------------

    /// Create a pending job. Its `position_at_creation` is the pending count
    /// at insert time.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job> {
        let job = self.build(request)?;
        let job = self.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = ?job.priority,
            position = job.position_at_creation,
            "job enqueued"
        );
        Ok(job)
    }

    /// Like [`enqueue`](Self::enqueue), but returns the existing pending or
    /// running job holding `dedupe_key` instead of creating a second one.
    /// The flag is `true` when a new job was created.
    pub async fn enqueue_unique(&self, request: JobRequest, dedupe_key: &str) -> Result<(Job, bool)> {
        if dedupe_key.trim().is_empty() {
            return Err(QueueError::InvalidInput("dedupe key must not be empty".into()));
        }
        let mut job = self.build(request)?;
        job.dedupe_key = Some(dedupe_key.to_string());
        let (job, created) = self.store.insert_job_unique(&job).await?;
        if created {
            info!(job_id = %job.id, job_type = %job.job_type, dedupe_key, "job enqueued");
        } else {
            debug!(job_id = %job.id, dedupe_key, status = %job.status, "job already queued");
        }
        Ok((job, created))
    }

    /// The pending job that should run next, optionally restricted to `types`.
    pub async fn dequeue_next(&self, types: Option<&[String]>) -> Result<Option<Job>> {
        Ok(self
            .store
            .next_pending_job(types.map(<[String]>::to_vec))
            .await?)
    }

    /// Atomically move a pending job to running for `worker_id`.
    pub async fn claim(&self, id: Uuid, worker_id: &str) -> Result<Job> {
        if self.store.claim_job(id, worker_id, Utc::now()).await? {
            debug!(job_id = %id, worker = worker_id, "job claimed");
            return self.get(id).await;
        }
        // Lost the race, or the job is not pending at all.
        match self.store.get_job(id).await? {
            Some(_) => Err(QueueError::AlreadyClaimed(id)),
            None => Err(QueueError::NotFound(id)),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    pub async fn complete(&self, id: Uuid, result: serde_json::Value) -> Result<Job> {
        let job = self
            .finish(id, JobStatus::Running, JobStatus::Completed, Some(result), None, "complete")
            .await?;
        self.inflight.remove(&id);
        Ok(job)
    }

    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<Job> {
        let job = self
            .finish(id, JobStatus::Running, JobStatus::Failed, None, Some(error.into()), "fail")
            .await?;
        self.inflight.remove(&id);
        Ok(job)
    }

    /// Cancel a job that has not been claimed yet.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self
            .finish(id, JobStatus::Pending, JobStatus::Cancelled, None, None, "cancel")
            .await?;
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    /// Fail a running job and preempt its executor.
    pub async fn force_kill(&self, id: Uuid, reason: &str) -> Result<Job> {
        let job = self
            .finish(
                id,
                JobStatus::Running,
                JobStatus::Failed,
                None,
                Some(format!("force killed: {reason}")),
                "force kill",
            )
            .await?;
        self.cancel_inflight(id);
        warn!(job_id = %id, reason, "job force killed");
        Ok(job)
    }

    /// Time out every running job that has outlived its timeout at `now`.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let running = self.store.list_jobs_by_status(JobStatus::Running).await?;
        let mut timed_out = Vec::new();
        for job in running.into_iter().filter(|j| j.is_overdue(now)) {
            let error = format!("timed out after {}s", job.timeout_secs);
            let changed = self
                .store
                .finish_job(job.id, JobStatus::Running, JobStatus::Timeout, None, Some(error), now)
                .await?;
            if !changed {
                // Finished between the scan and the update.
                continue;
            }
            self.cancel_inflight(job.id);
            warn!(job_id = %job.id, job_type = %job.job_type, timeout_secs = job.timeout_secs, "job timed out");
            timed_out.push(self.get(job.id).await?);
        }
        Ok(timed_out)
    }

    /// Delete terminal jobs that completed more than `max_age` ago.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| QueueError::InvalidInput(format!("max age out of range: {e}")))?;
        let removed = self
            .store
            .delete_terminal_jobs_before(Utc::now() - max_age)
            .await?;
        if removed > 0 {
            info!(removed, "stale jobs cleaned up");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.store.get_job(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// 1-based dequeue position of a pending job.
    pub async fn position(&self, id: Uuid) -> Result<Option<u64>> {
        Ok(self.store.pending_position(id).await?)
    }

    /// Finished-but-not-completed jobs for a dedupe key.
    pub async fn attempts(&self, dedupe_key: &str) -> Result<u64> {
        Ok(self
            .store
            .count_jobs_by_key(
                dedupe_key,
                &[JobStatus::Failed, JobStatus::Timeout, JobStatus::Cancelled],
            )
            .await?)
    }

    /// Poll until the job is terminal or `timeout` elapses.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration, poll_interval: Duration) -> Result<WaitOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get(id).await?;
            if job.status.is_terminal() {
                return Ok(WaitOutcome::Finished(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut(job));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let since = Utc::now() - chrono::Duration::seconds(STATUS_WINDOW_SECS);
        let pending_by_type = self.store.pending_counts_by_type().await?;
        let running = self.store.list_jobs_by_status(JobStatus::Running).await?;
        let timings = self.store.job_timings_since(since).await?;
        Ok(QueueStatus {
            pending_by_type,
            running,
            avg_wait_secs: average_secs(&timings, since, |t| {
                t.started_at.map(|s| (s, s - t.created_at))
            }),
            avg_run_secs: average_secs(&timings, since, |t| match (t.started_at, t.completed_at) {
                (Some(s), Some(c)) => Some((c, c - s)),
                _ => None,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // In-flight cancellation tokens
    // -----------------------------------------------------------------------

    /// Register the token a worker passes to the executor for `id`. Returns
    /// `false`, leaving the existing token in place, when another worker in
    /// this process already holds one.
    pub fn register_inflight(&self, id: Uuid, token: CancellationToken) -> bool {
        match self.inflight.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    pub fn release_inflight(&self, id: Uuid) {
        self.inflight.remove(&id);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    fn cancel_inflight(&self, id: Uuid) {
        if let Some((_, token)) = self.inflight.remove(&id) {
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn build(&self, request: JobRequest) -> Result<Job> {
        if request.job_type.trim().is_empty() {
            return Err(QueueError::InvalidInput("job type must not be empty".into()));
        }
        let timeout = request.timeout_secs.unwrap_or(self.default_timeout_secs);
        if timeout == 0 {
            return Err(QueueError::InvalidInput("job timeout must be greater than 0".into()));
        }
        Ok(Job::new(request.job_type, request.payload, request.priority, timeout))
    }

    async fn finish(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        operation: &'static str,
    ) -> Result<Job> {
        if self
            .store
            .finish_job(id, from, to, result, error, Utc::now())
            .await?
        {
            return self.get(id).await;
        }
        let job = self.get(id).await?;
        Err(QueueError::InvalidState {
            id,
            status: job.status,
            operation,
        })
    }
}

/// Mean of the durations selected by `pick`, counting only entries whose
/// anchor timestamp falls at or after `since`.
fn average_secs<F>(timings: &[JobTiming], since: DateTime<Utc>, pick: F) -> Option<f64>
where
    F: Fn(&JobTiming) -> Option<(DateTime<Utc>, chrono::Duration)>,
{
    let samples: Vec<f64> = timings
        .iter()
        .filter_map(&pick)
        .filter(|(anchor, _)| *anchor >= since)
        .map(|(_, d)| d.num_milliseconds() as f64 / 1000.0)
        .collect();
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
