//! Worker pool: long-lived tokio tasks that drain the [`JobQueue`].
//!
//! Each worker sweeps timeouts on its own interval, claims the next pending
//! job for its types, and runs the registered [`Executor`] under a
//! cancellation token. Whatever a worker finalizes itself is published on
//! the event channel; jobs finalized elsewhere (force kill, another sweep)
//! are left to whoever finalized them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use cv_core::config::WorkersConfig;
use cv_core::types::{ExecutionReport, Job};
use cv_telemetry::metrics::{global_metrics, names};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::queue::JobQueue;

/// Runs one job. Implementations should return promptly once `cancel` fires;
/// the worker drops the future regardless.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> anyhow::Result<ExecutionReport>;
}

/// Executors keyed by job type.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(job_type.into(), executor);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// `None` serves every job type.
    pub job_types: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkersConfig::default())
    }
}

impl From<&WorkersConfig> for WorkerConfig {
    fn from(cfg: &WorkersConfig) -> Self {
        Self {
            count: cfg.count,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            job_types: if cfg.job_types.is_empty() {
                None
            } else {
                Some(cfg.job_types.clone())
            },
        }
    }
}

/// A job that reached a terminal status in a worker.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Job,
    pub worker_id: String,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    events: flume::Sender<JobEvent>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: ExecutorRegistry,
        config: WorkerConfig,
        events: flume::Sender<JobEvent>,
    ) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
            events,
        }
    }

    /// Spawn `count` workers. They stop once `shutdown` is cancelled, failing
    /// whatever job they were running at the time.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.count)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{i}"),
                    queue: Arc::clone(&self.queue),
                    registry: Arc::clone(&self.registry),
                    config: self.config.clone(),
                    events: self.events.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    events: flume::Sender<JobEvent>,
    shutdown: CancellationToken,
}

enum Step {
    /// A job was handled (or lost to another worker); look again right away.
    Busy,
    Idle,
}

impl Worker {
    async fn run(self) {
        info!(worker = %self.id, "worker started");
        let mut last_sweep = Instant::now();

        while !self.shutdown.is_cancelled() {
            if last_sweep.elapsed() >= self.config.sweep_interval {
                last_sweep = Instant::now();
                self.sweep().await;
            }

            let step = match self.process_next().await {
                Ok(step) => step,
                Err(e) => {
                    error!(worker = %self.id, error = %e, "worker iteration failed");
                    Step::Idle
                }
            };

            if matches!(step, Step::Idle) {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    async fn sweep(&self) {
        match self.queue.sweep_timeouts(Utc::now()).await {
            Ok(jobs) => {
                for job in jobs {
                    self.record_finished(&job, None);
                    self.emit(job);
                }
            }
            Err(e) => warn!(worker = %self.id, error = %e, "timeout sweep failed"),
        }
    }

    async fn process_next(&self) -> Result<Step> {
        let Some(job) = self
            .queue
            .dequeue_next(self.config.job_types.as_deref())
            .await?
        else {
            return Ok(Step::Idle);
        };

        // Registered before the claim so a kill that lands right after it
        // still reaches this worker.
        let token = self.shutdown.child_token();
        if !self.queue.register_inflight(job.id, token.clone()) {
            global_metrics().increment_counter(names::JOB_CLAIM_CONFLICTS, &[]);
            debug!(worker = %self.id, job_id = %job.id, "job already held by another worker");
            return Ok(Step::Busy);
        }

        let job = match self.queue.claim(job.id, &self.id).await {
            Ok(job) => job,
            Err(QueueError::AlreadyClaimed(id)) => {
                self.queue.release_inflight(id);
                global_metrics().increment_counter(names::JOB_CLAIM_CONFLICTS, &[]);
                debug!(worker = %self.id, job_id = %id, "lost claim race");
                return Ok(Step::Busy);
            }
            Err(e) => {
                self.queue.release_inflight(job.id);
                return Err(e);
            }
        };
        global_metrics().increment_counter(names::JOBS_CLAIMED, &[("job_type", &job.job_type)]);
        info!(worker = %self.id, job_id = %job.id, job_type = %job.job_type, "job claimed");

        let Some(executor) = self.registry.get(&job.job_type) else {
            let msg = format!("no executor registered for job type '{}'", job.job_type);
            warn!(worker = %self.id, job_id = %job.id, "{msg}");
            self.finalize(job.id, Err(msg), None).await;
            self.queue.release_inflight(job.id);
            return Ok(Step::Busy);
        };

        let started = Instant::now();

        let mut handle = {
            let job = job.clone();
            let token = token.clone();
            tokio::spawn(async move { executor.execute(&job, token).await })
        };

        // Cancellation wins over a result that raced it, including a kill
        // that landed between the claim and the spawn.
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                handle.abort();
                None
            }
            joined = &mut handle => Some(joined),
        };

        let elapsed = Some(started.elapsed());
        match outcome {
            Some(Ok(Ok(report))) => match serde_json::to_value(&report) {
                Ok(value) => self.finalize(job.id, Ok(value), elapsed).await,
                Err(e) => {
                    self.finalize(job.id, Err(format!("unserializable report: {e}")), elapsed)
                        .await
                }
            },
            Some(Ok(Err(e))) => self.finalize(job.id, Err(format!("{e:#}")), elapsed).await,
            Some(Err(join_err)) => {
                let msg = if join_err.is_panic() {
                    format!("executor panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "executor task aborted".to_string()
                };
                self.finalize(job.id, Err(msg), elapsed).await;
            }
            None if self.shutdown.is_cancelled() => {
                self.finalize(job.id, Err("worker shut down".to_string()), elapsed)
                    .await;
            }
            None => {
                // Force kill or timeout sweep already recorded the outcome.
                debug!(worker = %self.id, job_id = %job.id, "job preempted");
            }
        }
        self.queue.release_inflight(job.id);
        Ok(Step::Busy)
    }

    /// Write the terminal status. Emits only when this worker's write won.
    async fn finalize(
        &self,
        id: uuid::Uuid,
        outcome: std::result::Result<serde_json::Value, String>,
        elapsed: Option<Duration>,
    ) {
        let written = match outcome {
            Ok(value) => self.queue.complete(id, value).await,
            Err(msg) => self.queue.fail(id, msg).await,
        };
        match written {
            Ok(job) => {
                info!(worker = %self.id, job_id = %job.id, status = %job.status, "job finished");
                self.record_finished(&job, elapsed);
                self.emit(job);
            }
            Err(QueueError::InvalidState { status, .. }) => {
                debug!(worker = %self.id, job_id = %id, %status, "job already finalized");
            }
            Err(e) => error!(worker = %self.id, job_id = %id, error = %e, "failed to record job outcome"),
        }
    }

    fn record_finished(&self, job: &Job, elapsed: Option<Duration>) {
        let metrics = global_metrics();
        metrics.increment_counter(
            names::JOBS_FINISHED,
            &[("job_type", &job.job_type), ("status", job.status.as_str())],
        );
        if let Some(elapsed) = elapsed {
            metrics.record_histogram(names::JOB_RUN_SECONDS, elapsed.as_secs_f64());
        }
    }

    fn emit(&self, job: Job) {
        let event = JobEvent {
            job,
            worker_id: self.id.clone(),
        };
        if self.events.send(event).is_err() {
            debug!(worker = %self.id, "job event receiver dropped");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
