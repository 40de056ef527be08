use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cv_core::store::Store;
use cv_core::types::{ExecutionReport, Job, JobStatus, ReportStatus};
use cv_queue::{
    Executor, ExecutorRegistry, JobEvent, JobQueue, JobRequest, WaitOutcome, WorkerConfig,
    WorkerPool,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test executors
// ---------------------------------------------------------------------------

struct Passing;

#[async_trait]
impl Executor for Passing {
    async fn execute(&self, job: &Job, _cancel: CancellationToken) -> anyhow::Result<ExecutionReport> {
        Ok(ExecutionReport::pass(format!("ran {}", job.job_type)))
    }
}

struct Erroring;

#[async_trait]
impl Executor for Erroring {
    async fn execute(&self, _job: &Job, _cancel: CancellationToken) -> anyhow::Result<ExecutionReport> {
        Err(anyhow::anyhow!("compiler exploded").context("agent run"))
    }
}

struct Panicking;

#[async_trait]
impl Executor for Panicking {
    async fn execute(&self, _job: &Job, _cancel: CancellationToken) -> anyhow::Result<ExecutionReport> {
        panic!("executor bug");
    }
}

/// Runs until cancelled.
struct Hanging;

#[async_trait]
impl Executor for Hanging {
    async fn execute(&self, _job: &Job, cancel: CancellationToken) -> anyhow::Result<ExecutionReport> {
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                Ok(ExecutionReport::pass("never"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    queue: Arc<JobQueue>,
    events: flume::Receiver<JobEvent>,
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

async fn start(registry: ExecutorRegistry, sweep_interval: Duration) -> Harness {
    let store = Store::new_in_memory().await.expect("in-memory store");
    let queue = Arc::new(JobQueue::new(Arc::new(store)));
    let (tx, rx) = flume::unbounded();
    let config = WorkerConfig {
        count: 2,
        poll_interval: Duration::from_millis(10),
        sweep_interval,
        job_types: None,
    };
    let pool = WorkerPool::new(Arc::clone(&queue), registry, config, tx);
    let shutdown = CancellationToken::new();
    let handles = pool.spawn(shutdown.clone());
    Harness {
        queue,
        events: rx,
        shutdown,
        handles,
    }
}

impl Harness {
    async fn finish(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            handle.await.expect("worker join");
        }
    }

    async fn wait(&self, id: uuid::Uuid) -> Job {
        match self
            .queue
            .wait_for(id, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .expect("wait")
        {
            WaitOutcome::Finished(job) => job,
            WaitOutcome::TimedOut(job) => panic!("job did not finish: {:?}", job.status),
        }
    }

    async fn next_event(&self) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv_async())
            .await
            .expect("event in time")
            .expect("channel open")
    }
}

fn registry(job_type: &str, executor: Arc<dyn Executor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(job_type, executor);
    registry
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_execution_completes_job() {
    let h = start(registry("build", Arc::new(Passing)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");

    let done = h.wait(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    let report: ExecutionReport =
        serde_json::from_value(done.result.expect("result")).expect("report json");
    assert_eq!(report.status, ReportStatus::Pass);
    assert_eq!(report.summary, "ran build");

    let event = h.next_event().await;
    assert_eq!(event.job.id, job.id);
    assert!(event.worker_id.starts_with("worker-"));
    h.finish().await;
}

#[tokio::test]
async fn executor_error_fails_job_with_context() {
    let h = start(registry("build", Arc::new(Erroring)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");

    let failed = h.wait(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("agent run: compiler exploded"));
    h.finish().await;
}

#[tokio::test]
async fn panic_is_recorded_as_failure() {
    let h = start(registry("build", Arc::new(Panicking)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");

    let failed = h.wait(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("executor panicked: executor bug"));

    // Workers survive the panic.
    let next = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");
    assert_eq!(h.wait(next.id).await.status, JobStatus::Failed);
    h.finish().await;
}

#[tokio::test]
async fn missing_executor_fails_job() {
    let h = start(registry("build", Arc::new(Passing)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("deploy", json!({}))).await.expect("enqueue");

    let failed = h.wait(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().unwrap_or_default().contains("no executor"));
    assert_eq!(h.next_event().await.job.id, job.id);
    h.finish().await;
}

#[tokio::test]
async fn force_kill_preempts_running_executor() {
    let executor = Hanging;
    let h = start(registry("build", Arc::new(executor)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");

    // Wait for a worker to pick it up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.queue.get(job.id).await.expect("get").status != JobStatus::Running {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while h.queue.inflight_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "token never registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let killed = h.queue.force_kill(job.id, "operator").await.expect("kill");
    assert_eq!(killed.status, JobStatus::Failed);

    // The worker does not re-finalize or emit for a job it did not finish.
    let reloaded = h.wait(job.id).await;
    assert_eq!(reloaded.error, killed.error);
    assert!(h.events.is_empty());
    h.finish().await;
}

#[tokio::test]
async fn worker_sweeps_timeouts() {
    let executor = Hanging;
    let h = start(registry("build", Arc::new(executor)), Duration::from_millis(50)).await;
    let job = h
        .queue
        .enqueue(JobRequest::new("build", json!({})).timeout_secs(1))
        .await
        .expect("enqueue");

    let timed_out = h.wait(job.id).await;
    assert_eq!(timed_out.status, JobStatus::Timeout);
    let event = h.next_event().await;
    assert_eq!(event.job.status, JobStatus::Timeout);
    h.finish().await;
}

#[tokio::test]
async fn shutdown_fails_inflight_job() {
    let executor = Hanging;
    let h = start(registry("build", Arc::new(executor)), Duration::from_secs(30)).await;
    let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.queue.inflight_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let queue = Arc::clone(&h.queue);
    h.finish().await;
    let job = queue.get(job.id).await.expect("get");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("worker shut down"));
    assert_eq!(queue.inflight_count(), 0);
}

#[tokio::test]
async fn contended_jobs_leave_no_inflight_tokens_behind() {
    let h = start(registry("build", Arc::new(Passing)), Duration::from_secs(30)).await;
    let mut ids = Vec::new();
    for _ in 0..20 {
        let job = h.queue.enqueue(JobRequest::new("build", json!({}))).await.expect("enqueue");
        ids.push(job.id);
    }
    let missing = h.queue.enqueue(JobRequest::new("deploy", json!({}))).await.expect("enqueue");
    ids.push(missing.id);

    for id in &ids {
        assert!(h.wait(*id).await.status.is_terminal());
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.queue.inflight_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "inflight tokens leaked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Each job is reported by exactly one worker.
    let mut seen = Vec::new();
    for _ in 0..ids.len() {
        seen.push(h.next_event().await.job.id);
    }
    seen.sort();
    ids.sort();
    assert_eq!(seen, ids);
    h.finish().await;
}
