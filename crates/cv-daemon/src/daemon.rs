use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cv_core::config::Config;
use cv_core::store::Store;
use cv_core::types::Job;
use cv_pipeline::RunStateMachine;
use cv_queue::{Executor, ExecutorRegistry, JobEvent, JobQueue, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::ProcessExecutor;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::patrol::PatrolRunner;
use crate::supervisor::{Supervisor, SupervisorHandle, SupervisorStatus};

/// Loop intervals for the orchestration supervisor.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often runs are processed and dispatched (default: 15s).
    pub cycle: Duration,
    /// How often the patrol sweep runs (default: 300s).
    pub patrol: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cycle: Duration::from_secs(config.orchestrator.cycle_interval_secs),
            patrol: Duration::from_secs(config.daemon.patrol_interval_secs),
        }
    }

    /// Both loops tick on a `tokio::time::interval`, which rejects a zero period.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.cycle.is_zero(), "cycle interval must be greater than zero");
        anyhow::ensure!(!self.patrol.is_zero(), "patrol interval must be greater than zero");
        Ok(())
    }
}

/// The conveyor background daemon.
///
/// Owns the store, the job queue and the orchestrator. [`start`](Self::start)
/// spawns the worker pool and the orchestration loop and hands back a
/// [`SupervisorHandle`] to stop them.
pub struct Daemon {
    config: Config,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    executors: ExecutorRegistry,
    intervals: DaemonIntervals,
}

impl Daemon {
    /// Open (or create) the configured store and wire the daemon around it.
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.store.resolved_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Store::new(&path)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Wire the daemon around an existing store. Executors come from
    /// `config.executors`; see [`register_executor`](Self::register_executor).
    pub fn with_store(config: Config, store: Arc<Store>) -> Self {
        let queue = Arc::new(JobQueue::with_default_timeout(
            Arc::clone(&store),
            config.queue.default_timeout_secs,
        ));
        let machine = RunStateMachine::new(store);
        let settings = OrchestratorSettings::from_config(&config.orchestrator, &config.queue);
        let orchestrator = Arc::new(Orchestrator::new(machine, Arc::clone(&queue), settings));

        let mut executors = ExecutorRegistry::new();
        for (job_type, exec) in &config.executors {
            executors.register(job_type.clone(), Arc::new(ProcessExecutor::from(exec)));
        }
        let intervals = DaemonIntervals::from_config(&config);

        Self {
            config,
            queue,
            orchestrator,
            executors,
            intervals,
        }
    }

    /// Register (or replace) the executor for a job type.
    pub fn register_executor(&mut self, job_type: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.register(job_type, executor);
    }

    /// Override the loop intervals.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Force-kill a running job and feed the failure back to its task.
    pub async fn force_kill(&self, job_id: Uuid, reason: &str) -> Result<Job> {
        let job = self.queue.force_kill(job_id, reason).await?;
        if let Err(e) = self.orchestrator.apply_job_outcome(&job).await {
            warn!(job_id = %job.id, error = %e, "failed to apply killed job");
        }
        Ok(job)
    }

    /// Spawn the worker pool and the orchestration loop.
    pub async fn start(&self) -> Result<SupervisorHandle> {
        self.config.validate().context("invalid daemon config")?;
        self.intervals.validate()?;
        for job_type in &self.config.workers.job_types {
            if self.executors.get(job_type).is_none() {
                warn!(job_type = %job_type, "no executor configured; jobs of this type will fail");
            }
        }

        let (supervisor, handle) = Supervisor::new();
        let (events_tx, events_rx) = flume::unbounded();
        let pool = WorkerPool::new(
            Arc::clone(&self.queue),
            self.executors.clone(),
            WorkerConfig::from(&self.config.workers),
            events_tx,
        );
        let workers = pool.spawn(supervisor.token().child_token());

        let patrol = PatrolRunner::new(
            Arc::clone(&self.queue),
            self.orchestrator.machine().clone(),
            Duration::from_secs(self.config.queue.stale_job_max_age_secs),
        );

        info!(
            workers = workers.len(),
            cycle_secs = self.intervals.cycle.as_secs_f64(),
            patrol_secs = self.intervals.patrol.as_secs_f64(),
            "conveyor daemon starting"
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let intervals = self.intervals.clone();
        tokio::spawn(async move {
            supervisor.set_status(SupervisorStatus::Running);
            run_loops(&orchestrator, &patrol, events_rx.clone(), intervals, supervisor.token().clone())
                .await;

            supervisor.set_status(SupervisorStatus::Stopping);
            for worker in workers {
                if let Err(e) = worker.await {
                    error!(error = %e, "worker task failed");
                }
            }
            // Outcomes written while the workers wound down.
            for event in events_rx.drain() {
                apply_event(&orchestrator, &event).await;
            }
            supervisor.set_status(SupervisorStatus::Stopped);
            info!("conveyor daemon stopped");
        });

        Ok(handle)
    }

    /// Start, then block until the handle reports `Stopped`.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let handle = self.start().await?;
        tokio::select! {
            _ = shutdown => handle.shutdown(),
            _ = handle.wait_stopped() => {}
        }
        handle.wait_stopped().await;
        Ok(())
    }
}

/// The orchestration loop: dispatch cycles, job feedback and patrol sweeps.
async fn run_loops(
    orchestrator: &Orchestrator,
    patrol: &PatrolRunner,
    events: flume::Receiver<JobEvent>,
    intervals: DaemonIntervals,
    token: CancellationToken,
) {
    let mut cycle_interval = tokio::time::interval(intervals.cycle);
    let mut patrol_interval = tokio::time::interval(intervals.patrol);
    // Dispatch right away; patrol after one full interval.
    patrol_interval.tick().await;

    loop {
        // Finished jobs are applied before the next dispatch.
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("shutdown signal received, stopping orchestration loop");
                break;
            }
            event = events.recv_async() => match event {
                Ok(event) => apply_event(orchestrator, &event).await,
                Err(_) => {
                    warn!("job event channel closed");
                    token.cancelled().await;
                    break;
                }
            },
            _ = cycle_interval.tick() => {
                if let Err(e) = orchestrator.run_cycle().await {
                    error!(error = %e, "orchestration cycle failed");
                }
            }
            _ = patrol_interval.tick() => {
                match patrol.run_patrol().await {
                    Ok(report) => {
                        for job in &report.timed_out {
                            apply_job(orchestrator, job).await;
                        }
                    }
                    Err(e) => error!(error = %e, "patrol failed"),
                }
            }
        }
    }
}

async fn apply_event(orchestrator: &Orchestrator, event: &JobEvent) {
    apply_job(orchestrator, &event.job).await;
}

async fn apply_job(orchestrator: &Orchestrator, job: &Job) {
    match orchestrator.apply_job_outcome(job).await {
        Ok(outcome) => debug!(job_id = %job.id, ?outcome, "job outcome applied"),
        Err(e) => error!(job_id = %job.id, error = %e, "failed to apply job outcome"),
    }
}
