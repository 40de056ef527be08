use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cv_core::types::Job;
use cv_pipeline::RunStateMachine;
use cv_queue::JobQueue;
use cv_telemetry::metrics::{global_metrics, names};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::Result;
use crate::scheduler::find_dependency_cycles;

/// Result of a single patrol sweep.
#[derive(Debug, Clone, Serialize)]
pub struct PatrolReport {
    /// Running jobs moved to `Timeout` by this sweep.
    pub timed_out: Vec<Job>,
    /// Terminal jobs deleted for being older than the retention window.
    pub stale_removed: usize,
    /// Pending jobs across all types after the sweep.
    pub pending: u64,
    /// Dependency cycles found per project.
    pub cycles: Vec<(String, Vec<Uuid>)>,
    pub timestamp: DateTime<Utc>,
}

/// Periodic housekeeping over the queue and the task graph.
pub struct PatrolRunner {
    queue: Arc<JobQueue>,
    machine: RunStateMachine,
    stale_job_max_age: Duration,
}

impl PatrolRunner {
    pub fn new(queue: Arc<JobQueue>, machine: RunStateMachine, stale_job_max_age: Duration) -> Self {
        Self {
            queue,
            machine,
            stale_job_max_age,
        }
    }

    /// Execute a full patrol sweep:
    /// - time out overdue running jobs,
    /// - delete stale terminal jobs,
    /// - publish the `jobs_pending` gauge,
    /// - warn about dependency cycles in projects with active runs.
    pub async fn run_patrol(&self) -> Result<PatrolReport> {
        let now = Utc::now();
        debug!("patrol sweep starting");

        let timed_out = self.queue.sweep_timeouts(now).await?;
        let stale_removed = self.queue.cleanup_stale(self.stale_job_max_age).await?;

        let status = self.queue.queue_status().await?;
        let pending: u64 = status.pending_by_type.values().sum();
        global_metrics().set_gauge(names::JOBS_PENDING, i64::try_from(pending).unwrap_or(i64::MAX));

        let projects: BTreeSet<String> = self
            .machine
            .list_active_runs()
            .await?
            .into_iter()
            .map(|run| run.project)
            .collect();
        let mut cycles = Vec::new();
        for project in projects {
            let tasks = self.machine.board().list(&project).await?;
            for cycle in find_dependency_cycles(&tasks) {
                warn!(
                    project = %project,
                    tasks = ?cycle,
                    "dependency cycle: these tasks can never be scheduled"
                );
                cycles.push((project.clone(), cycle));
            }
        }

        let report = PatrolReport {
            timed_out,
            stale_removed,
            pending,
            cycles,
            timestamp: now,
        };
        info!(
            timed_out = report.timed_out.len(),
            stale_removed = report.stale_removed,
            pending = report.pending,
            cycles = report.cycles.len(),
            "patrol completed"
        );
        Ok(report)
    }
}
