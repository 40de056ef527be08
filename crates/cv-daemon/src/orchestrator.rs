//! Drives runs forward: keeps task stages in step with their run, turns open
//! tasks into `agent_run` jobs, and feeds finished jobs back into the run
//! state machine.

use std::sync::Arc;

use cv_core::config::{OrchestratorConfig, QueueConfig, AGENT_RUN_JOB_TYPE};
use cv_core::types::{
    AgentRole, AuditAction, AuditEvent, EntityType, ExecutionReport, Job, JobPriority, JobStatus,
    PipelineStage, Run, RunState, Task, TaskStatus,
};
use cv_pipeline::{
    create_tasks_from_findings, PipelineError, RemediationOptions, RunProgress, RunStateMachine,
};
use cv_queue::{JobQueue, JobRequest, QueueError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::TaskScheduler;

/// Actor recorded on every change the orchestrator makes.
pub const ORCHESTRATOR_ACTOR: &str = "orchestrator";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("malformed job payload for {job_id}: {reason}")]
    MalformedPayload { job_id: Uuid, reason: String },
}

impl From<tokio_rusqlite::Error> for OrchestratorError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        OrchestratorError::Pipeline(PipelineError::Store(e))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// One unit of agent work for a task at its current stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub project: String,
    pub title: String,
    pub stage: PipelineStage,
    pub role: AgentRole,
    pub priority: u8,
}

impl WorkItem {
    /// Dedupe key of the job carrying this item.
    pub fn job_key(&self) -> String {
        job_key(self.task_id, self.stage)
    }
}

fn job_key(task_id: Uuid, stage: PipelineStage) -> String {
    format!("task:{task_id}:{}", stage.as_str())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub tasks_queued: usize,
    pub work_queue: Vec<WorkItem>,
    pub progress: RunProgress,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchOutcome {
    /// Jobs created by this call.
    pub enqueued: Vec<Uuid>,
    /// Work items that already had a pending or running job.
    pub already_queued: usize,
}

/// What [`Orchestrator::apply_job_outcome`] did with a finished job.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedOutcome {
    /// Not an `agent_run` job, not terminal yet, or a stale report.
    Ignored,
    /// The report was stored; carries the run state afterwards.
    Reported { state: RunState, passed: bool },
    /// The attempt failed; `task_failed` once the retry budget is spent.
    AttemptFailed { attempts: u64, task_failed: bool },
}

/// Per-run summary of one orchestration cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub runs_processed: usize,
    pub jobs_enqueued: usize,
    /// Runs whose processing errored and were skipped.
    pub runs_failed: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_tasks_per_cycle: usize,
    pub auto_loop_back: bool,
    pub umbrella_tasks: bool,
    pub max_attempts: u32,
}

impl OrchestratorSettings {
    pub fn from_config(orchestrator: &OrchestratorConfig, queue: &QueueConfig) -> Self {
        Self {
            max_tasks_per_cycle: orchestrator.max_tasks_per_cycle,
            auto_loop_back: orchestrator.auto_loop_back,
            umbrella_tasks: orchestrator.umbrella_tasks,
            max_attempts: queue.max_attempts,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default(), &QueueConfig::default())
    }
}

pub struct Orchestrator {
    machine: RunStateMachine,
    queue: Arc<JobQueue>,
    scheduler: TaskScheduler,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(machine: RunStateMachine, queue: Arc<JobQueue>, settings: OrchestratorSettings) -> Self {
        let machine = machine.with_remediation_options(RemediationOptions {
            umbrella: settings.umbrella_tasks,
        });
        let scheduler = TaskScheduler::new(machine.board().clone());
        Self {
            machine,
            queue,
            scheduler,
            settings,
        }
    }

    pub fn machine(&self) -> &RunStateMachine {
        &self.machine
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Move every open task of the run's project up to the run's stage floor.
    /// Returns how many tasks moved. Tasks that cannot complete stay put.
    pub async fn sync_task_stages_with_run(&self, run: &Run) -> Result<usize> {
        let Some(floor) = run.state.task_stage_floor() else {
            return Ok(0);
        };
        let board = self.machine.board();
        let mut moved = 0;
        for task in board.list_open(&run.project, None).await? {
            if task.stage >= floor {
                continue;
            }
            match board.advance_stage_to(ORCHESTRATOR_ACTOR, task.id, floor).await {
                Ok(_) => moved += 1,
                Err(PipelineError::Blocked { .. }) | Err(PipelineError::InvalidTransition { .. }) => {
                    debug!(task_id = %task.id, target = %floor, "task left behind run");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if moved > 0 {
            info!(run_id = %run.id, state = %run.state, moved, "task stages synced with run");
        }
        Ok(moved)
    }

    /// Build the work list for one run: up to `max_tasks` unblocked tasks in
    /// scheduler order, each paired with the role for its stage.
    ///
    /// Tasks already past the run's working stage wait for the run to catch
    /// up. Tasks marked `Blocked` or `Failed` wait for an operator. Neither
    /// counts against `max_tasks`.
    pub async fn process_run(&self, run_id: Uuid, max_tasks: usize) -> Result<ProcessResult> {
        let run = self.machine.get_run(run_id).await?;
        self.sync_task_stages_with_run(&run).await?;

        let board = self.machine.board();
        let ceiling = working_stage(run.state);
        let candidates: Vec<Task> = board
            .list_open(&run.project, None)
            .await?
            .into_iter()
            .filter(|t| !matches!(t.status, TaskStatus::Blocked | TaskStatus::Failed))
            .filter(|t| t.stage <= ceiling)
            .collect();
        let statuses = self.scheduler.blocker_statuses(&candidates).await?;

        let mut work_queue = Vec::new();
        for task in candidates {
            if work_queue.len() >= max_tasks {
                break;
            }
            if !crate::scheduler::is_eligible(&task, &statuses) {
                debug!(task_id = %task.id, "task skipped: unresolved blockers");
                continue;
            }
            let task = if task.stage == PipelineStage::None {
                match board.start(ORCHESTRATOR_ACTOR, task.id).await {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "failed to start task");
                        continue;
                    }
                }
            } else {
                task
            };
            let Some(role) = task.stage.role() else {
                continue;
            };
            work_queue.push(work_item(&run, &task, role));
        }

        let progress = self.machine.get_progress(run.id).await?;
        Ok(ProcessResult {
            tasks_queued: work_queue.len(),
            work_queue,
            progress,
        })
    }

    /// Enqueue one `agent_run` job per work item, skipping items whose job is
    /// still pending or running.
    pub async fn dispatch(&self, result: &ProcessResult) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();
        for item in &result.work_queue {
            let payload = serde_json::to_value(item).map_err(|e| OrchestratorError::MalformedPayload {
                job_id: item.task_id,
                reason: e.to_string(),
            })?;
            let request = JobRequest::new(AGENT_RUN_JOB_TYPE, payload)
                .priority(JobPriority::from_task_priority(item.priority));
            let (job, created) = self.queue.enqueue_unique(request, &item.job_key()).await?;
            if created {
                debug!(job_id = %job.id, task_id = %item.task_id, stage = %item.stage, "work dispatched");
                outcome.enqueued.push(job.id);
            } else {
                outcome.already_queued += 1;
            }
        }
        Ok(outcome)
    }

    /// Process and dispatch every run that has agent work to do. A run that
    /// errors is logged and skipped; the rest of the cycle still runs.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        for run in self.machine.list_active_runs().await? {
            if !accepts_work(run.state) {
                continue;
            }
            match self.cycle_run(&run).await {
                Ok(enqueued) => {
                    summary.runs_processed += 1;
                    summary.jobs_enqueued += enqueued;
                }
                Err(e) => {
                    summary.runs_failed += 1;
                    warn!(run_id = %run.id, state = %run.state, error = %e, "run skipped this cycle");
                }
            }
        }
        if summary.jobs_enqueued > 0 {
            info!(
                runs = summary.runs_processed,
                enqueued = summary.jobs_enqueued,
                "orchestration cycle dispatched work"
            );
        }
        Ok(summary)
    }

    async fn cycle_run(&self, run: &Run) -> Result<usize> {
        let result = self
            .process_run(run.id, self.settings.max_tasks_per_cycle)
            .await?;
        let dispatched = self.dispatch(&result).await?;
        if run.state == RunState::Dev {
            self.advance_drained_dev_run(run).await?;
        }
        Ok(dispatched.enqueued.len())
    }

    /// Dev has no gate, so a Dev run whose tasks have all moved past Dev
    /// advances without waiting for another report.
    async fn advance_drained_dev_run(&self, run: &Run) -> Result<()> {
        let open = self.machine.board().list_open(&run.project, None).await?;
        if open.is_empty() || open.iter().any(|t| t.stage <= PipelineStage::Dev) {
            return Ok(());
        }
        self.machine.advance_state(run.id, ORCHESTRATOR_ACTOR).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Fold a finished `agent_run` job back into its task and run.
    pub async fn apply_job_outcome(&self, job: &Job) -> Result<AppliedOutcome> {
        if job.job_type != AGENT_RUN_JOB_TYPE || !job.status.is_terminal() {
            return Ok(AppliedOutcome::Ignored);
        }
        let item: WorkItem = serde_json::from_value(job.payload.clone()).map_err(|e| {
            OrchestratorError::MalformedPayload {
                job_id: job.id,
                reason: e.to_string(),
            }
        })?;

        if job.status == JobStatus::Completed {
            let report = match job.result.clone().map(serde_json::from_value::<ExecutionReport>) {
                Some(Ok(report)) => report,
                Some(Err(e)) => {
                    return Err(OrchestratorError::MalformedPayload {
                        job_id: job.id,
                        reason: format!("result is not a report: {e}"),
                    })
                }
                None => {
                    return Err(OrchestratorError::MalformedPayload {
                        job_id: job.id,
                        reason: "completed job has no result".into(),
                    })
                }
            };
            if !self.still_at_stage(&item).await? {
                debug!(job_id = %job.id, task_id = %item.task_id, stage = %item.stage, "stale agent report dropped");
                return Ok(AppliedOutcome::Ignored);
            }
            return self.apply_report(&item, report).await;
        }

        self.apply_failed_attempt(job, &item).await
    }

    async fn apply_report(&self, item: &WorkItem, report: ExecutionReport) -> Result<AppliedOutcome> {
        let board = self.machine.board();
        let stored = self.machine.submit_report(item.run_id, item.role, report).await?;
        let passed = stored.passed();

        if passed {
            match board.advance_stage(ORCHESTRATOR_ACTOR, item.task_id).await {
                Ok(task) => debug!(task_id = %task.id, stage = %task.stage, "task advanced"),
                Err(PipelineError::Blocked { id }) => {
                    debug!(task_id = %id, "task passed but blockers are not done");
                }
                Err(e) => warn!(task_id = %item.task_id, error = %e, "failed to advance task"),
            }
        } else if !item.stage_is_gated() {
            if let Err(e) = board.mark_failed(ORCHESTRATOR_ACTOR, item.task_id).await {
                warn!(task_id = %item.task_id, error = %e, "could not mark task failed");
            }
        }

        let run = self.machine.get_run(item.run_id).await?;
        if run.state.owner() != Some(item.role) || run.state.is_failed() {
            return Ok(AppliedOutcome::Reported {
                state: run.state,
                passed,
            });
        }

        let gated_failure = !passed && run.state.is_gated();
        let stage_done = passed && !self.has_open_work_at(&run).await?;
        if !(gated_failure || stage_done) {
            return Ok(AppliedOutcome::Reported {
                state: run.state,
                passed,
            });
        }

        let mut state = self.machine.advance_state(run.id, ORCHESTRATOR_ACTOR).await?;
        if state.is_failed() && self.settings.auto_loop_back {
            state = self.loop_back(&run, state).await?;
        }
        Ok(AppliedOutcome::Reported { state, passed })
    }

    async fn loop_back(&self, run: &Run, failed: RunState) -> Result<RunState> {
        match failed {
            RunState::QaFailed | RunState::SecurityFailed => {
                let outcome = self
                    .machine
                    .reset_to_dev(run.id, ORCHESTRATOR_ACTOR, true)
                    .await?;
                Ok(outcome.state)
            }
            RunState::DocsFailed => {
                if let Some(report) = self.machine.latest_report(run.id, AgentRole::Docs).await? {
                    let outcome = create_tasks_from_findings(
                        self.machine.board(),
                        &run.project,
                        &report,
                        RemediationOptions {
                            umbrella: self.settings.umbrella_tasks,
                        },
                    )
                    .await?;
                    info!(run_id = %run.id, created = outcome.created.len(), "docs findings queued as tasks");
                }
                Ok(failed)
            }
            other => Ok(other),
        }
    }

    async fn apply_failed_attempt(&self, job: &Job, item: &WorkItem) -> Result<AppliedOutcome> {
        let attempts = self.queue.attempts(&item.job_key()).await?;
        let event = AuditEvent::new(
            ORCHESTRATOR_ACTOR,
            AuditAction::JobFailed,
            EntityType::Task,
            item.task_id,
            serde_json::json!({
                "job_id": job.id,
                "status": job.status,
                "error": job.error,
                "stage": item.stage,
                "attempts": attempts,
            }),
        );
        self.machine.board().store().append_audit(&event).await?;

        let task_failed = attempts >= u64::from(self.settings.max_attempts);
        if task_failed {
            match self.machine.board().mark_failed(ORCHESTRATOR_ACTOR, item.task_id).await {
                Ok(_) => warn!(task_id = %item.task_id, attempts, "task failed after retries"),
                Err(e) => warn!(task_id = %item.task_id, error = %e, "could not mark task failed"),
            }
        } else {
            info!(task_id = %item.task_id, job_id = %job.id, attempts, "agent run failed; will retry");
        }
        Ok(AppliedOutcome::AttemptFailed {
            attempts,
            task_failed,
        })
    }

    /// A report only counts while its task is still at the stage it was
    /// written for. A duplicate job finishing after the task moved on is stale.
    async fn still_at_stage(&self, item: &WorkItem) -> Result<bool> {
        match self.machine.board().get(item.task_id).await {
            Ok(task) => Ok(task.stage == item.stage),
            Err(PipelineError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether any open task of the run's project sits at or below the run's
    /// working stage.
    async fn has_open_work_at(&self, run: &Run) -> Result<bool> {
        let ceiling = working_stage(run.state);
        Ok(self
            .machine
            .board()
            .list_open(&run.project, None)
            .await?
            .iter()
            .any(|t| t.stage <= ceiling))
    }
}

impl WorkItem {
    fn stage_is_gated(&self) -> bool {
        matches!(
            self.stage,
            PipelineStage::Qa | PipelineStage::Security | PipelineStage::Docs
        )
    }
}

fn work_item(run: &Run, task: &Task, role: AgentRole) -> WorkItem {
    WorkItem {
        run_id: run.id,
        task_id: task.id,
        project: run.project.clone(),
        title: task.title.clone(),
        stage: task.stage,
        role,
        priority: task.priority,
    }
}

/// Highest task stage agents may work on while the run is in `state`.
fn working_stage(state: RunState) -> PipelineStage {
    match state.task_stage_floor() {
        None => PipelineStage::Dev,
        Some(stage) => stage,
    }
}

/// States in which the orchestrator dispatches agent work. PM runs wait
/// for planning to be advanced by the PM or a human.
fn accepts_work(state: RunState) -> bool {
    matches!(
        state,
        RunState::Dev | RunState::Qa | RunState::Security | RunState::Docs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            job_key(id, PipelineStage::Qa),
            "task:00000000-0000-0000-0000-000000000000:qa"
        );
    }

    #[test]
    fn working_stage_follows_floor() {
        assert_eq!(working_stage(RunState::Pm), PipelineStage::Dev);
        assert_eq!(working_stage(RunState::Dev), PipelineStage::Dev);
        assert_eq!(working_stage(RunState::Security), PipelineStage::Security);
    }

    #[test]
    fn only_working_states_accept_work() {
        assert!(accepts_work(RunState::Qa));
        assert!(!accepts_work(RunState::Pm));
        assert!(!accepts_work(RunState::QaFailed));
        assert!(!accepts_work(RunState::ReadyForDeploy));
    }
}
