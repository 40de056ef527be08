use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form structured details attached to reports and audit events.
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Actor name required for human-gated transitions.
pub const HUMAN_ACTOR: &str = "human";

pub const TASK_PRIORITY_MIN: u8 = 1;
pub const TASK_PRIORITY_MAX: u8 = 10;
pub const TASK_PRIORITY_DEFAULT: u8 = 5;

/// Default job timeout when the caller does not pick one.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Backlog, TaskStatus::InProgress)
                | (TaskStatus::Backlog, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
                | (TaskStatus::Blocked, TaskStatus::Backlog)
                | (TaskStatus::Failed, TaskStatus::InProgress)
                | (TaskStatus::Failed, TaskStatus::Backlog)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

/// Ordered pipeline stage of a task. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    None,
    Dev,
    Qa,
    Security,
    Docs,
    Complete,
}

impl PipelineStage {
    /// The stages in pipeline order.
    pub fn pipeline_order() -> &'static [PipelineStage] {
        &[
            PipelineStage::None,
            PipelineStage::Dev,
            PipelineStage::Qa,
            PipelineStage::Security,
            PipelineStage::Docs,
            PipelineStage::Complete,
        ]
    }

    /// The stage that follows `self`, or `None` once complete.
    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::None => Some(PipelineStage::Dev),
            PipelineStage::Dev => Some(PipelineStage::Qa),
            PipelineStage::Qa => Some(PipelineStage::Security),
            PipelineStage::Security => Some(PipelineStage::Docs),
            PipelineStage::Docs => Some(PipelineStage::Complete),
            PipelineStage::Complete => None,
        }
    }

    /// Role responsible for work at this stage.
    pub fn role(&self) -> Option<AgentRole> {
        match self {
            PipelineStage::Dev => Some(AgentRole::Dev),
            PipelineStage::Qa => Some(AgentRole::Qa),
            PipelineStage::Security => Some(AgentRole::Security),
            PipelineStage::Docs => Some(AgentRole::Docs),
            PipelineStage::None | PipelineStage::Complete => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::None => "none",
            PipelineStage::Dev => "dev",
            PipelineStage::Qa => "qa",
            PipelineStage::Security => "security",
            PipelineStage::Docs => "docs",
            PipelineStage::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentRole / ReportStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Pm,
    Dev,
    Qa,
    Security,
    Docs,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Pm => "pm",
            AgentRole::Dev => "dev",
            AgentRole::Qa => "qa",
            AgentRole::Security => "security",
            AgentRole::Docs => "docs",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pass,
    Fail,
    Pending,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pm,
    Dev,
    Qa,
    QaFailed,
    Security,
    SecurityFailed,
    Docs,
    DocsFailed,
    ReadyForCommit,
    Merged,
    ReadyForDeploy,
    Testing,
    TestingFailed,
    Deployed,
}

impl RunState {
    pub const ALL: [RunState; 14] = [
        RunState::Pm,
        RunState::Dev,
        RunState::Qa,
        RunState::QaFailed,
        RunState::Security,
        RunState::SecurityFailed,
        RunState::Docs,
        RunState::DocsFailed,
        RunState::ReadyForCommit,
        RunState::Merged,
        RunState::ReadyForDeploy,
        RunState::Testing,
        RunState::TestingFailed,
        RunState::Deployed,
    ];

    /// Adjacency table for checked transitions. `Deployed` has no outgoing edges.
    pub const VALID_TRANSITIONS: [(RunState, &'static [RunState]); 14] = [
        (RunState::Pm, &[RunState::Dev]),
        (RunState::Dev, &[RunState::Qa]),
        (RunState::Qa, &[RunState::Security, RunState::QaFailed, RunState::Dev]),
        (RunState::QaFailed, &[RunState::Qa, RunState::Dev]),
        (
            RunState::Security,
            &[RunState::Docs, RunState::SecurityFailed, RunState::Dev],
        ),
        (RunState::SecurityFailed, &[RunState::Security, RunState::Dev]),
        (RunState::Docs, &[RunState::ReadyForCommit, RunState::DocsFailed]),
        (RunState::DocsFailed, &[RunState::Docs, RunState::Dev]),
        (RunState::ReadyForCommit, &[RunState::Merged]),
        (RunState::Merged, &[RunState::ReadyForDeploy]),
        (RunState::ReadyForDeploy, &[RunState::Testing]),
        (RunState::Testing, &[RunState::Deployed, RunState::TestingFailed]),
        (RunState::TestingFailed, &[RunState::Testing, RunState::Dev]),
        (RunState::Deployed, &[]),
    ];

    /// All states reachable from `self` through a checked transition.
    pub fn transitions(&self) -> &'static [RunState] {
        Self::VALID_TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
            .unwrap_or(&[])
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &RunState) -> bool {
        self.transitions().contains(target)
    }

    /// The single forward edge. Failed states and `Deployed` have none.
    pub fn forward(&self) -> Option<RunState> {
        match self {
            RunState::Pm => Some(RunState::Dev),
            RunState::Dev => Some(RunState::Qa),
            RunState::Qa => Some(RunState::Security),
            RunState::Security => Some(RunState::Docs),
            RunState::Docs => Some(RunState::ReadyForCommit),
            RunState::ReadyForCommit => Some(RunState::Merged),
            RunState::Merged => Some(RunState::ReadyForDeploy),
            RunState::ReadyForDeploy => Some(RunState::Testing),
            RunState::Testing => Some(RunState::Deployed),
            RunState::QaFailed
            | RunState::SecurityFailed
            | RunState::DocsFailed
            | RunState::TestingFailed
            | RunState::Deployed => None,
        }
    }

    /// The paired failure state, if this state has one.
    pub fn failure(&self) -> Option<RunState> {
        match self {
            RunState::Qa => Some(RunState::QaFailed),
            RunState::Security => Some(RunState::SecurityFailed),
            RunState::Docs => Some(RunState::DocsFailed),
            RunState::Testing => Some(RunState::TestingFailed),
            _ => None,
        }
    }

    /// Gated states need a passing report from their owner before advancing.
    pub fn is_gated(&self) -> bool {
        matches!(self, RunState::Qa | RunState::Security | RunState::Docs)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RunState::QaFailed
                | RunState::SecurityFailed
                | RunState::DocsFailed
                | RunState::TestingFailed
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.transitions().is_empty()
    }

    /// Advancing out of this state needs a human actor.
    pub fn requires_human(&self) -> bool {
        matches!(self, RunState::ReadyForDeploy)
    }

    /// Role whose reports drive this state.
    pub fn owner(&self) -> Option<AgentRole> {
        match self {
            RunState::Pm => Some(AgentRole::Pm),
            RunState::Dev => Some(AgentRole::Dev),
            RunState::Qa | RunState::QaFailed => Some(AgentRole::Qa),
            RunState::Security | RunState::SecurityFailed => Some(AgentRole::Security),
            RunState::Docs | RunState::DocsFailed => Some(AgentRole::Docs),
            _ => None,
        }
    }

    /// Where `retryFromFailed` leads.
    pub fn retry_target(&self) -> Option<RunState> {
        match self {
            RunState::QaFailed => Some(RunState::Qa),
            RunState::SecurityFailed => Some(RunState::Security),
            _ => None,
        }
    }

    /// States from which a reset back to `Dev` is allowed.
    pub fn allows_reset_to_dev(&self) -> bool {
        matches!(
            self,
            RunState::Qa | RunState::QaFailed | RunState::Security | RunState::SecurityFailed
        )
    }

    /// The minimum stage every task of the run should have reached.
    pub fn task_stage_floor(&self) -> Option<PipelineStage> {
        match self {
            RunState::Pm => None,
            RunState::Dev => Some(PipelineStage::Dev),
            RunState::Qa | RunState::QaFailed => Some(PipelineStage::Qa),
            RunState::Security | RunState::SecurityFailed => Some(PipelineStage::Security),
            RunState::Docs | RunState::DocsFailed => Some(PipelineStage::Docs),
            RunState::ReadyForCommit
            | RunState::Merged
            | RunState::ReadyForDeploy
            | RunState::Testing
            | RunState::TestingFailed
            | RunState::Deployed => Some(PipelineStage::Complete),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pm => "PM",
            RunState::Dev => "Dev",
            RunState::Qa => "QA",
            RunState::QaFailed => "QA_Failed",
            RunState::Security => "Security",
            RunState::SecurityFailed => "Security_Failed",
            RunState::Docs => "Docs",
            RunState::DocsFailed => "Docs_Failed",
            RunState::ReadyForCommit => "ReadyForCommit",
            RunState::Merged => "Merged",
            RunState::ReadyForDeploy => "ReadyForDeploy",
            RunState::Testing => "Testing",
            RunState::TestingFailed => "Testing_Failed",
            RunState::Deployed => "Deployed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: u8,
    pub status: TaskStatus,
    pub stage: PipelineStage,
    pub blocked_by: BTreeSet<Uuid>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            title: title.into(),
            description: None,
            priority: TASK_PRIORITY_DEFAULT,
            status: TaskStatus::Backlog,
            stage: PipelineStage::None,
            blocked_by: BTreeSet::new(),
            completed: false,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn blocked_by(mut self, blockers: impl IntoIterator<Item = Uuid>) -> Self {
        self.blocked_by.extend(blockers);
        self
    }

    /// Not yet done and not past the last stage.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal() && self.stage != PipelineStage::Complete
    }
}

// ---------------------------------------------------------------------------
// Run / reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project: String,
    pub title: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            title: title.into(),
            state: RunState::Pm,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What an executor hands back for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: Details,
}

impl ExecutionReport {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Pass,
            summary: summary.into(),
            details: Details::new(),
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Fail,
            summary: summary.into(),
            details: Details::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub id: Uuid,
    pub run_id: Uuid,
    pub role: AgentRole,
    pub status: ReportStatus,
    pub summary: String,
    pub details: Details,
    pub created_at: DateTime<Utc>,
}

impl AgentReport {
    pub fn new(run_id: Uuid, role: AgentRole, report: ExecutionReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            role,
            status: report.status,
            summary: report.summary,
            details: report.details,
            created_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ReportStatus::Pass
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Run,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
    Transition,
    Forced,
    Retry,
    ResetToDev,
    ReportSubmitted,
    StatusChanged,
    StageChanged,
    PriorityBoosted,
    JobFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        entity_type: EntityType,
        entity_id: Uuid,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action,
            entity_type,
            entity_id,
            details,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, target: &JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Timeout)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dequeue tier. Lower numeric value is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl JobPriority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<JobPriority> {
        match value {
            1 => Some(JobPriority::Critical),
            2 => Some(JobPriority::High),
            3 => Some(JobPriority::Normal),
            4 => Some(JobPriority::Low),
            _ => None,
        }
    }

    /// Map a 1–10 task priority onto a dequeue tier.
    pub fn from_task_priority(priority: u8) -> JobPriority {
        match priority {
            9..=u8::MAX => JobPriority::Critical,
            7..=8 => JobPriority::High,
            4..=6 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub position_at_creation: u64,
    pub dedupe_key: Option<String>,
}

impl Job {
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: JobPriority,
        timeout_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority,
            payload,
            result: None,
            error: None,
            timeout_secs,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            position_at_creation: 0,
            dedupe_key: None,
        }
    }

    /// Whether a running job has outlived its timeout at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                now.signed_duration_since(started).num_milliseconds()
                    > (self.timeout_secs as i64).saturating_mul(1000)
            }
            _ => false,
        }
    }
}
