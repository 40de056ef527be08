//! Gated run pipeline: PM → Dev → QA → Security → Docs → ReadyForCommit →
//! Merged → ReadyForDeploy → Testing → Deployed.
//!
//! Every write is a compare-and-set on the run's current state, committed in
//! one transaction with its audit event.

use std::sync::Arc;

use cv_core::store::Store;
use cv_core::types::{
    AgentReport, AgentRole, AuditAction, AuditEvent, EntityType, ExecutionReport, Run, RunState,
    HUMAN_ACTOR,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::remediation::{self, RemediationOptions, RemediationOutcome};
use crate::tasks::TaskBoard;

/// Result of [`RunStateMachine::reset_to_dev`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub state: RunState,
    pub remediation: RemediationOutcome,
}

#[derive(Clone)]
pub struct RunStateMachine {
    store: Arc<Store>,
    board: TaskBoard,
    remediation: RemediationOptions,
}

impl RunStateMachine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            board: TaskBoard::new(Arc::clone(&store)),
            store,
            remediation: RemediationOptions::default(),
        }
    }

    pub fn with_remediation_options(mut self, options: RemediationOptions) -> Self {
        self.remediation = options;
        self
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Runs and reports
    // -----------------------------------------------------------------------

    /// Create a run in `PM`.
    pub async fn create_run(&self, project: &str, title: &str, actor: &str) -> Result<Run> {
        if project.trim().is_empty() || title.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "run project and title must not be empty".into(),
            ));
        }
        let run = Run::new(project, title.trim());
        let event = AuditEvent::new(
            actor,
            AuditAction::Created,
            EntityType::Run,
            run.id,
            json!({ "project": run.project, "title": run.title, "state": run.state.as_str() }),
        );
        self.store.insert_run(&run, &event).await?;
        info!(run_id = %run.id, project = %run.project, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::NotFound { entity: "run", id: run_id })
    }

    pub async fn list_active_runs(&self) -> Result<Vec<Run>> {
        Ok(self.store.list_active_runs().await?)
    }

    pub async fn submit_report(
        &self,
        run_id: Uuid,
        role: AgentRole,
        report: ExecutionReport,
    ) -> Result<AgentReport> {
        let run = self.get_run(run_id).await?;
        let report = AgentReport::new(run.id, role, report);
        let event = AuditEvent::new(
            role.as_str(),
            AuditAction::ReportSubmitted,
            EntityType::Run,
            run.id,
            json!({
                "report_id": report.id,
                "role": role,
                "status": report.status,
                "state": run.state.as_str(),
            }),
        );
        self.store.insert_report(&report, &event).await?;
        debug!(run_id = %run.id, role = %role, status = ?report.status, "report submitted");
        Ok(report)
    }

    pub async fn latest_report(&self, run_id: Uuid, role: AgentRole) -> Result<Option<AgentReport>> {
        Ok(self.store.latest_report(run_id, role).await?)
    }

    pub async fn list_reports(&self, run_id: Uuid) -> Result<Vec<AgentReport>> {
        Ok(self.store.list_reports(run_id).await?)
    }

    pub async fn audit_trail(&self, entity_id: Uuid) -> Result<Vec<AuditEvent>> {
        Ok(self.store.audit_trail(entity_id).await?)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Follow the current state's forward edge.
    ///
    /// A gated state with a non-passing report moves to its `*_Failed` state
    /// instead; that state is returned like any other outcome.
    pub async fn advance_state(&self, run_id: Uuid, actor: &str) -> Result<RunState> {
        let run = self.get_run(run_id).await?;
        let from = run.state;
        let Some(mut to) = from.forward() else {
            return Err(PipelineError::transition(from, "(none)"));
        };

        if from.is_gated() {
            let role = from.owner().ok_or_else(|| PipelineError::transition(from, to))?;
            let report = self
                .store
                .latest_report(run.id, role)
                .await?
                .ok_or(PipelineError::ReportRequired { state: from, role })?;
            if !report.passed() {
                to = from.failure().ok_or_else(|| PipelineError::transition(from, to))?;
            }
        }

        if from.requires_human() && actor != HUMAN_ACTOR {
            return Err(PipelineError::AuthorizationRequired {
                state: from,
                actor: actor.to_string(),
            });
        }

        self.commit(&run, to, actor, AuditAction::Transition).await?;
        if to.is_failed() {
            warn!(run_id = %run.id, from = %from, to = %to, "quality gate failed");
        } else {
            info!(run_id = %run.id, from = %from, to = %to, actor, "run advanced");
        }
        Ok(to)
    }

    /// `QA_Failed → QA` or `Security_Failed → Security`.
    pub async fn retry_from_failed(&self, run_id: Uuid, actor: &str) -> Result<RunState> {
        let run = self.get_run(run_id).await?;
        let to = run
            .state
            .retry_target()
            .ok_or_else(|| PipelineError::transition(run.state, "retry"))?;
        self.commit(&run, to, actor, AuditAction::Retry).await?;
        info!(run_id = %run.id, from = %run.state, to = %to, actor, "run retried");
        Ok(to)
    }

    /// Send a run in QA or Security (passed or failed) back to Dev.
    ///
    /// With `create_tasks`, remediation tasks are synthesized from the latest
    /// failing report of the role owning the current state first.
    pub async fn reset_to_dev(
        &self,
        run_id: Uuid,
        actor: &str,
        create_tasks: bool,
    ) -> Result<ResetOutcome> {
        let run = self.get_run(run_id).await?;
        if !run.state.allows_reset_to_dev() {
            return Err(PipelineError::transition(run.state, RunState::Dev));
        }

        let mut remediation_outcome = RemediationOutcome::default();
        if create_tasks {
            if let Some(report) = self.latest_failing_report(&run).await? {
                remediation_outcome = remediation::create_tasks_from_findings(
                    &self.board,
                    &run.project,
                    &report,
                    self.remediation,
                )
                .await?;
            }
        }

        self.commit(&run, RunState::Dev, actor, AuditAction::ResetToDev)
            .await?;
        info!(
            run_id = %run.id,
            from = %run.state,
            created = remediation_outcome.created.len(),
            boosted = remediation_outcome.boosted.len(),
            "run reset to Dev"
        );
        Ok(ResetOutcome {
            state: RunState::Dev,
            remediation: remediation_outcome,
        })
    }

    /// Unconditional override that bypasses gates and the transition table.
    pub async fn force_set_state(
        &self,
        run_id: Uuid,
        state: RunState,
        actor: &str,
    ) -> Result<RunState> {
        let run = self.get_run(run_id).await?;
        self.commit(&run, state, actor, AuditAction::Forced).await?;
        warn!(run_id = %run.id, from = %run.state, to = %state, actor, "run state forced");
        Ok(state)
    }

    /// Latest non-passing report of the role owning the run's current state.
    async fn latest_failing_report(&self, run: &Run) -> Result<Option<AgentReport>> {
        let Some(role) = run.state.owner() else {
            return Ok(None);
        };
        let reports = self.store.list_reports(run.id).await?;
        Ok(reports
            .into_iter()
            .rev()
            .find(|r| r.role == role && !r.passed()))
    }

    /// Compare-and-set `run.state → to` with its audit event.
    async fn commit(&self, run: &Run, to: RunState, actor: &str, action: AuditAction) -> Result<()> {
        let from = run.state;
        if action != AuditAction::Forced && !from.can_transition_to(&to) {
            return Err(PipelineError::transition(from, to));
        }
        let event = AuditEvent::new(
            actor,
            action,
            EntityType::Run,
            run.id,
            json!({ "from": from.as_str(), "to": to.as_str(), "actor": actor }),
        );
        if !self.store.transition_run(run.id, from, to, &event).await? {
            // Someone else moved the run first.
            return Err(PipelineError::transition(from, to));
        }
        Ok(())
    }
}
