use std::collections::BTreeMap;

use cv_core::types::{PipelineStage, RunState, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::state_machine::RunStateMachine;

/// Task counts for the project a run belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub state: RunState,
    pub total: usize,
    pub by_stage: BTreeMap<PipelineStage, usize>,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub completed: usize,
    /// 0.0–100.0; zero for a project without tasks.
    pub percent_complete: f64,
}

impl RunProgress {
    pub fn from_tasks(run_id: Uuid, state: RunState, tasks: &[Task]) -> Self {
        let mut by_stage = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        for task in tasks {
            *by_stage.entry(task.stage).or_insert(0) += 1;
            *by_status.entry(task.status).or_insert(0) += 1;
        }
        let completed = by_status.get(&TaskStatus::Done).copied().unwrap_or(0);
        let total = tasks.len();
        let percent_complete = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        Self {
            run_id,
            state,
            total,
            by_stage,
            by_status,
            completed,
            percent_complete,
        }
    }
}

impl RunStateMachine {
    pub async fn get_progress(&self, run_id: Uuid) -> Result<RunProgress> {
        let run = self.get_run(run_id).await?;
        let tasks = self.store().list_tasks(&run.project).await?;
        Ok(RunProgress::from_tasks(run.id, run.state, &tasks))
    }
}
