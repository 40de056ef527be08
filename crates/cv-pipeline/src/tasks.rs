//! Task board: validated, audited mutations of [`Task`]s.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use cv_core::store::Store;
use cv_core::types::{
    AuditAction, AuditEvent, EntityType, PipelineStage, Task, TaskStatus, TASK_PRIORITY_DEFAULT,
    TASK_PRIORITY_MAX, TASK_PRIORITY_MIN,
};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Input for [`TaskBoard::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub project: String,
    pub title: String,
    pub description: Option<String>,
    /// 1–10, defaults to 5.
    pub priority: Option<u8>,
    pub blocked_by: Vec<Uuid>,
}

impl NewTask {
    pub fn new(project: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn blocked_by(mut self, blockers: impl IntoIterator<Item = Uuid>) -> Self {
        self.blocked_by.extend(blockers);
        self
    }
}

/// Partial update for [`TaskBoard::update`]. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<u8>,
    pub blocked_by: Option<BTreeSet<Uuid>>,
}

#[derive(Clone)]
pub struct TaskBoard {
    store: Arc<Store>,
}

impl TaskBoard {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub async fn create(&self, actor: &str, new: NewTask) -> Result<Task> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(PipelineError::InvalidInput("task title must not be empty".into()));
        }
        if new.project.trim().is_empty() {
            return Err(PipelineError::InvalidInput("task project must not be empty".into()));
        }
        let priority = validate_priority(new.priority.unwrap_or(TASK_PRIORITY_DEFAULT))?;

        let mut task = Task::new(new.project.as_str(), title).with_priority(priority);
        task.description = new.description;
        task.blocked_by = new.blocked_by.into_iter().collect();
        self.validate_blockers(task.id, &task.blocked_by).await?;

        let event = AuditEvent::new(
            actor,
            AuditAction::Created,
            EntityType::Task,
            task.id,
            json!({ "title": task.title, "priority": task.priority }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        info!(task_id = %task.id, project = %task.project, priority = task.priority, "task created");
        Ok(task)
    }

    pub async fn update(&self, actor: &str, id: Uuid, update: TaskUpdate) -> Result<Task> {
        let mut task = self.get(id).await?;
        let mut changed = Vec::new();

        if let Some(title) = update.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(PipelineError::InvalidInput("task title must not be empty".into()));
            }
            task.title = title.to_string();
            changed.push("title");
        }
        if let Some(description) = update.description {
            task.description = description;
            changed.push("description");
        }
        if let Some(priority) = update.priority {
            task.priority = validate_priority(priority)?;
            changed.push("priority");
        }
        if let Some(blocked_by) = update.blocked_by {
            self.validate_blockers(task.id, &blocked_by).await?;
            task.blocked_by = blocked_by;
            changed.push("blocked_by");
        }

        task.updated_at = Utc::now();
        let event = AuditEvent::new(
            actor,
            AuditAction::Updated,
            EntityType::Task,
            task.id,
            json!({ "fields": changed }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        Ok(task)
    }

    /// Administrative delete.
    pub async fn delete(&self, actor: &str, id: Uuid) -> Result<()> {
        let event = AuditEvent::new(actor, AuditAction::Deleted, EntityType::Task, id, json!({}));
        if !self.store.delete_task(id, &event).await? {
            return Err(not_found(id));
        }
        info!(task_id = %id, actor, "task deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store.get_task(id).await?.ok_or_else(|| not_found(id))
    }

    pub async fn list(&self, project: &str) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(project).await?)
    }

    /// Non-terminal tasks, highest priority first, ties in creation order.
    pub async fn list_open(&self, project: &str, limit: Option<usize>) -> Result<Vec<Task>> {
        Ok(self.store.list_open_tasks(project, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Move a `None`-stage task into `Dev` and mark it in progress.
    pub async fn start(&self, actor: &str, id: Uuid) -> Result<Task> {
        let mut task = self.get(id).await?;
        if task.stage != PipelineStage::None {
            return Err(PipelineError::transition(task.stage, PipelineStage::Dev));
        }
        let from_status = task.status;
        if from_status != TaskStatus::InProgress {
            ensure_status_transition(&task, TaskStatus::InProgress)?;
            task.status = TaskStatus::InProgress;
        }
        task.stage = PipelineStage::Dev;
        task.updated_at = Utc::now();

        let event = AuditEvent::new(
            actor,
            AuditAction::StageChanged,
            EntityType::Task,
            task.id,
            json!({
                "from_stage": PipelineStage::None,
                "to_stage": PipelineStage::Dev,
                "from_status": from_status,
                "to_status": task.status,
            }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        debug!(task_id = %task.id, "task started");
        Ok(task)
    }

    /// Complete a task. Every blocker must already be `Done`.
    pub async fn mark_done(&self, actor: &str, id: Uuid) -> Result<Task> {
        let task = self.get(id).await?;
        self.complete(actor, task).await
    }

    pub async fn mark_failed(&self, actor: &str, id: Uuid) -> Result<Task> {
        self.set_status(actor, id, TaskStatus::Failed).await
    }

    pub async fn mark_in_progress(&self, actor: &str, id: Uuid) -> Result<Task> {
        self.set_status(actor, id, TaskStatus::InProgress).await
    }

    pub async fn mark_blocked(&self, actor: &str, id: Uuid) -> Result<Task> {
        self.set_status(actor, id, TaskStatus::Blocked).await
    }

    /// Move one stage forward along None → Dev → QA → Security → Docs → Complete.
    pub async fn advance_stage(&self, actor: &str, id: Uuid) -> Result<Task> {
        let task = self.get(id).await?;
        let Some(next) = task.stage.next() else {
            return Err(PipelineError::transition(task.stage, "(none)"));
        };
        self.move_to_stage(actor, task, next).await
    }

    /// Move forward to `target` if the task trails it. Never moves backwards.
    pub async fn advance_stage_to(
        &self,
        actor: &str,
        id: Uuid,
        target: PipelineStage,
    ) -> Result<Task> {
        let task = self.get(id).await?;
        if task.stage >= target {
            return Ok(task);
        }
        self.move_to_stage(actor, task, target).await
    }

    /// Raise a task's priority. Lower values are ignored.
    pub async fn boost_priority(&self, actor: &str, id: Uuid, priority: u8) -> Result<Task> {
        let priority = validate_priority(priority)?;
        let mut task = self.get(id).await?;
        if priority <= task.priority {
            return Ok(task);
        }
        let from = task.priority;
        task.priority = priority;
        task.updated_at = Utc::now();
        let event = AuditEvent::new(
            actor,
            AuditAction::PriorityBoosted,
            EntityType::Task,
            task.id,
            json!({ "from": from, "to": priority }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        debug!(task_id = %task.id, from, to = priority, "task priority boosted");
        Ok(task)
    }

    /// Ids in `blocked_by` that are not `Done`. Unknown ids count as unresolved.
    pub async fn unresolved_blockers(&self, task: &Task) -> Result<Vec<Uuid>> {
        if task.blocked_by.is_empty() {
            return Ok(Vec::new());
        }
        let statuses = self
            .store
            .task_statuses(task.blocked_by.iter().copied())
            .await?;
        Ok(task
            .blocked_by
            .iter()
            .filter(|id| statuses.get(id) != Some(&TaskStatus::Done))
            .copied()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn move_to_stage(&self, actor: &str, mut task: Task, target: PipelineStage) -> Result<Task> {
        if target == PipelineStage::Complete {
            return self.complete(actor, task).await;
        }
        if task.stage == PipelineStage::None {
            // Leaving None is starting the task.
            if task.status != TaskStatus::InProgress {
                ensure_status_transition(&task, TaskStatus::InProgress)?;
                task.status = TaskStatus::InProgress;
            }
        }
        let from = task.stage;
        task.stage = target;
        task.updated_at = Utc::now();
        let event = AuditEvent::new(
            actor,
            AuditAction::StageChanged,
            EntityType::Task,
            task.id,
            json!({ "from_stage": from, "to_stage": target }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        debug!(task_id = %task.id, from = %from, to = %target, "task stage advanced");
        Ok(task)
    }

    async fn complete(&self, actor: &str, mut task: Task) -> Result<Task> {
        ensure_status_transition(&task, TaskStatus::Done)?;
        if !self.unresolved_blockers(&task).await?.is_empty() {
            return Err(PipelineError::Blocked { id: task.id });
        }
        let now = Utc::now();
        let from_stage = task.stage;
        task.status = TaskStatus::Done;
        task.stage = PipelineStage::Complete;
        task.completed = true;
        task.completed_at.get_or_insert(now);
        task.updated_at = now;

        let event = AuditEvent::new(
            actor,
            AuditAction::StatusChanged,
            EntityType::Task,
            task.id,
            json!({
                "from_stage": from_stage,
                "to_stage": PipelineStage::Complete,
                "to_status": TaskStatus::Done,
            }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        info!(task_id = %task.id, "task done");
        Ok(task)
    }

    async fn set_status(&self, actor: &str, id: Uuid, target: TaskStatus) -> Result<Task> {
        let mut task = self.get(id).await?;
        ensure_status_transition(&task, target)?;
        let from = task.status;
        task.status = target;
        task.updated_at = Utc::now();
        let event = AuditEvent::new(
            actor,
            AuditAction::StatusChanged,
            EntityType::Task,
            task.id,
            json!({ "from": from, "to": target }),
        );
        self.store.save_task_with_audit(&task, &event).await?;
        debug!(task_id = %task.id, from = %from, to = %target, "task status changed");
        Ok(task)
    }

    async fn validate_blockers(&self, id: Uuid, blockers: &BTreeSet<Uuid>) -> Result<()> {
        if blockers.contains(&id) {
            return Err(PipelineError::InvalidInput(format!(
                "task {id} cannot block itself"
            )));
        }
        if blockers.is_empty() {
            return Ok(());
        }
        let known = self.store.task_statuses(blockers.iter().copied()).await?;
        if let Some(missing) = blockers.iter().find(|b| !known.contains_key(b)) {
            return Err(PipelineError::InvalidInput(format!(
                "unknown blocker task {missing}"
            )));
        }
        Ok(())
    }
}

fn validate_priority(priority: u8) -> Result<u8> {
    if !(TASK_PRIORITY_MIN..=TASK_PRIORITY_MAX).contains(&priority) {
        return Err(PipelineError::InvalidInput(format!(
            "priority must be between {TASK_PRIORITY_MIN} and {TASK_PRIORITY_MAX}, got {priority}"
        )));
    }
    Ok(priority)
}

fn ensure_status_transition(task: &Task, target: TaskStatus) -> Result<()> {
    if task.status.can_transition_to(&target) {
        Ok(())
    } else {
        Err(PipelineError::transition(task.status, target))
    }
}

fn not_found(id: Uuid) -> PipelineError {
    PipelineError::NotFound { entity: "task", id }
}
