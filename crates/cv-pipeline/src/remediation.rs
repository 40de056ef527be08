//! Turn a failing report into actionable tasks.
//!
//! Structured findings are read from the report's `details` under
//! `failing_tests`, `issues`, `vulnerabilities` and `findings`. Each entry
//! becomes one task at stage `Dev`. A finding whose title matches an open task
//! in the same project boosts that task instead of creating a duplicate.

use std::collections::BTreeSet;

use cv_core::types::{
    AgentReport, AuditAction, AuditEvent, Details, EntityType, PipelineStage, Task, TaskStatus,
    TASK_PRIORITY_MAX,
};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::tasks::TaskBoard;

/// Audit actor for every task created or boosted here.
pub const REMEDIATION_ACTOR: &str = "remediation";

const UMBRELLA_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct RemediationOptions {
    /// Also create an "Investigate ..." task covering the whole failure.
    pub umbrella: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationOutcome {
    pub created: Vec<Uuid>,
    pub boosted: Vec<Uuid>,
}

impl RemediationOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.boosted.is_empty()
    }
}

/// One actionable item pulled out of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub title: String,
    pub description: Option<String>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    FailingTest,
    Issue,
    Vulnerability,
    Finding,
}

impl FindingKind {
    const ALL: [FindingKind; 4] = [
        FindingKind::FailingTest,
        FindingKind::Issue,
        FindingKind::Vulnerability,
        FindingKind::Finding,
    ];

    fn details_key(&self) -> &'static str {
        match self {
            FindingKind::FailingTest => "failing_tests",
            FindingKind::Issue => "issues",
            FindingKind::Vulnerability => "vulnerabilities",
            FindingKind::Finding => "findings",
        }
    }

    fn title_prefix(&self) -> &'static str {
        match self {
            FindingKind::FailingTest => "Fix failing test",
            FindingKind::Issue => "Fix issue",
            FindingKind::Vulnerability => "Fix vulnerability",
            FindingKind::Finding => "Address finding",
        }
    }

    fn default_priority(&self) -> u8 {
        match self {
            FindingKind::FailingTest | FindingKind::Vulnerability => 8,
            FindingKind::Issue | FindingKind::Finding => 7,
        }
    }
}

impl Finding {
    pub fn task_title(&self) -> String {
        format!("{}: {}", self.kind.title_prefix(), self.title)
    }

    /// Severity mapped to a task priority, or the kind's default.
    pub fn priority(&self) -> u8 {
        self.severity
            .as_deref()
            .and_then(severity_priority)
            .unwrap_or_else(|| self.kind.default_priority())
    }
}

pub fn severity_priority(severity: &str) -> Option<u8> {
    match severity.trim().to_ascii_lowercase().as_str() {
        "critical" => Some(10),
        "high" => Some(9),
        "medium" => Some(7),
        "low" => Some(5),
        _ => None,
    }
}

/// Extract every structured finding from report details, in key order.
pub fn parse_findings(details: &Details) -> Vec<Finding> {
    let mut out = Vec::new();
    for kind in FindingKind::ALL {
        let Some(Value::Array(entries)) = details.get(kind.details_key()) else {
            continue;
        };
        out.extend(entries.iter().filter_map(|entry| parse_entry(kind, entry)));
    }
    out
}

fn parse_entry(kind: FindingKind, entry: &Value) -> Option<Finding> {
    match entry {
        Value::String(s) if !s.trim().is_empty() => Some(Finding {
            kind,
            title: s.trim().to_string(),
            description: None,
            severity: None,
        }),
        Value::Object(obj) => {
            let title = ["title", "name", "test", "id", "message", "description"]
                .iter()
                .filter_map(|key| obj.get(*key))
                .find_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })?;
            let description = ["description", "message"]
                .iter()
                .filter_map(|key| obj.get(*key).and_then(Value::as_str))
                .find(|d| d.trim() != title)
                .map(str::to_string);
            Some(Finding {
                kind,
                title,
                description,
                severity: obj
                    .get("severity")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

/// Create (or boost) one task per finding in `report`.
///
/// A failing report with no structured findings always yields an umbrella
/// task so the failure stays visible on the board.
pub async fn create_tasks_from_findings(
    board: &TaskBoard,
    project: &str,
    report: &AgentReport,
    options: RemediationOptions,
) -> Result<RemediationOutcome> {
    let findings = parse_findings(&report.details);
    let mut outcome = RemediationOutcome::default();
    let mut touched = BTreeSet::new();

    for finding in &findings {
        let description = finding.description.clone().unwrap_or_else(|| {
            format!("Reported by {} ({})", report.role, report.summary)
        });
        remediate(
            board,
            project,
            report,
            finding.task_title(),
            description,
            finding.priority(),
            &mut outcome,
            &mut touched,
        )
        .await?;
    }

    if options.umbrella || (findings.is_empty() && !report.passed()) {
        let title = format!("Investigate {} failure: {}", report.role, report.summary);
        remediate(
            board,
            project,
            report,
            title,
            report.summary.clone(),
            UMBRELLA_PRIORITY,
            &mut outcome,
            &mut touched,
        )
        .await?;
    }

    info!(
        run_id = %report.run_id,
        role = %report.role,
        created = outcome.created.len(),
        boosted = outcome.boosted.len(),
        "remediation tasks synthesized"
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn remediate(
    board: &TaskBoard,
    project: &str,
    report: &AgentReport,
    title: String,
    description: String,
    priority: u8,
    outcome: &mut RemediationOutcome,
    touched: &mut BTreeSet<Uuid>,
) -> Result<()> {
    let store = board.store();
    if let Some(existing) = store.find_open_task_by_title(project, &title).await? {
        // Repeated titles within one report touch the task once.
        if !touched.insert(existing.id) {
            return Ok(());
        }
        let boosted = (existing.priority.max(priority) + 1).min(TASK_PRIORITY_MAX);
        board
            .boost_priority(REMEDIATION_ACTOR, existing.id, boosted)
            .await?;
        outcome.boosted.push(existing.id);
        debug!(task_id = %existing.id, priority = boosted, "duplicate finding boosted task");
        return Ok(());
    }

    let mut task = Task::new(project, title)
        .with_priority(priority)
        .with_description(description);
    task.status = TaskStatus::InProgress;
    task.stage = PipelineStage::Dev;

    let event = AuditEvent::new(
        REMEDIATION_ACTOR,
        AuditAction::Created,
        EntityType::Task,
        task.id,
        json!({
            "title": task.title,
            "priority": task.priority,
            "run_id": report.run_id,
            "report_id": report.id,
            "role": report.role,
        }),
    );
    store.save_task_with_audit(&task, &event).await?;
    touched.insert(task.id);
    outcome.created.push(task.id);
    Ok(())
}
