use std::sync::Arc;

use cv_core::config::AGENT_RUN_JOB_TYPE;
use cv_core::store::Store;
use cv_core::types::*;
use cv_daemon::orchestrator::{AppliedOutcome, Orchestrator, OrchestratorSettings, WorkItem};
use cv_pipeline::{NewTask, RunStateMachine};
use cv_queue::{JobQueue, JobRequest};
use serde_json::json;

// ===========================================================================
// Harness
// ===========================================================================

async fn orchestrator_with(settings: OrchestratorSettings) -> Orchestrator {
    let store = Arc::new(Store::new_in_memory().await.expect("in-memory store"));
    let queue = Arc::new(JobQueue::new(Arc::clone(&store)));
    Orchestrator::new(RunStateMachine::new(store), queue, settings)
}

async fn orchestrator() -> Orchestrator {
    orchestrator_with(OrchestratorSettings::default()).await
}

/// A run in project "proj", advanced to Dev.
async fn dev_run(orch: &Orchestrator) -> Run {
    let sm = orch.machine();
    let run = sm.create_run("proj", "feature", "pm").await.expect("create run");
    sm.advance_state(run.id, "pm").await.expect("pm -> dev");
    sm.get_run(run.id).await.expect("get run")
}

/// Claim and complete the job for `item` with `report`.
async fn finish_with(orch: &Orchestrator, item: &WorkItem, report: ExecutionReport) -> Job {
    let queue = orch.queue();
    let (job, _) = queue
        .enqueue_unique(
            JobRequest::new(AGENT_RUN_JOB_TYPE, serde_json::to_value(item).expect("payload")),
            &item.job_key(),
        )
        .await
        .expect("enqueue");
    queue.claim(job.id, "test-worker").await.expect("claim");
    queue
        .complete(job.id, serde_json::to_value(report).expect("report"))
        .await
        .expect("complete")
}

// ===========================================================================
// process_run / dispatch
// ===========================================================================

#[tokio::test]
async fn process_run_starts_tasks_and_builds_work() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    let high = board.create("pm", NewTask::new("proj", "high").priority(9)).await.expect("high");
    let low = board.create("pm", NewTask::new("proj", "low").priority(2)).await.expect("low");

    let result = orch.process_run(run.id, 10).await.expect("process");
    assert_eq!(result.tasks_queued, 2);
    let ids: Vec<_> = result.work_queue.iter().map(|w| w.task_id).collect();
    assert_eq!(ids, vec![high.id, low.id]);
    for item in &result.work_queue {
        assert_eq!(item.stage, PipelineStage::Dev);
        assert_eq!(item.role, AgentRole::Dev);
    }
    let started = board.get(high.id).await.expect("get");
    assert_eq!(started.status, TaskStatus::InProgress);
    assert_eq!(started.stage, PipelineStage::Dev);
    assert_eq!(result.progress.total, 2);
}

#[tokio::test]
async fn process_run_skips_blocked_and_respects_limit() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    let first = board.create("pm", NewTask::new("proj", "first").priority(5)).await.expect("first");
    let blocked = board
        .create("pm", NewTask::new("proj", "blocked").priority(8).blocked_by([first.id]))
        .await
        .expect("blocked");
    let third = board.create("pm", NewTask::new("proj", "third").priority(1)).await.expect("third");
    board.create("pm", NewTask::new("proj", "fourth").priority(0)).await.expect("fourth");

    // The blocked task outranks both but does not use up a slot.
    let result = orch.process_run(run.id, 2).await.expect("process");
    let ids: Vec<_> = result.work_queue.iter().map(|w| w.task_id).collect();
    assert_eq!(ids, vec![first.id, third.id]);
    assert!(!ids.contains(&blocked.id));
}

#[tokio::test]
async fn tasks_ahead_of_the_run_do_not_starve_the_limit() {
    let orch = orchestrator_with(OrchestratorSettings {
        max_tasks_per_cycle: 2,
        ..OrchestratorSettings::default()
    })
    .await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    for title in ["a", "b"] {
        let task = board.create("pm", NewTask::new("proj", title).priority(9)).await.expect("task");
        board.start("pm", task.id).await.expect("start");
        board
            .advance_stage_to("pm", task.id, PipelineStage::Qa)
            .await
            .expect("to qa");
    }
    let c = board.create("pm", NewTask::new("proj", "c").priority(1)).await.expect("c");

    let summary = orch.run_cycle().await.expect("cycle");
    assert_eq!(summary.jobs_enqueued, 1);
    let result = orch.process_run(run.id, 2).await.expect("process");
    let ids: Vec<_> = result.work_queue.iter().map(|w| w.task_id).collect();
    assert_eq!(ids, vec![c.id]);
    assert_eq!(orch.machine().get_run(run.id).await.expect("run").state, RunState::Dev);
}

#[tokio::test]
async fn failed_tasks_do_not_use_up_the_limit() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    for title in ["x", "y"] {
        let task = board.create("pm", NewTask::new("proj", title).priority(9)).await.expect("task");
        board.start("pm", task.id).await.expect("start");
        board.mark_failed("pm", task.id).await.expect("fail");
    }
    let open = board.create("pm", NewTask::new("proj", "open").priority(1)).await.expect("open");

    let result = orch.process_run(run.id, 1).await.expect("process");
    let ids: Vec<_> = result.work_queue.iter().map(|w| w.task_id).collect();
    assert_eq!(ids, vec![open.id]);
}

#[tokio::test]
async fn sync_moves_tasks_up_to_the_run_floor() {
    let orch = orchestrator().await;
    let sm = orch.machine();
    let run = sm.create_run("proj", "feature", "pm").await.expect("run");
    let board = sm.board();
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("t");
    sm.force_set_state(run.id, RunState::Security, "admin").await.expect("force");

    let run = sm.get_run(run.id).await.expect("get");
    assert_eq!(orch.sync_task_stages_with_run(&run).await.expect("sync"), 1);
    let synced = board.get(task.id).await.expect("get");
    assert_eq!(synced.stage, PipelineStage::Security);
    assert_eq!(synced.status, TaskStatus::InProgress);

    // Forward only: a second sync is a no-op.
    assert_eq!(orch.sync_task_stages_with_run(&run).await.expect("sync"), 0);
}

#[tokio::test]
async fn sync_leaves_tasks_that_cannot_complete() {
    let orch = orchestrator().await;
    let sm = orch.machine();
    let run = sm.create_run("proj", "feature", "pm").await.expect("run");
    let board = sm.board();
    let blocker = board.create("pm", NewTask::new("proj", "blocker").priority(2)).await.expect("blocker");
    // Higher priority, so the sync visits it while its blocker is still open.
    let dependent = board
        .create("pm", NewTask::new("proj", "dependent").priority(9).blocked_by([blocker.id]))
        .await
        .expect("dependent");
    board.start("pm", blocker.id).await.expect("start");
    board.start("pm", dependent.id).await.expect("start");
    sm.force_set_state(run.id, RunState::Merged, "admin").await.expect("force");

    let run = sm.get_run(run.id).await.expect("get");
    assert_eq!(orch.sync_task_stages_with_run(&run).await.expect("sync"), 1);

    let blocker = board.get(blocker.id).await.expect("get");
    assert_eq!(blocker.status, TaskStatus::Done);
    let dependent = board.get(dependent.id).await.expect("get");
    assert_eq!(dependent.status, TaskStatus::InProgress);
    assert_eq!(dependent.stage, PipelineStage::Dev);

    // The next sync finishes it.
    assert_eq!(orch.sync_task_stages_with_run(&run).await.expect("sync"), 1);
    assert_eq!(board.get(dependent.id).await.expect("get").status, TaskStatus::Done);
}

#[tokio::test]
async fn dispatch_enqueues_once_per_task_stage() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    board.create("pm", NewTask::new("proj", "urgent").priority(10)).await.expect("urgent");
    board.create("pm", NewTask::new("proj", "normal").priority(5)).await.expect("normal");

    let result = orch.process_run(run.id, 10).await.expect("process");
    let first = orch.dispatch(&result).await.expect("dispatch");
    assert_eq!(first.enqueued.len(), 2);
    assert_eq!(first.already_queued, 0);

    let again = orch.dispatch(&result).await.expect("dispatch");
    assert!(again.enqueued.is_empty());
    assert_eq!(again.already_queued, 2);

    let next = orch
        .queue()
        .dequeue_next(None)
        .await
        .expect("dequeue")
        .expect("a job");
    assert_eq!(next.job_type, AGENT_RUN_JOB_TYPE);
    assert_eq!(next.priority, JobPriority::Critical);
    assert_eq!(next.dedupe_key, Some(result.work_queue[0].job_key()));
}

// ===========================================================================
// apply_job_outcome
// ===========================================================================

#[tokio::test]
async fn passing_dev_report_advances_task_and_run() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("t");

    let result = orch.process_run(run.id, 10).await.expect("process");
    let job = finish_with(&orch, &result.work_queue[0], ExecutionReport::pass("built")).await;

    let outcome = orch.apply_job_outcome(&job).await.expect("apply");
    assert_eq!(
        outcome,
        AppliedOutcome::Reported {
            state: RunState::Qa,
            passed: true
        }
    );
    assert_eq!(board.get(task.id).await.expect("get").stage, PipelineStage::Qa);
}

#[tokio::test]
async fn run_waits_while_stage_work_remains() {
    let orch = orchestrator().await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    board.create("pm", NewTask::new("proj", "a").priority(6)).await.expect("a");
    board.create("pm", NewTask::new("proj", "b").priority(4)).await.expect("b");

    let result = orch.process_run(run.id, 10).await.expect("process");
    let job = finish_with(&orch, &result.work_queue[0], ExecutionReport::pass("a done")).await;
    let outcome = orch.apply_job_outcome(&job).await.expect("apply");
    assert_eq!(
        outcome,
        AppliedOutcome::Reported {
            state: RunState::Dev,
            passed: true
        }
    );
}

#[tokio::test]
async fn failing_qa_report_loops_back_with_remediation() {
    let orch = orchestrator().await;
    let sm = orch.machine();
    let run = dev_run(&orch).await;
    let board = sm.board();
    let task = board.create("pm", NewTask::new("proj", "feature work")).await.expect("t");
    board.start("orchestrator", task.id).await.expect("start");
    sm.advance_state(run.id, "dev").await.expect("dev -> qa");

    let result = orch.process_run(run.id, 10).await.expect("process");
    let item = &result.work_queue[0];
    assert_eq!(item.role, AgentRole::Qa);
    let report = ExecutionReport::fail("tests red").with_detail("failing_tests", json!(["test_login"]));
    let job = finish_with(&orch, item, report).await;

    let outcome = orch.apply_job_outcome(&job).await.expect("apply");
    assert_eq!(
        outcome,
        AppliedOutcome::Reported {
            state: RunState::Dev,
            passed: false
        }
    );
    let titles: Vec<String> = board
        .list("proj")
        .await
        .expect("list")
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert!(titles.contains(&"Fix failing test: test_login".to_string()));
    // The task under test stays at QA until the run returns there.
    assert_eq!(board.get(task.id).await.expect("get").stage, PipelineStage::Qa);
}

#[tokio::test]
async fn failing_gate_without_loop_back_stays_failed() {
    let settings = OrchestratorSettings {
        auto_loop_back: false,
        ..OrchestratorSettings::default()
    };
    let orch = orchestrator_with(settings).await;
    let sm = orch.machine();
    let run = dev_run(&orch).await;
    let task = sm.board().create("pm", NewTask::new("proj", "t")).await.expect("t");
    sm.board().start("orchestrator", task.id).await.expect("start");
    sm.advance_state(run.id, "dev").await.expect("dev -> qa");

    let result = orch.process_run(run.id, 10).await.expect("process");
    let job = finish_with(&orch, &result.work_queue[0], ExecutionReport::fail("red")).await;
    let outcome = orch.apply_job_outcome(&job).await.expect("apply");
    assert_eq!(
        outcome,
        AppliedOutcome::Reported {
            state: RunState::QaFailed,
            passed: false
        }
    );
}

#[tokio::test]
async fn failed_attempts_fail_the_task_at_the_cap() {
    let settings = OrchestratorSettings {
        max_attempts: 2,
        ..OrchestratorSettings::default()
    };
    let orch = orchestrator_with(settings).await;
    let run = dev_run(&orch).await;
    let board = orch.machine().board();
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("t");
    let result = orch.process_run(run.id, 10).await.expect("process");
    let item = result.work_queue[0].clone();

    let mut outcomes = Vec::new();
    for attempt in 0..2 {
        let (job, created) = orch
            .queue()
            .enqueue_unique(
                JobRequest::new(AGENT_RUN_JOB_TYPE, serde_json::to_value(&item).expect("payload")),
                &item.job_key(),
            )
            .await
            .expect("enqueue");
        assert!(created, "attempt {attempt} should create a fresh job");
        orch.queue().claim(job.id, "w").await.expect("claim");
        let failed = orch.queue().fail(job.id, "agent crashed").await.expect("fail");
        outcomes.push(orch.apply_job_outcome(&failed).await.expect("apply"));
    }

    assert_eq!(
        outcomes,
        vec![
            AppliedOutcome::AttemptFailed {
                attempts: 1,
                task_failed: false
            },
            AppliedOutcome::AttemptFailed {
                attempts: 2,
                task_failed: true
            },
        ]
    );
    assert_eq!(board.get(task.id).await.expect("get").status, TaskStatus::Failed);
    let trail = board.store().audit_trail(task.id).await.expect("trail");
    assert_eq!(
        trail.iter().filter(|e| e.action == AuditAction::JobFailed).count(),
        2
    );

    // Failed tasks are not dispatched again.
    let result = orch.process_run(run.id, 10).await.expect("process");
    assert!(result.work_queue.is_empty());
}

#[tokio::test]
async fn unrelated_jobs_are_ignored() {
    let orch = orchestrator().await;
    let job = orch
        .queue()
        .enqueue(JobRequest::new("lint", json!({})))
        .await
        .expect("enqueue");
    orch.queue().claim(job.id, "w").await.expect("claim");
    let done = orch.queue().complete(job.id, json!({})).await.expect("complete");
    assert_eq!(orch.apply_job_outcome(&done).await.expect("apply"), AppliedOutcome::Ignored);
}

#[tokio::test]
async fn run_cycle_skips_pm_runs() {
    let orch = orchestrator().await;
    let sm = orch.machine();
    sm.create_run("proj", "planning", "pm").await.expect("run");
    sm.board().create("pm", NewTask::new("proj", "t")).await.expect("t");

    let summary = orch.run_cycle().await.expect("cycle");
    assert_eq!(summary.runs_processed, 0);
    assert_eq!(summary.jobs_enqueued, 0);
}

#[tokio::test]
async fn run_cycle_keeps_going_past_a_broken_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("conveyor.db");
    let store = Arc::new(Store::new(&path).await.expect("store"));
    let queue = Arc::new(JobQueue::new(Arc::clone(&store)));
    let orch = Orchestrator::new(RunStateMachine::new(store), queue, OrchestratorSettings::default());
    let sm = orch.machine();

    for project in ["broken", "proj"] {
        let run = sm.create_run(project, "feature", "pm").await.expect("run");
        sm.advance_state(run.id, "pm").await.expect("pm -> dev");
        sm.board().create("pm", NewTask::new(project, "work")).await.expect("task");
    }

    // A row the store can no longer decode makes every read of "broken" fail.
    let raw = tokio_rusqlite::Connection::open(&path).await.expect("raw connection");
    raw.call(|conn| {
        conn.execute("UPDATE tasks SET status = 'garbled' WHERE project = 'broken'", [])?;
        Ok(())
    })
    .await
    .expect("corrupt row");

    let summary = orch.run_cycle().await.expect("cycle");
    assert_eq!(summary.runs_failed, 1);
    assert_eq!(summary.runs_processed, 1);
    assert_eq!(summary.jobs_enqueued, 1);
    let pending = orch.queue().queue_status().await.expect("status");
    assert_eq!(pending.pending_by_type.get(AGENT_RUN_JOB_TYPE).copied(), Some(1));
}
