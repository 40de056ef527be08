use std::sync::Arc;

use cv_core::store::Store;
use cv_core::types::*;
use cv_pipeline::{NewTask, PipelineError, TaskBoard, TaskUpdate};
use rstest::rstest;

async fn board() -> TaskBoard {
    let store = Store::new_in_memory().await.expect("in-memory store");
    TaskBoard::new(Arc::new(store))
}

#[tokio::test]
async fn create_defaults() {
    let board = board().await;
    let task = board
        .create("pm", NewTask::new("proj", "  write parser "))
        .await
        .expect("create");
    assert_eq!(task.title, "write parser");
    assert_eq!(task.priority, TASK_PRIORITY_DEFAULT);
    assert_eq!(task.status, TaskStatus::Backlog);
    assert_eq!(task.stage, PipelineStage::None);

    let trail = board.store().audit_trail(task.id).await.expect("trail");
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::Created);
}

#[rstest]
#[case(0)]
#[case(11)]
#[case(255)]
#[tokio::test]
async fn out_of_range_priority_is_rejected(#[case] priority: u8) {
    let board = board().await;
    let err = board
        .create("pm", NewTask::new("proj", "bad").priority(priority))
        .await
        .expect_err("invalid priority");
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn unknown_blocker_is_rejected() {
    let board = board().await;
    let err = board
        .create(
            "pm",
            NewTask::new("proj", "dependent").blocked_by([uuid::Uuid::new_v4()]),
        )
        .await
        .expect_err("unknown blocker");
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn mark_done_requires_blockers_done() {
    let board = board().await;
    let t1 = board.create("pm", NewTask::new("proj", "t1")).await.expect("t1");
    let t2 = board
        .create("pm", NewTask::new("proj", "t2").blocked_by([t1.id]))
        .await
        .expect("t2");
    board.start("orch", t1.id).await.expect("start t1");
    board.start("orch", t2.id).await.expect("start t2");

    let err = board.mark_done("orch", t2.id).await.expect_err("blocked");
    assert!(matches!(err, PipelineError::Blocked { id } if id == t2.id));
    let unchanged = board.get(t2.id).await.expect("get");
    assert_eq!(unchanged.status, TaskStatus::InProgress);
    assert!(unchanged.completed_at.is_none());

    board.mark_done("orch", t1.id).await.expect("t1 done");
    let done = board.mark_done("orch", t2.id).await.expect("t2 done");
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.stage, PipelineStage::Complete);
    assert!(done.completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn done_is_terminal() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");
    board.start("orch", task.id).await.expect("start");
    let done = board.mark_done("orch", task.id).await.expect("done");
    let completed_at = done.completed_at;

    for result in [
        board.mark_in_progress("orch", task.id).await,
        board.mark_failed("orch", task.id).await,
        board.mark_done("orch", task.id).await,
    ] {
        assert!(matches!(result, Err(PipelineError::InvalidTransition { .. })));
    }
    let reloaded = board.get(task.id).await.expect("get");
    assert_eq!(reloaded.completed_at, completed_at);
}

#[tokio::test]
async fn advance_stage_walks_the_pipeline() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");

    let mut stages = Vec::new();
    let mut current = task;
    while current.stage != PipelineStage::Complete {
        current = board.advance_stage("orch", current.id).await.expect("advance");
        stages.push(current.stage);
    }
    assert_eq!(
        stages,
        vec![
            PipelineStage::Dev,
            PipelineStage::Qa,
            PipelineStage::Security,
            PipelineStage::Docs,
            PipelineStage::Complete,
        ]
    );
    assert_eq!(current.status, TaskStatus::Done);

    let err = board.advance_stage("orch", current.id).await.expect_err("past complete");
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn advance_stage_to_is_forward_only() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");
    board.start("orch", task.id).await.expect("start");
    let at_security = board
        .advance_stage_to("orch", task.id, PipelineStage::Security)
        .await
        .expect("advance");
    assert_eq!(at_security.stage, PipelineStage::Security);

    let still = board
        .advance_stage_to("orch", task.id, PipelineStage::Dev)
        .await
        .expect("no-op");
    assert_eq!(still.stage, PipelineStage::Security);
}

#[tokio::test]
async fn start_only_from_none_stage() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");
    let started = board.start("orch", task.id).await.expect("start");
    assert_eq!(started.stage, PipelineStage::Dev);
    assert_eq!(started.status, TaskStatus::InProgress);

    let err = board.start("orch", task.id).await.expect_err("already started");
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn blocked_and_failed_transitions() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");
    board.mark_blocked("orch", task.id).await.expect("blocked");
    board.mark_in_progress("orch", task.id).await.expect("unblocked");
    let failed = board.mark_failed("orch", task.id).await.expect("failed");
    assert_eq!(failed.status, TaskStatus::Failed);
    board.mark_in_progress("orch", task.id).await.expect("retry");
}

#[tokio::test]
async fn update_fields() {
    let board = board().await;
    let blocker = board.create("pm", NewTask::new("proj", "blocker")).await.expect("b");
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("t");

    let updated = board
        .update(
            "pm",
            task.id,
            TaskUpdate {
                title: Some("renamed".into()),
                description: Some(Some("details".into())),
                priority: Some(9),
                blocked_by: Some([blocker.id].into_iter().collect()),
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.title, "renamed");
    assert_eq!(updated.priority, 9);
    assert!(updated.blocked_by.contains(&blocker.id));

    let err = board
        .update(
            "pm",
            task.id,
            TaskUpdate {
                blocked_by: Some([task.id].into_iter().collect()),
                ..Default::default()
            },
        )
        .await
        .expect_err("self block");
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn boost_priority_only_raises() {
    let board = board().await;
    let task = board
        .create("pm", NewTask::new("proj", "t").priority(6))
        .await
        .expect("create");
    assert_eq!(board.boost_priority("pm", task.id, 4).await.expect("noop").priority, 6);
    assert_eq!(board.boost_priority("pm", task.id, 8).await.expect("boost").priority, 8);
}

#[tokio::test]
async fn delete_is_administrative() {
    let board = board().await;
    let task = board.create("pm", NewTask::new("proj", "t")).await.expect("create");
    board.delete("human", task.id).await.expect("delete");
    assert!(matches!(
        board.get(task.id).await,
        Err(PipelineError::NotFound { entity: "task", .. })
    ));
    assert!(matches!(
        board.delete("human", task.id).await,
        Err(PipelineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn list_open_excludes_done() {
    let board = board().await;
    let a = board.create("pm", NewTask::new("proj", "a").priority(3)).await.expect("a");
    board.create("pm", NewTask::new("proj", "b").priority(9)).await.expect("b");
    board.start("orch", a.id).await.expect("start");
    board.mark_done("orch", a.id).await.expect("done");

    let open = board.list_open("proj", None).await.expect("open");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].title, "b");
    assert_eq!(board.list("proj").await.expect("all").len(), 2);
}
