#![cfg(unix)]

use std::time::Duration;

use cv_core::types::{Job, JobPriority, ReportStatus};
use cv_daemon::executor::ProcessExecutor;
use cv_queue::Executor;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn job() -> Job {
    Job::new("agent_run", json!({ "task": "t-1" }), JobPriority::Normal, 60)
}

fn shell(script: &str) -> ProcessExecutor {
    ProcessExecutor::new("sh").args(["-c", script])
}

#[tokio::test]
async fn last_json_line_is_the_report() {
    let exec = shell(
        r#"cat >/dev/null; echo "starting"; echo '{"status":"pass","summary":"all green","details":{"tests":12}}'"#,
    );
    let report = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect("report");
    assert_eq!(report.status, ReportStatus::Pass);
    assert_eq!(report.summary, "all green");
    assert_eq!(report.details.get("tests"), Some(&json!(12)));
}

#[tokio::test]
async fn job_input_arrives_on_stdin() {
    // Echo the payload's task field back as the summary.
    let exec = shell(
        r#"input=$(cat); case "$input" in *'"task":"t-1"'*) s=seen;; *) s=missing;; esac; echo "{\"status\":\"pass\",\"summary\":\"$s\"}""#,
    );
    let report = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect("report");
    assert_eq!(report.summary, "seen");
}

#[tokio::test]
async fn env_is_passed_to_the_child() {
    let exec = shell(r#"cat >/dev/null; echo "{\"status\":\"fail\",\"summary\":\"$CV_ROLE\"}""#)
        .env("CV_ROLE", "qa");
    let report = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect("report");
    assert_eq!(report.status, ReportStatus::Fail);
    assert_eq!(report.summary, "qa");
}

#[tokio::test]
async fn nonzero_exit_carries_stderr() {
    let exec = shell("cat >/dev/null; echo 'lint exploded' >&2; exit 3");
    let err = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect_err("non-zero exit");
    let msg = err.to_string();
    assert!(msg.contains("exited with"), "{msg}");
    assert!(msg.contains("lint exploded"), "{msg}");
}

#[tokio::test]
async fn missing_report_is_an_error() {
    let exec = shell("cat >/dev/null; echo 'no report here'");
    let err = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect_err("no report");
    assert!(format!("{err:#}").contains("no JSON report line"));
}

#[tokio::test]
async fn missing_binary_fails_to_spawn() {
    let exec = ProcessExecutor::new("/nonexistent/conveyor-agent");
    let err = exec
        .execute(&job(), CancellationToken::new())
        .await
        .expect_err("spawn failure");
    assert!(err.to_string().contains("spawning"));
}

#[tokio::test]
async fn cancellation_kills_the_child() {
    let exec = shell("sleep 30");
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = exec.execute(&job(), token).await.expect_err("cancelled");
    assert_eq!(err.to_string(), "cancelled");
    assert!(started.elapsed() < Duration::from_secs(10));
}
