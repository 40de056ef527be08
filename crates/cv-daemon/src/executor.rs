use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cv_core::config::ExecutorConfig;
use cv_core::types::{ExecutionReport, Job};
use cv_queue::Executor;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes of stderr kept in the error of a failed process.
const STDERR_TAIL: usize = 2048;

/// Runs a job as an external process.
///
/// The child receives `{"job_id", "job_type", "payload"}` as JSON on stdin
/// and must print an [`ExecutionReport`] as the last JSON line of stdout.
/// A non-zero exit is an error. The child is killed when the job is
/// cancelled.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<String>,
}

impl ProcessExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl From<&ExecutorConfig> for ProcessExecutor {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
            working_dir: cfg.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> Result<ExecutionReport> {
        info!(job_id = %job.id, command = %self.command, "spawning executor process");
        let mut child = self
            .build_command()
            .spawn()
            .with_context(|| format!("spawning '{}'", self.command))?;

        let input = json!({
            "job_id": job.id,
            "job_type": job.job_type,
            "payload": job.payload,
        });
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(&input).context("encoding job input")?;
            match stdin.write_all(&bytes).await {
                Ok(()) => {}
                // The child may exit without reading its input.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(job_id = %job.id, "executor closed stdin early");
                }
                Err(e) => return Err(e).context("writing job input"),
            }
        }

        // Dropping the child on cancellation kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output.context("waiting for executor process")?,
            _ = cancel.cancelled() => {
                warn!(job_id = %job.id, "executor process cancelled");
                bail!("cancelled");
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                tail(stderr.trim(), STDERR_TAIL)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_report(&stdout).with_context(|| format!("reading report from '{}'", self.command))
    }
}

/// The last stdout line that parses as an [`ExecutionReport`].
pub fn parse_report(stdout: &str) -> Result<ExecutionReport> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<ExecutionReport>(line).ok())
        .context("no JSON report line on stdout")
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
