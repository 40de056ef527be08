//! Task board, gated run state machine and failure remediation.

pub mod error;
pub mod progress;
pub mod remediation;
pub mod state_machine;
pub mod tasks;

pub use error::{PipelineError, Result};
pub use progress::RunProgress;
pub use remediation::{create_tasks_from_findings, RemediationOptions, RemediationOutcome};
pub use state_machine::{ResetOutcome, RunStateMachine};
pub use tasks::{NewTask, TaskBoard, TaskUpdate};
