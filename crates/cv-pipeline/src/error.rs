use std::fmt::Display;

use cv_core::types::{AgentRole, RunState};
use uuid::Uuid;

/// Errors returned by the task board and the run state machine.
///
/// Only caller mistakes are errors. A failed quality gate moves the run into
/// its `*_Failed` state and is returned as a normal value.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The requested move is not in the transition table, or the entity
    /// changed underneath the caller.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A gated state was advanced before its owner submitted a report.
    #[error("report required: {role} must report before leaving {state}")]
    ReportRequired { state: RunState, role: AgentRole },

    #[error("authorization required: {actor} may not advance {state}")]
    AuthorizationRequired { state: RunState, actor: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// The task still has blockers that are not done.
    #[error("task {id} is blocked by unfinished tasks")]
    Blocked { id: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

impl PipelineError {
    pub fn transition(from: impl Display, to: impl Display) -> Self {
        PipelineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
