//! Priority job queue backed by the SQLite store, plus the worker pool that
//! drains it.

pub mod error;
pub mod queue;
pub mod worker;

pub use error::{QueueError, Result};
pub use queue::{JobQueue, JobRequest, QueueStatus, WaitOutcome};
pub use worker::{Executor, ExecutorRegistry, JobEvent, WorkerConfig, WorkerPool};
