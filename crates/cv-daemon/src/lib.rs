//! Background daemon for the conveyor pipeline.
//!
//! The daemon provides:
//! - dependency-aware task scheduling
//! - the orchestrator that turns open tasks into agent jobs and feeds results
//!   back into the run state machine
//! - patrol sweeps over the job queue
//! - process-backed executors and a supervisor handle for shutdown

pub mod daemon;
pub mod executor;
pub mod orchestrator;
pub mod patrol;
pub mod scheduler;
pub mod supervisor;
