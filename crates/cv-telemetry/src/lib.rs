//! Logging and metrics shared by the conveyor crates.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: thread-safe counters, gauges and histograms with Prometheus export

pub mod logging;
pub mod metrics;
