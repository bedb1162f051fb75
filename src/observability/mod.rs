//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! forkline exposes the following metrics through `metrics-rs`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `forkline_items_pushed` | Counter | Items sent to a worker |
//! | `forkline_results_pulled` | Counter | Results received from a worker |
//! | `forkline_items_dropped` | Counter | Pending entries discarded at close |
//! | `forkline_faults` | Counter | Items that failed to evaluate |
//! | `forkline_workers_spawned` | Counter | Worker processes started |
//! | `forkline_workers_active` | Gauge | Worker processes still running |
//! | `forkline_pending_results` | Gauge | Items awaiting a result in a worker |
//! | `forkline_result_latency_ns` | Histogram | Accept-to-emit time per result |
//!
//! No exporter is installed; use any `metrics` recorder to collect them.
//!
//! ## Tracing
//!
//! Coordinator code runs inside [`span_stage`] spans and workers inside
//! [`span_worker`]. Worker processes log to stderr, since stdout carries
//! frames. The filter comes from `FORKLINE_LOG`, then `RUST_LOG`.

mod metrics;
mod tracing_support;

pub use metrics::{
    StageMetrics, WorkerMetrics, init_metrics, record_worker_exited, record_worker_spawned,
};
pub use tracing_support::{LOG_ENV, init_tracing, span_stage, span_worker};
