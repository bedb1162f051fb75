//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const ITEMS_PUSHED: &str = "forkline_items_pushed";
const RESULTS_PULLED: &str = "forkline_results_pulled";
const ITEMS_DROPPED: &str = "forkline_items_dropped";
const FAULTS: &str = "forkline_faults";
const WORKERS_SPAWNED: &str = "forkline_workers_spawned";
const WORKERS_ACTIVE: &str = "forkline_workers_active";
const PENDING_RESULTS: &str = "forkline_pending_results";
const RESULT_LATENCY_NS: &str = "forkline_result_latency_ns";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(ITEMS_PUSHED, Unit::Count, "Items sent to worker processes");
    metrics::describe_counter!(
        RESULTS_PULLED,
        Unit::Count,
        "Results received from worker processes"
    );
    metrics::describe_counter!(
        ITEMS_DROPPED,
        Unit::Count,
        "Pending entries discarded when a worker drained"
    );
    metrics::describe_counter!(FAULTS, Unit::Count, "Items that failed to evaluate");
    metrics::describe_counter!(WORKERS_SPAWNED, Unit::Count, "Worker processes started");
    metrics::describe_gauge!(WORKERS_ACTIVE, Unit::Count, "Worker processes still running");
    metrics::describe_gauge!(
        PENDING_RESULTS,
        Unit::Count,
        "Items accepted by a worker and still awaiting a result"
    );
    metrics::describe_histogram!(
        RESULT_LATENCY_NS,
        Unit::Nanoseconds,
        "Time from accepting an item to emitting the result that consumed its entry"
    );
}

/// Record a worker process being started.
#[inline]
pub fn record_worker_spawned() {
    counter!(WORKERS_SPAWNED).increment(1);
    gauge!(WORKERS_ACTIVE).increment(1.0);
}

/// Record a worker process going away.
#[inline]
pub fn record_worker_exited() {
    gauge!(WORKERS_ACTIVE).decrement(1.0);
}

/// Coordinator-side metrics for one stage.
#[derive(Clone)]
pub struct StageMetrics {
    pushed: Counter,
    pulled: Counter,
    faults: Counter,
}

impl StageMetrics {
    /// Create a collector labelled with the pipeline and operation.
    pub fn new(pipeline: &str, method: &str) -> Self {
        Self {
            pushed: counter!(
                ITEMS_PUSHED,
                "pipeline" => pipeline.to_string(),
                "method" => method.to_string()
            ),
            pulled: counter!(
                RESULTS_PULLED,
                "pipeline" => pipeline.to_string(),
                "method" => method.to_string()
            ),
            faults: counter!(
                FAULTS,
                "pipeline" => pipeline.to_string(),
                "method" => method.to_string()
            ),
        }
    }

    /// Record items forwarded to the worker.
    #[inline]
    pub fn record_pushed(&self, count: usize) {
        self.pushed.increment(count as u64);
    }

    /// Record a result received from the worker.
    #[inline]
    pub fn record_pulled(&self) {
        self.pulled.increment(1);
    }

    /// Record a fault reported by the worker.
    #[inline]
    pub fn record_fault(&self) {
        self.faults.increment(1);
    }
}

/// Worker-side metrics.
#[derive(Clone)]
pub struct WorkerMetrics {
    pending: Gauge,
    latency: Histogram,
    dropped: Counter,
    faults: Counter,
}

impl WorkerMetrics {
    /// Create a collector labelled with the bound operation.
    pub fn new(method: &str) -> Self {
        Self {
            pending: gauge!(PENDING_RESULTS, "method" => method.to_string()),
            latency: histogram!(RESULT_LATENCY_NS, "method" => method.to_string()),
            dropped: counter!(ITEMS_DROPPED, "method" => method.to_string()),
            faults: counter!(FAULTS, "method" => method.to_string()),
        }
    }

    /// Record the pending-result queue depth.
    #[inline]
    pub fn record_pending(&self, depth: usize) {
        self.pending.set(depth as f64);
    }

    /// Record how long a result waited for its entry.
    #[inline]
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed.as_nanos() as f64);
    }

    /// Record entries discarded at close.
    #[inline]
    pub fn record_dropped(&self, count: usize) {
        self.dropped.increment(count as u64);
    }

    /// Record an evaluation failure.
    #[inline]
    pub fn record_fault(&self) {
        self.faults.increment(1);
    }
}
