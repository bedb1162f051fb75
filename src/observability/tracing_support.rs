//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "FORKLINE_LOG";

/// Create a span for a coordinator-side stage.
///
/// # Example
///
/// ```rust,ignore
/// use forkline::observability::span_stage;
///
/// let span = span_stage(3, "map");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_stage(stage: u64, method: &str) -> Span {
    span!(Level::INFO, "stage", id = stage, method = %method)
}

/// Create a span for a worker process.
///
/// The method is recorded once the worker is bound.
#[inline]
pub fn span_worker(pid: u32) -> Span {
    span!(Level::INFO, "worker", pid = pid, method = tracing::field::Empty)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a fmt subscriber writing to stderr.
///
/// The filter is read from `FORKLINE_LOG`, then `RUST_LOG`, defaulting to
/// `warn`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let _span = span_stage(1, "map");
        let span = span_worker(42);
        span.record("method", "filter");
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
