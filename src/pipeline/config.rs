//! Pipeline configuration.

use crate::error::{Error, Result};
use crate::execution::{Initializer, WorkerCommand};
use std::time::Duration;

/// Environment variable naming the worker executable.
pub const WORKER_ENV: &str = "FORKLINE_WORKER";
/// Environment variable holding the call timeout in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "FORKLINE_CALL_TIMEOUT_MS";
/// Environment variable naming the initializer factory.
pub const INIT_ENV: &str = "FORKLINE_INIT";

/// Configuration shared by every stage of a pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Pipeline name, used in logs and metric labels.
    pub name: String,
    /// How to launch workers.
    pub worker: WorkerCommand,
    /// Sent as the first call to every worker.
    pub initializer: Initializer,
    /// Deadline for `init`, `useMethod` and close acknowledgements.
    pub call_timeout: Duration,
    /// Capacity of each stage's event channel.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "forkline".to_string(),
            worker: WorkerCommand::default_worker(),
            initializer: Initializer::blank(),
            call_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Set the pipeline name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker command.
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    /// Set the initializer.
    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Set the call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Defaults overridden by `FORKLINE_WORKER`, `FORKLINE_CALL_TIMEOUT_MS`
    /// and `FORKLINE_INIT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(program) = lookup(WORKER_ENV).filter(|s| !s.is_empty()) {
            config.worker = WorkerCommand::new(program);
        }
        if let Some(ms) = lookup(CALL_TIMEOUT_ENV) {
            let ms: u64 = ms.trim().parse().map_err(|e| {
                Error::Config(format!("{CALL_TIMEOUT_ENV}={ms:?}: {e}"))
            })?;
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(factory) = lookup(INIT_ENV).filter(|s| !s.is_empty()) {
            config.initializer = Initializer::named(factory);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call_timeout must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be non-zero".into()));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(Error::Config("worker program is empty".into()));
        }
        Ok(())
    }
}
