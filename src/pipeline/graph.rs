//! The pipeline namespace.
//!
//! A [`Pipeline`] owns the configuration shared by its stages, the stages
//! still alive and the names given to stages with [`Stage::as_name`].

use super::config::PipelineConfig;
use super::stage::{Stage, StageId, Termination};
use crate::engine::{CHUNK, FILTER, FILTER_MAP, FOR_EACH, MAP, REDUCE, REJECT, TAKE};
use crate::error::{Error, Result};
use crate::observability::init_metrics;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every stage of one pipeline.
///
/// Holds each live stage strongly and lets go of it once it is terminal.
pub(crate) struct Namespace {
    config: PipelineConfig,
    members: Mutex<HashMap<StageId, Stage>>,
    names: Mutex<HashMap<String, Stage>>,
    failures: Mutex<Vec<(StageId, Option<i32>)>>,
}

impl Namespace {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            members: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn admit(&self, stage: &Stage) {
        lock(&self.members).insert(stage.id(), stage.clone());
        // A stage can finish before it is admitted.
        if stage.is_terminal() {
            lock(&self.members).remove(&stage.id());
        }
    }

    pub(crate) fn register_name(&self, name: String, stage: &Stage) {
        tracing::debug!(stage = %stage.id(), %name, "stage named");
        lock(&self.names).insert(name, stage.clone());
        if stage.is_terminal() {
            lock(&self.names).retain(|_, s| s.id() != stage.id());
        }
    }

    pub(crate) fn release(&self, id: StageId, termination: &Termination) {
        if let Termination::Failed(code) = termination {
            lock(&self.failures).push((id, *code));
        }
        lock(&self.members).remove(&id);
        lock(&self.names).retain(|_, stage| stage.id() != id);
    }

    fn snapshot(&self) -> Vec<Stage> {
        // Stage locks are never taken under the members lock.
        let mut stages: Vec<Stage> = lock(&self.members).values().cloned().collect();
        stages.retain(|stage| !stage.is_terminal());
        stages.sort_by_key(Stage::id);
        stages
    }
}

/// A chain of stages and the namespace that owns them.
///
/// Dropping the pipeline kills every stage still alive.
///
/// # Example
///
/// ```rust,ignore
/// use forkline::prelude::*;
///
/// let pipeline = Pipeline::new(
///     PipelineConfig::default().with_initializer(Initializer::named("arith")),
/// )?;
///
/// let head = pipeline.filter_map("double_if_even").await?;
/// let tail = head.map("inc").await?;
/// let mut results = tail.results()?;
///
/// head.push([1, 2, 3, 4]);
/// head.close();
///
/// while let Some(value) = results.recv().await {
///     println!("{value}");   // 5, 9
/// }
/// ```
pub struct Pipeline {
    namespace: Arc<Namespace>,
}

impl Pipeline {
    /// Create a pipeline.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        init_metrics();
        tracing::debug!(name = %config.name, worker = %config.worker.program.display(), "pipeline created");
        Ok(Self {
            namespace: Arc::new(Namespace::new(config)),
        })
    }

    /// Create a pipeline configured from the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(PipelineConfig::from_env()?)
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        self.namespace.config()
    }

    /// Create a head stage running `method(args)`.
    pub async fn apply(&self, method: &str, args: Vec<Value>) -> Result<Stage> {
        Stage::spawn(&self.namespace, method, args).await
    }

    /// Head stage running `map(function)`.
    pub async fn map(&self, function: &str) -> Result<Stage> {
        self.apply(MAP, vec![function.into()]).await
    }

    /// Head stage running `filter(predicate)`.
    pub async fn filter(&self, predicate: &str) -> Result<Stage> {
        self.apply(FILTER, vec![predicate.into()]).await
    }

    /// Head stage running `reject(predicate)`.
    pub async fn reject(&self, predicate: &str) -> Result<Stage> {
        self.apply(REJECT, vec![predicate.into()]).await
    }

    /// Head stage running `filterMap(function)`.
    pub async fn filter_map(&self, function: &str) -> Result<Stage> {
        self.apply(FILTER_MAP, vec![function.into()]).await
    }

    /// Head stage running `forEach(function)`.
    pub async fn for_each(&self, function: &str) -> Result<Stage> {
        self.apply(FOR_EACH, vec![function.into()]).await
    }

    /// Head stage running `reduce(function, initial)`.
    pub async fn reduce(&self, function: &str, initial: impl Into<Value>) -> Result<Stage> {
        self.apply(REDUCE, vec![function.into(), initial.into()]).await
    }

    /// Head stage running `chunk(size)`.
    pub async fn chunk(&self, size: usize) -> Result<Stage> {
        self.apply(CHUNK, vec![Value::Int(size as i64)]).await
    }

    /// Head stage running `take(count)`.
    pub async fn take(&self, count: usize) -> Result<Stage> {
        self.apply(TAKE, vec![Value::Int(count as i64)]).await
    }

    /// A stage registered with [`Stage::as_name`], while it is alive.
    pub fn get(&self, name: &str) -> Option<Stage> {
        lock(&self.namespace.names).get(name).cloned()
    }

    /// Number of live stages.
    pub fn stages(&self) -> usize {
        lock(&self.namespace.members).len()
    }

    /// Wait until every stage is terminal.
    ///
    /// Returns the first worker failure, if any. Killed stages are not
    /// failures. Stages that are never closed keep this waiting.
    pub async fn join(&self) -> Result<()> {
        loop {
            let stages = self.namespace.snapshot();
            if stages.is_empty() {
                break;
            }
            for stage in stages {
                let _ = stage.closed().await;
            }
        }

        match lock(&self.namespace.failures).first() {
            Some((stage, code)) => {
                tracing::debug!(%stage, code = ?code, "pipeline joined with failure");
                Err(Error::WorkerExited { code: *code })
            }
            None => Ok(()),
        }
    }

    /// Kill every live stage.
    pub fn kill_all(&self) {
        for stage in self.namespace.snapshot() {
            stage.kill();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.kill_all();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config().name)
            .field("stages", &self.stages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig::default().with_call_timeout(Duration::ZERO);
        assert!(matches!(Pipeline::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_pipeline_joins() {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        assert_eq!(pipeline.stages(), 0);
        assert!(pipeline.get("missing").is_none());
        pipeline.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_operation_spawns_nothing() {
        // The worker path does not exist, so reaching spawn would be a Config error.
        let config = PipelineConfig::default()
            .with_worker(crate::execution::WorkerCommand::new("/nonexistent/worker"));
        let pipeline = Pipeline::new(config).unwrap();
        assert!(matches!(
            pipeline.apply("scatter", vec![]).await,
            Err(Error::UnknownOperation(name)) if name == "scatter"
        ));
        assert_eq!(pipeline.stages(), 0);
    }

    #[tokio::test]
    async fn test_missing_worker_fails_apply() {
        let config = PipelineConfig::default()
            .with_worker(crate::execution::WorkerCommand::new("/nonexistent/worker"));
        let pipeline = Pipeline::new(config).unwrap();
        assert!(matches!(
            pipeline.map("double").await,
            Err(Error::Config(_))
        ));
        assert_eq!(pipeline.stages(), 0);
    }
}
