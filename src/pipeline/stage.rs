//! Coordinator-side stage proxy.
//!
//! A [`Stage`] is bound to one worker process running one operation. Applying
//! an operation to a stage spawns a new worker, links the new stage as this
//! stage's consumer and returns it. Results flow forward one stage at a time;
//! at the tail they are delivered through [`Stage::results`].
//!
//! Forwarding happens on the upstream stage's driver task while it holds its
//! own lock, so buffered results flushed at link time and live results can
//! never interleave out of order. Locks are always taken upstream first.

use super::events::{EventReceiver, EventSender, StageEvent};
use super::graph::Namespace;
use crate::engine::{
    CHUNK, FILTER, FILTER_MAP, FOR_EACH, MAP, REDUCE, REJECT, TAKE, is_operation,
};
use crate::error::{Error, Result};
use crate::execution::{Call, Envelope, Notification, PendingReply, Reply, WorkerHandle};
use crate::observability::{StageMetrics, span_stage};
use crate::value::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Global stage ID counter.
static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// How long a failed stage waits for its worker's exit status.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Unique identifier for a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl StageId {
    fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stage({})", self.0)
    }
}

/// Lifecycle of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting pushes.
    Active,
    /// `close` sent; waiting for the worker to drain.
    Draining,
    /// The worker drained.
    Closed,
    /// Killed by the caller.
    Killed,
    /// The worker went away without draining.
    Failed,
}

impl Lifecycle {
    /// Whether the stage will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Killed | Self::Failed)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Draining => write!(f, "Draining"),
            Self::Closed => write!(f, "Closed"),
            Self::Killed => write!(f, "Killed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Veto predicate run before values are forwarded to the worker.
pub type PushGuard = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Veto predicate run before `close` takes effect.
pub type CloseGuard = Arc<dyn Fn() -> bool + Send + Sync>;

/// How a stage ended.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Termination {
    Closed(Option<Value>),
    Killed,
    Failed(Option<i32>),
}

/// Where results go.
enum Consumer {
    /// Nobody yet; results are buffered.
    None,
    /// Forwarded into the next stage.
    Link(Weak<StageInner>),
    /// Sent to a [`ResultStream`].
    Subscriber(mpsc::UnboundedSender<Value>),
    /// A subscriber existed and its stream has ended.
    Finished,
}

struct StageState {
    lifecycle: Lifecycle,
    buffer: VecDeque<Value>,
    consumer: Consumer,
    drained: bool,
    worker: Option<Arc<WorkerHandle>>,
    close_reply: Option<PendingReply>,
}

pub(crate) struct StageInner {
    id: StageId,
    method: String,
    pid: Option<u32>,
    namespace: Weak<Namespace>,
    state: Mutex<StageState>,
    push_guards: Mutex<Vec<PushGuard>>,
    close_guards: Mutex<Vec<CloseGuard>>,
    events: EventSender,
    done: watch::Sender<Option<Termination>>,
    metrics: StageMetrics,
    span: tracing::Span,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One pipeline stage, bound to one worker process.
///
/// Cloning yields another handle to the same stage.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Spawn a worker, initialize it and bind `method(args)`.
    pub(crate) async fn spawn(
        namespace: &Arc<Namespace>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Stage> {
        if !is_operation(method) {
            return Err(Error::UnknownOperation(method.to_string()));
        }
        let config = namespace.config();
        let id = StageId::next();
        let span = span_stage(id.0, method);

        let (worker, notifications) = WorkerHandle::spawn(&config.worker, config.call_timeout)?;
        let init = worker.start_call(Call::Init {
            initializer: config.initializer.clone(),
        })?;
        let bind = worker.start_call(Call::UseMethod {
            method: method.to_string(),
            args,
        })?;

        let stage = Stage {
            inner: Arc::new(StageInner {
                id,
                method: method.to_string(),
                pid: worker.pid(),
                namespace: Arc::downgrade(namespace),
                state: Mutex::new(StageState {
                    lifecycle: Lifecycle::Active,
                    buffer: VecDeque::new(),
                    consumer: Consumer::None,
                    drained: false,
                    worker: Some(Arc::new(worker)),
                    close_reply: None,
                }),
                push_guards: Mutex::new(Vec::new()),
                close_guards: Mutex::new(Vec::new()),
                events: EventSender::new(config.event_capacity),
                done: watch::Sender::new(None),
                metrics: StageMetrics::new(&config.name, method),
                span: span.clone(),
            }),
        };

        tokio::spawn(drive(stage.clone(), notifications).instrument(span));

        if let Err(e) = stage.confirm(init, bind).await {
            tracing::debug!(stage = %id, error = %e, "stage setup failed");
            stage.discard();
            return Err(e);
        }

        namespace.admit(&stage);
        tracing::info!(parent: &stage.inner.span, pid = ?stage.inner.pid, "stage started");
        Ok(stage)
    }

    async fn confirm(&self, init: PendingReply, bind: PendingReply) -> Result<()> {
        match init.wait().await? {
            Reply::Initialized => {}
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "init answered with {other:?}"
                )));
            }
        }
        match bind.wait().await? {
            Reply::MethodBound => Ok(()),
            other => Err(Error::ProtocolViolation(format!(
                "useMethod answered with {other:?}"
            ))),
        }
    }

    /// Stage identifier.
    pub fn id(&self) -> StageId {
        self.inner.id
    }

    /// The operation this stage's worker runs.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        lock(&self.inner.state).lifecycle
    }

    /// Subscribe to this stage's events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Register a push guard. Guards run in registration order; the first
    /// one returning `false` suppresses the push.
    ///
    /// Guards run while the upstream stage holds its lock, so they must not
    /// call back into the pipeline.
    pub fn on_push<F>(&self, guard: F) -> &Self
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        lock(&self.inner.push_guards).push(Arc::new(guard));
        self
    }

    /// Register a close guard. The first one returning `false` vetoes `close`.
    pub fn on_close<F>(&self, guard: F) -> &Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        lock(&self.inner.close_guards).push(Arc::new(guard));
        self
    }

    /// Send values to the worker.
    ///
    /// Nothing is forwarded if a guard vetoes or the stage is no longer
    /// active. Never blocks.
    pub fn push<I>(&self, values: I) -> &Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.inner.push_values(values.into_iter().map(Into::into).collect());
        self
    }

    /// Push a list of values and return the stage.
    pub fn concat(&self, values: Vec<Value>) -> Stage {
        self.inner.push_values(values);
        self.clone()
    }

    /// Register this stage in the pipeline namespace under `name`.
    pub fn as_name(&self, name: impl Into<String>) -> Stage {
        match self.inner.namespace.upgrade() {
            Some(namespace) => namespace.register_name(name.into(), self),
            None => tracing::debug!(stage = %self.id(), "pipeline gone; name not registered"),
        }
        self.clone()
    }

    /// Ignore further pushes and make `close` behave as `kill`.
    pub fn drain(&self) -> Stage {
        lock(&self.inner.state).drained = true;
        self.clone()
    }

    /// Ask the worker to drain.
    ///
    /// The stage enters `Draining` and becomes `Closed` when the worker
    /// confirms. Calling it again while draining re-sends the request.
    /// No-op once the stage is terminal.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Terminate the worker immediately and release the stage.
    ///
    /// Results in flight are discarded. No-op once the stage is terminal.
    pub fn kill(&self) {
        self.inner.kill();
    }

    /// Wait for the stage to become terminal.
    ///
    /// Returns the terminal value of a reduce-like operation when closed,
    /// [`Error::Killed`] when killed and [`Error::WorkerExited`] when the
    /// worker failed.
    pub async fn closed(&self) -> Result<Option<Value>> {
        let mut done = self.inner.done.subscribe();
        let termination = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ChannelClosed)?
            .clone();

        match termination {
            Some(Termination::Closed(terminal)) => Ok(terminal),
            Some(Termination::Killed) => Err(Error::Killed),
            Some(Termination::Failed(code)) => Err(Error::WorkerExited { code }),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Take this stage's results as a stream.
    ///
    /// Buffered results come first. The stream ends when the stage is
    /// terminal. A stage has at most one consumer.
    pub fn results(&self) -> Result<ResultStream> {
        let mut state = lock(&self.inner.state);
        if !matches!(state.consumer, Consumer::None) {
            return Err(Error::AlreadyLinked);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for value in state.buffer.drain(..) {
            let _ = tx.send(value);
        }
        state.consumer = if state.lifecycle.is_terminal() {
            Consumer::Finished
        } else {
            Consumer::Subscriber(tx)
        };
        Ok(ResultStream { rx })
    }

    /// Apply an engine operation in a new worker and link it downstream.
    pub async fn apply(&self, method: &str, args: Vec<Value>) -> Result<Stage> {
        {
            let state = lock(&self.inner.state);
            if state.lifecycle == Lifecycle::Killed {
                return Err(Error::StageTerminated(self.id().to_string()));
            }
            if !matches!(state.consumer, Consumer::None) {
                return Err(Error::AlreadyLinked);
            }
        }
        let namespace = self
            .inner
            .namespace
            .upgrade()
            .ok_or_else(|| Error::StageTerminated(self.id().to_string()))?;

        let next = Stage::spawn(&namespace, method, args).await?;
        if let Err(e) = self.inner.link(&next) {
            next.kill();
            return Err(e);
        }
        tracing::debug!(parent: &self.inner.span, next = %next.id(), method, "stage linked");
        Ok(next)
    }

    /// `map(function, extra..)`.
    pub async fn map(&self, function: &str) -> Result<Stage> {
        self.apply(MAP, vec![function.into()]).await
    }

    /// `filter(predicate)`.
    pub async fn filter(&self, predicate: &str) -> Result<Stage> {
        self.apply(FILTER, vec![predicate.into()]).await
    }

    /// `reject(predicate)`.
    pub async fn reject(&self, predicate: &str) -> Result<Stage> {
        self.apply(REJECT, vec![predicate.into()]).await
    }

    /// `filterMap(function)`.
    pub async fn filter_map(&self, function: &str) -> Result<Stage> {
        self.apply(FILTER_MAP, vec![function.into()]).await
    }

    /// `forEach(function)`.
    pub async fn for_each(&self, function: &str) -> Result<Stage> {
        self.apply(FOR_EACH, vec![function.into()]).await
    }

    /// `reduce(function, initial)`. The result is returned by [`Stage::closed`].
    pub async fn reduce(&self, function: &str, initial: impl Into<Value>) -> Result<Stage> {
        self.apply(REDUCE, vec![function.into(), initial.into()]).await
    }

    /// `chunk(size)`.
    pub async fn chunk(&self, size: usize) -> Result<Stage> {
        self.apply(CHUNK, vec![Value::Int(size as i64)]).await
    }

    /// `take(count)`.
    pub async fn take(&self, count: usize) -> Result<Stage> {
        self.apply(TAKE, vec![Value::Int(count as i64)]).await
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lifecycle().is_terminal()
    }

    /// Kill without events; used when setup fails.
    fn discard(&self) {
        let worker = {
            let mut state = lock(&self.inner.state);
            state.lifecycle = Lifecycle::Killed;
            state.worker.take()
        };
        if let Some(worker) = worker {
            worker.kill();
        }
        self.inner.done.send_replace(Some(Termination::Killed));
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("pid", &self.inner.pid)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl StageInner {
    fn push_values(&self, values: Vec<Value>) {
        let guards = lock(&self.push_guards).clone();
        if !guards.iter().all(|guard| guard(&values)) {
            tracing::trace!(parent: &self.span, "push vetoed");
            return;
        }

        let state = lock(&self.state);
        if state.lifecycle != Lifecycle::Active || state.drained || values.is_empty() {
            return;
        }
        let Some(worker) = state.worker.as_ref() else {
            return;
        };

        let count = values.len();
        if let Err(e) = worker.send(Envelope::Push { values }) {
            tracing::debug!(parent: &self.span, error = %e, "push after worker channel closed");
            return;
        }
        self.metrics.record_pushed(count);
        if self.events.has_receivers() {
            self.events.send(StageEvent::Push {
                stage: self.id,
                count,
            });
        }
    }

    fn close(&self) {
        let guards = lock(&self.close_guards).clone();
        if !guards.iter().all(|guard| guard()) {
            tracing::trace!(parent: &self.span, "close vetoed");
            return;
        }

        let mut state = lock(&self.state);
        if state.drained {
            drop(state);
            self.kill();
            return;
        }
        if state.lifecycle.is_terminal() {
            return;
        }
        let Some(worker) = state.worker.clone() else {
            return;
        };

        match worker.start_call(Call::Close) {
            Ok(reply) => {
                if state.close_reply.is_none() {
                    state.close_reply = Some(reply);
                }
            }
            Err(e) => tracing::debug!(parent: &self.span, error = %e, "close after worker channel closed"),
        }
        state.lifecycle = Lifecycle::Draining;
        drop(state);

        tracing::debug!(parent: &self.span, "stage draining");
        self.events.send(StageEvent::Close { stage: self.id });
    }

    fn kill(&self) {
        let mut state = lock(&self.state);
        if state.lifecycle.is_terminal() {
            return;
        }
        self.events.send(StageEvent::Kill { stage: self.id });

        state.lifecycle = Lifecycle::Killed;
        state.buffer.clear();
        state.consumer = Consumer::None;
        state.close_reply = None;
        let worker = state.worker.take();
        drop(state);

        if let Some(worker) = worker {
            worker.kill();
        }
        tracing::info!(parent: &self.span, "stage killed");
        self.finish(Termination::Killed);
    }

    /// Attach `next` as this stage's consumer and flush the buffer into it.
    fn link(&self, next: &Stage) -> Result<()> {
        let mut state = lock(&self.state);
        if state.lifecycle == Lifecycle::Killed {
            return Err(Error::StageTerminated(self.id.to_string()));
        }
        if !matches!(state.consumer, Consumer::None) {
            return Err(Error::AlreadyLinked);
        }

        state.consumer = Consumer::Link(Arc::downgrade(&next.inner));
        let buffered: Vec<Value> = state.buffer.drain(..).collect();
        if !buffered.is_empty() {
            next.inner.push_values(buffered);
        }
        if matches!(state.lifecycle, Lifecycle::Closed | Lifecycle::Failed) {
            next.inner.close();
        }
        Ok(())
    }

    fn deliver(&self, value: Value) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.lifecycle == Lifecycle::Killed {
            return;
        }
        self.metrics.record_pulled();
        if self.events.has_receivers() {
            self.events.send(StageEvent::Pull {
                stage: self.id,
                value: value.clone(),
            });
        }

        match &state.consumer {
            Consumer::Link(next) => match next.upgrade() {
                Some(next) => next.push_values(vec![value]),
                None => tracing::trace!(parent: &self.span, "successor gone; result dropped"),
            },
            Consumer::Subscriber(tx) => {
                let _ = tx.send(value);
            }
            Consumer::None => state.buffer.push_back(value),
            Consumer::Finished => {}
        }
    }

    fn fault(&self, message: String) {
        if lock(&self.state).lifecycle == Lifecycle::Killed {
            return;
        }
        self.metrics.record_fault();
        tracing::warn!(parent: &self.span, %message, "item failed in worker");
        self.events.send(StageEvent::Fault {
            stage: self.id,
            message,
        });
    }

    /// Close the downstream consumer. Caller holds the state lock.
    fn end_consumer(state: &mut StageState) {
        if matches!(state.consumer, Consumer::Subscriber(_)) {
            state.consumer = Consumer::Finished;
        } else if let Consumer::Link(next) = &state.consumer {
            if let Some(next) = next.upgrade() {
                next.close();
            }
        }
    }

    async fn worker_closed(&self) {
        let reply = {
            let mut state = lock(&self.state);
            if state.lifecycle.is_terminal() {
                return;
            }
            state.close_reply.take()
        };

        let terminal = match reply {
            Some(reply) => match reply.wait().await {
                Ok(Reply::Drained { terminal }) => terminal,
                Ok(other) => {
                    tracing::warn!(parent: &self.span, reply = ?other, "unexpected close reply");
                    None
                }
                Err(e) => {
                    tracing::warn!(parent: &self.span, error = %e, "close reply lost");
                    None
                }
            },
            None => {
                tracing::debug!(parent: &self.span, "worker closed without close request");
                None
            }
        };

        let mut state = lock(&self.state);
        if state.lifecycle.is_terminal() {
            return;
        }
        state.lifecycle = Lifecycle::Closed;
        state.worker = None;
        Self::end_consumer(&mut state);
        drop(state);

        tracing::info!(parent: &self.span, terminal = ?terminal, "stage closed");
        self.events.send(StageEvent::Closed {
            stage: self.id,
            terminal: terminal.clone(),
        });
        self.finish(Termination::Closed(terminal));
    }

    async fn worker_disconnected(&self, reason: Option<String>) {
        let worker = {
            let state = lock(&self.state);
            if state.lifecycle.is_terminal() {
                return;
            }
            state.worker.clone()
        };

        let code = match worker {
            Some(worker) => tokio::time::timeout(EXIT_GRACE, worker.wait_exit())
                .await
                .ok()
                .and_then(|exit| exit.code),
            None => None,
        };

        let mut state = lock(&self.state);
        if state.lifecycle.is_terminal() {
            return;
        }
        state.lifecycle = Lifecycle::Failed;
        state.close_reply = None;
        state.worker = None;
        Self::end_consumer(&mut state);
        drop(state);

        tracing::error!(parent: &self.span, code = ?code, reason = ?reason, "worker failed");
        self.events.send(StageEvent::Failed {
            stage: self.id,
            code,
            reason,
        });
        self.finish(Termination::Failed(code));
    }

    /// Release the stage from the namespace, then publish the termination.
    fn finish(&self, termination: Termination) {
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.release(self.id, &termination);
        }
        self.done.send_replace(Some(termination));
    }
}

/// Per-stage driver: applies worker notifications in arrival order.
async fn drive(stage: Stage, mut notifications: mpsc::UnboundedReceiver<Notification>) {
    let inner = &stage.inner;
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Pull(value) => inner.deliver(value),
            Notification::Fault(message) => inner.fault(message),
            Notification::Closed => inner.worker_closed().await,
            Notification::Disconnected { reason } => {
                inner.worker_disconnected(reason).await;
                break;
            }
        }
    }
    tracing::trace!("stage driver finished");
}

/// Results delivered at the tail of a pipeline.
///
/// Implements [`futures::Stream`]; ends when the stage is terminal.
pub struct ResultStream {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl ResultStream {
    /// Receive the next result.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Collect every remaining result.
    pub async fn collect_all(mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = self.rx.recv().await {
            out.push(value);
        }
        out
    }
}

impl futures::Stream for ResultStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_terminal() {
        assert!(!Lifecycle::Active.is_terminal());
        assert!(!Lifecycle::Draining.is_terminal());
        assert!(Lifecycle::Closed.is_terminal());
        assert!(Lifecycle::Killed.is_terminal());
        assert!(Lifecycle::Failed.is_terminal());
    }

    #[test]
    fn test_stage_ids_are_unique() {
        let a = StageId::next();
        let b = StageId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", StageId(3)), "Stage(3)");
    }

    #[tokio::test]
    async fn test_result_stream_ends_with_sender() {
        use futures::StreamExt;

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = ResultStream { rx };
        tx.send(Value::Int(1)).unwrap();
        tx.send(Value::Int(2)).unwrap();
        drop(tx);

        let values: Vec<Value> = stream.collect().await;
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
    }
}
