//! The worker-side executor.
//!
//! Owns one engine flow and answers the four remote operations: `init`,
//! `process`, `useMethod` and `close`. Output envelopes are appended to a
//! caller-supplied outbox in the order they must be written.

use super::exit;
use super::pending::PendingResults;
use crate::engine::{Flow, Registry, Scope};
use crate::error::{Error, Result};
use crate::execution::{Call, Envelope, Initializer, Reply};
use crate::observability::WorkerMetrics;
use crate::value::Value;

/// Lifecycle of a worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for `init`.
    #[default]
    Uninitialized,
    /// Scope merged; waiting for `useMethod`. Items are backlogged.
    Initialized,
    /// Operation bound; items flow through the engine.
    Bound,
    /// `close` received; flushing trailing output.
    Draining,
    /// Done. The process is about to exit.
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Initialized => write!(f, "Initialized"),
            Self::Bound => write!(f, "Bound"),
            Self::Draining => write!(f, "Draining"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// What the serving loop does after handling an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Keep reading.
    Continue,
    /// Flush the outbox and exit with this status.
    Exit(u8),
}

/// Executes one bound operation for the coordinator.
pub struct WorkerExecutor {
    registry: Registry,
    env: Scope,
    state: WorkerState,
    flow: Option<Flow>,
    backlog: Vec<Value>,
    pending: PendingResults,
    metrics: WorkerMetrics,
}

impl WorkerExecutor {
    /// Create an executor resolving initializers against `registry`.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            env: Scope::new(),
            state: WorkerState::Uninitialized,
            flow: None,
            backlog: Vec::new(),
            pending: PendingResults::new(),
            metrics: WorkerMetrics::new("unbound"),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The worker environment.
    pub fn scope(&self) -> &Scope {
        &self.env
    }

    /// The pending-result queue.
    pub fn pending(&self) -> &PendingResults {
        &self.pending
    }

    /// Items waiting for `useMethod`.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Build the initializer's scope and merge it into the environment.
    pub fn init(&mut self, initializer: &Initializer) -> Result<Reply> {
        if self.state != WorkerState::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }

        let scope = self.registry.build(initializer)?;
        tracing::debug!(
            factory = %initializer.factory,
            functions = scope.len(),
            "worker initialized"
        );
        self.env.merge(scope);
        self.state = WorkerState::Initialized;
        Ok(Reply::Initialized)
    }

    /// Bind the engine to `method(args)` and replay the backlog.
    pub fn use_method(
        &mut self,
        method: &str,
        args: &[Value],
        out: &mut Vec<Envelope>,
    ) -> Result<Reply> {
        match self.state {
            WorkerState::Uninitialized => return Err(Error::NotInitialized),
            WorkerState::Initialized => {}
            _ => {
                let bound = self.flow.as_ref().map(Flow::method).unwrap_or_default();
                return Err(Error::AlreadyBound(bound.to_string()));
            }
        }

        let flow = Flow::bind(method, args, &self.env)?;
        tracing::Span::current().record("method", method);
        tracing::debug!(method, args = args.len(), "operation bound");

        self.metrics = WorkerMetrics::new(method);
        self.flow = Some(flow);
        self.state = WorkerState::Bound;

        for item in std::mem::take(&mut self.backlog) {
            self.accept(item, out)?;
        }
        Ok(Reply::MethodBound)
    }

    /// Accept one pushed item.
    ///
    /// Before `useMethod` the item waits in the backlog. Before `init` it is a
    /// protocol violation.
    pub fn process(&mut self, item: Value, out: &mut Vec<Envelope>) -> Result<()> {
        match self.state {
            WorkerState::Uninitialized => Err(Error::ProtocolViolation(
                "item pushed before init".into(),
            )),
            WorkerState::Initialized => {
                self.backlog.push(item);
                Ok(())
            }
            WorkerState::Bound => self.accept(item, out),
            state => Err(Error::ProtocolViolation(format!(
                "item pushed while {state}"
            ))),
        }
    }

    /// Finish input, flush trailing output and report the terminal value.
    pub fn close(&mut self, out: &mut Vec<Envelope>) -> Result<Reply> {
        if matches!(self.state, WorkerState::Draining | WorkerState::Terminated) {
            return Err(Error::ProtocolViolation("close after close".into()));
        }
        self.state = WorkerState::Draining;

        let terminal = match self.flow.as_mut() {
            Some(flow) => {
                let completion = flow.finish();
                for value in completion.trailing {
                    self.emit(value, out)?;
                }
                completion.terminal
            }
            None => None,
        };

        let dropped = self.pending.discard_remaining() + self.backlog.len();
        self.backlog.clear();
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
        }
        self.metrics.record_pending(0);

        tracing::debug!(
            accepted = self.pending.accepted(),
            resolved = self.pending.resolved(),
            dropped,
            "worker drained"
        );
        self.state = WorkerState::Terminated;
        Ok(Reply::Drained { terminal })
    }

    /// Handle one inbound envelope.
    pub fn handle(&mut self, envelope: Envelope, out: &mut Vec<Envelope>) -> Control {
        match envelope {
            Envelope::Call { id, call } => {
                let name = call.name();
                let result = match call {
                    Call::Init { initializer } => self.init(&initializer),
                    Call::UseMethod { method, args } => self.use_method(&method, &args, out),
                    Call::Close => self.close(out),
                };

                let drained = matches!(result, Ok(Reply::Drained { .. }));
                let fatal = match &result {
                    Err(e) if e.is_fatal() => {
                        tracing::error!(call = name, error = %e, "fatal call failure");
                        Some(e.exit_code())
                    }
                    Err(e) => {
                        tracing::debug!(call = name, error = %e, "call rejected");
                        None
                    }
                    Ok(_) => None,
                };

                out.push(Envelope::Response {
                    id,
                    outcome: result.into(),
                });

                match fatal {
                    Some(code) => Control::Exit(code),
                    None if drained => {
                        out.push(Envelope::Closed);
                        Control::Exit(exit::OK)
                    }
                    None => Control::Continue,
                }
            }
            Envelope::Push { values } => {
                for value in values {
                    if let Err(e) = self.process(value, out) {
                        tracing::error!(error = %e, "fatal push failure");
                        return Control::Exit(e.exit_code());
                    }
                }
                Control::Continue
            }
            Envelope::Kill => {
                tracing::debug!("killed");
                Control::Exit(exit::KILLED)
            }
            other => {
                tracing::error!(envelope = other.name(), "unexpected envelope from coordinator");
                Control::Exit(exit::PROTOCOL_VIOLATION)
            }
        }
    }

    fn accept(&mut self, item: Value, out: &mut Vec<Envelope>) -> Result<()> {
        let Some(flow) = self.flow.as_mut() else {
            return Err(Error::ProtocolViolation("no operation bound".into()));
        };
        let outcome = flow.accept(item);
        self.pending.enqueue();

        match outcome {
            Ok(Some(value)) => self.emit(value, out)?,
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::trace!(error = %e, "item faulted");
                self.metrics.record_fault();
                out.push(Envelope::Fault {
                    message: e.to_string(),
                });
            }
        }
        self.metrics.record_pending(self.pending.len());
        Ok(())
    }

    fn emit(&mut self, value: Value, out: &mut Vec<Envelope>) -> Result<()> {
        let entry = self.pending.resolve()?;
        self.metrics.record_latency(entry.accepted_at.elapsed());
        tracing::trace!(seq = entry.seq, "result emitted");
        out.push(Envelope::Pull { value });
        Ok(())
    }
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("state", &self.state)
            .field("flow", &self.flow)
            .field("pending", &self.pending.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
