//! Worker process spawning and the coordinator end of its channel.
//!
//! A [`WorkerHandle`] owns one child process and three tasks:
//!
//! - a writer that frames outbound envelopes onto the child's stdin
//! - a reader that decodes the child's stdout, resolving call responses by id
//!   and forwarding notifications in arrival order
//! - an exit monitor that reaps the child and applies forced kills

use super::protocol::{Call, Envelope, Outcome, Reply, read_frame, write_frame};
use crate::error::{Error, Result};
use crate::observability::{record_worker_exited, record_worker_spawned};
use crate::value::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// Default worker executable name.
pub const DEFAULT_WORKER: &str = "forkline-worker";

/// How long to wait for an exit status after the channel ends.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How to launch a worker process.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerCommand {
    /// Executable path.
    pub program: PathBuf,
    /// Extra arguments.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// `forkline-worker` next to the current executable, or on `PATH`.
    pub fn default_worker() -> Self {
        let beside = std::env::current_exe().ok().and_then(|exe| {
            let dir = exe.parent()?;
            // Test binaries live one level below the build directory.
            [dir.to_path_buf(), dir.parent()?.to_path_buf()]
                .into_iter()
                .map(|d| d.join(DEFAULT_WORKER))
                .find(|p| p.is_file())
        });
        Self::new(beside.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER)))
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::default_worker()
    }
}

/// How a worker process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit status code; `None` if the process was ended by a signal.
    pub code: Option<i32>,
}

/// A notification from a worker, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A result.
    Pull(Value),
    /// An item failed to evaluate.
    Fault(String),
    /// The worker drained.
    Closed,
    /// The channel ended. Always the last notification.
    Disconnected {
        /// Why reading stopped, if not a clean end of stream.
        reason: Option<String>,
    },
}

/// Outstanding calls by id; `None` once the reader has stopped.
type PendingCalls = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Outcome>>>>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call sent to a worker whose response has not been awaited yet.
#[must_use = "a pending reply does nothing unless waited on"]
pub struct PendingReply {
    call: &'static str,
    rx: oneshot::Receiver<Outcome>,
    timeout: Duration,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl PendingReply {
    /// Name of the call this reply answers.
    pub fn call(&self) -> &'static str {
        self.call
    }

    /// Wait for the response.
    ///
    /// Fails with [`Error::Timeout`] after the call timeout and with
    /// [`Error::WorkerExited`] if the worker goes away first.
    pub async fn wait(self) -> Result<Reply> {
        let Self {
            call,
            rx,
            timeout,
            mut exit,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => {
                let code = tokio::time::timeout(EXIT_GRACE, exit.wait_for(Option::is_some))
                    .await
                    .ok()
                    .and_then(|r| r.ok().and_then(|s| *s))
                    .and_then(|e| e.code);
                Err(Error::WorkerExited { code })
            }
            Err(_) => Err(Error::Timeout {
                call,
                after: timeout,
            }),
        }
    }
}

/// Coordinator-side handle to one worker process.
pub struct WorkerHandle {
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: PendingCalls,
    next_id: AtomicU64,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<WorkerExit>>,
    call_timeout: Duration,
}

impl WorkerHandle {
    /// Spawn a worker and start its channel tasks.
    ///
    /// Must be called within a tokio runtime. Returns the handle and the
    /// worker's notification stream.
    pub fn spawn(
        command: &WorkerCommand,
        call_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        let mut child = command.command().spawn().map_err(|e| {
            Error::Config(format!(
                "failed to spawn worker {}: {e}",
                command.program.display()
            ))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Config("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Config("worker stdout not piped".into()))?;

        record_worker_spawned();
        tracing::debug!(pid = ?pid, program = %command.program.display(), "worker spawned");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit) = watch::channel(None);
        let pending: PendingCalls = Arc::new(Mutex::new(Some(HashMap::new())));

        tokio::spawn(write_loop(stdin, outbound_rx, pid));
        tokio::spawn(read_loop(stdout, pending.clone(), notify_tx, pid));
        tokio::spawn(monitor_exit(child, kill_rx, exit_tx));

        Ok((
            Self {
                pid,
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                kill_tx: Mutex::new(Some(kill_tx)),
                exit,
                call_timeout,
            },
            notify_rx,
        ))
    }

    /// OS process id, if the process was still running at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue an envelope for the worker. Never blocks.
    ///
    /// Only coordinator envelopes (`Call`, `Push`, `Kill`) may be sent.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !envelope.is_command() {
            return Err(Error::ProtocolViolation(format!(
                "`{}` cannot be sent to a worker",
                envelope.name()
            )));
        }
        self.outbound
            .send(envelope)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Send a call now and return a handle to its response.
    ///
    /// Calls started in sequence reach the worker in that sequence.
    pub fn start_call(&self, call: Call) -> Result<PendingReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = call.name();
        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(calls) => calls.insert(id, tx),
            None => return Err(Error::ChannelClosed),
        };

        if let Err(e) = self.send(Envelope::Call { id, call }) {
            if let Some(calls) = lock(&self.pending).as_mut() {
                calls.remove(&id);
            }
            return Err(e);
        }

        Ok(PendingReply {
            call: name,
            rx,
            timeout: self.call_timeout,
            exit: self.exit.clone(),
        })
    }

    /// Send a call and wait for its response.
    pub async fn call(&self, call: Call) -> Result<Reply> {
        self.start_call(call)?.wait().await
    }

    /// Terminate the worker immediately.
    ///
    /// Sends a best-effort `Kill` envelope, then forces an OS kill.
    /// Idempotent.
    pub fn kill(&self) {
        let _ = self.send(Envelope::Kill);
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }

    /// The exit status, if the worker has already exited.
    pub fn try_exit(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    /// Wait for the worker process to exit.
    pub async fn wait_exit(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(WorkerExit { code: None }),
            Err(_) => WorkerExit { code: None },
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("exit", &self.try_exit())
            .finish()
    }
}

async fn write_loop(
    stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    pid: Option<u32>,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &envelope).await {
            tracing::debug!(pid = ?pid, error = %e, "worker stdin closed");
            break;
        }
    }
    // Dropping stdin signals end of input to the worker.
}

async fn read_loop(
    stdout: ChildStdout,
    pending: PendingCalls,
    notify: mpsc::UnboundedSender<Notification>,
    pid: Option<u32>,
) {
    let mut reader = tokio::io::BufReader::new(stdout);
    let reason = loop {
        let envelope = match read_frame(&mut reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        };
        tracing::trace!(pid = ?pid, envelope = envelope.name(), "from worker");

        let notification = match envelope {
            Envelope::Response { id, outcome } => {
                let waiter = lock(&pending).as_mut().and_then(|calls| calls.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => tracing::warn!(pid = ?pid, id, "response for unknown call"),
                }
                continue;
            }
            Envelope::Pull { value } => Notification::Pull(value),
            Envelope::Fault { message } => Notification::Fault(message),
            Envelope::Closed => Notification::Closed,
            other => {
                break Some(format!(
                    "protocol violation: worker sent `{}`",
                    other.name()
                ));
            }
        };
        let _ = notify.send(notification);
    };

    if let Some(reason) = &reason {
        tracing::warn!(pid = ?pid, %reason, "worker channel failed");
    }
    // Dropping the senders fails every outstanding call.
    lock(&pending).take();
    let _ = notify.send(Notification::Disconnected { reason });
}

async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill after exit");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => WorkerExit {
            code: status.code(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap worker");
            WorkerExit { code: None }
        }
    };
    tracing::debug!(code = ?exit.code, "worker exited");
    record_worker_exited();
    let _ = exit_tx.send(Some(exit));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_builder() {
        let cmd = WorkerCommand::new("/bin/worker")
            .arg("--quiet")
            .env("FORKLINE_LOG", "debug");
        assert_eq!(cmd.program, PathBuf::from("/bin/worker"));
        assert_eq!(cmd.args, vec![OsString::from("--quiet")]);
        assert_eq!(cmd.env.len(), 1);
    }

    #[test]
    fn test_default_worker_name() {
        let cmd = WorkerCommand::default_worker();
        assert!(cmd.program.ends_with(DEFAULT_WORKER));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let cmd = WorkerCommand::new("/nonexistent/forkline-worker");
        let err = WorkerHandle::spawn(&cmd, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_call_fails_when_process_exits() {
        // `true` exits at once without answering.
        let cmd = WorkerCommand::new("true");
        let (handle, mut notes) = WorkerHandle::spawn(&cmd, Duration::from_secs(5)).unwrap();

        let result = handle.call(Call::Close).await;
        assert!(matches!(
            result,
            Err(Error::WorkerExited { .. }) | Err(Error::ChannelClosed)
        ));

        let mut last = None;
        while let Some(n) = notes.recv().await {
            last = Some(n);
        }
        assert!(matches!(last, Some(Notification::Disconnected { .. })));
        assert_eq!(handle.wait_exit().await.code, Some(0));
    }

    #[tokio::test]
    async fn test_send_rejects_worker_envelopes() {
        let cmd = WorkerCommand::new("sleep").arg("30");
        let (handle, _notes) = WorkerHandle::spawn(&cmd, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            handle.send(Envelope::Closed),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            handle.send(Envelope::Pull { value: Value::Int(1) }),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(handle.send(Envelope::Push { values: vec![] }).is_ok());

        handle.kill();
        handle.wait_exit().await;
    }

    #[tokio::test]
    async fn test_kill_reaps_process() {
        let cmd = WorkerCommand::new("sleep").arg("30");
        let (handle, _notes) = WorkerHandle::spawn(&cmd, Duration::from_secs(5)).unwrap();

        handle.kill();
        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(exit.code, None);
        assert!(handle.try_exit().is_some());
    }
}
