//! The worker process.
//!
//! A worker reads envelopes from stdin, drives a [`WorkerExecutor`] and writes
//! responses and notifications to stdout. Logs go to stderr.
//!
//! A worker binary is one line:
//!
//! ```rust,ignore
//! fn main() -> std::process::ExitCode {
//!     forkline::worker::main(forkline::engine::Registry::with_builtins())
//! }
//! ```

mod executor;
mod pending;

pub use executor::{Control, WorkerExecutor, WorkerState};
pub use pending::{PendingEntry, PendingResults};

use crate::engine::Registry;
use crate::error::Error;
use crate::execution::{Envelope, frame_message, read_frame};
use crate::observability::{init_tracing, span_worker};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::Instrument;

/// Worker exit statuses.
pub mod exit {
    /// Clean completion after `close`.
    pub const OK: u8 = 0;
    /// The initializer named no factory, or the factory failed.
    pub const INIT_FAILED: u8 = 1;
    /// Undecodable, unexpected or out-of-sequence envelope.
    pub const PROTOCOL_VIOLATION: u8 = 2;
    /// A result was produced with no pending entry.
    pub const ORDERING_VIOLATION: u8 = 3;
    /// stdin ended without `close`.
    pub const DISCONNECTED: u8 = 4;
    /// A `Kill` envelope arrived.
    pub const KILLED: u8 = 9;
}

fn read_failure_code(e: &Error) -> u8 {
    match e {
        Error::Io(_) => exit::DISCONNECTED,
        other => other.exit_code(),
    }
}

async fn write_all<W>(writer: &mut W, out: &mut Vec<Envelope>) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for envelope in out.drain(..) {
        let framed = frame_message(&envelope)?;
        writer.write_all(&framed).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Serve the worker protocol until the worker must exit.
///
/// Returns the exit status. Generic over the byte streams so it can run over
/// stdin/stdout or an in-memory duplex.
pub async fn serve<R, W>(registry: Registry, reader: R, writer: W) -> u8
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut executor = WorkerExecutor::new(registry);
    let mut out = Vec::new();

    loop {
        let envelope = match read_frame(&mut reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!(state = %executor.state(), "coordinator disconnected");
                return exit::DISCONNECTED;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read envelope");
                return read_failure_code(&e);
            }
        };
        tracing::trace!(envelope = envelope.name(), "from coordinator");

        let control = executor.handle(envelope, &mut out);

        if let Err(e) = write_all(&mut writer, &mut out).await {
            tracing::warn!(error = %e, "failed to write to coordinator");
            return read_failure_code(&e);
        }
        if let Control::Exit(code) = control {
            return code;
        }
    }
}

/// Entry point for worker binaries.
///
/// Installs stderr logging, runs [`serve`] over stdin/stdout on a
/// current-thread runtime and returns the exit status.
pub fn main(registry: Registry) -> std::process::ExitCode {
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return std::process::ExitCode::from(exit::INIT_FAILED);
        }
    };

    let span = span_worker(std::process::id());
    let code = runtime.block_on(
        serve(registry, tokio::io::stdin(), tokio::io::stdout()).instrument(span),
    );
    // The stdin reader thread may be parked in a blocking read.
    runtime.shutdown_background();

    std::process::ExitCode::from(code)
}
