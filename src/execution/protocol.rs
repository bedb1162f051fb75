//! Wire protocol between the coordinator and worker processes.
//!
//! Every message is an [`Envelope`], serialized with rkyv and sent over the
//! worker's stdin/stdout with a `u32` little-endian length prefix.

use crate::error::{Error, Result};
use crate::value::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted on either side.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length of the frame prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Data-only description of how a worker builds its scope.
///
/// Names a factory in the worker's registry and carries its configuration.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Initializer {
    /// Registry key of the scope factory.
    pub factory: String,
    /// Value passed to the factory.
    pub config: Value,
}

impl Initializer {
    /// The `blank` factory with no configuration.
    pub fn blank() -> Self {
        Self::named(crate::engine::BLANK)
    }

    /// A named factory with no configuration.
    pub fn named(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            config: Value::Null,
        }
    }

    /// Set the factory configuration.
    pub fn with_config(mut self, config: impl Into<Value>) -> Self {
        self.config = config.into();
        self
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Self::blank()
    }
}

/// A remote call made by the coordinator.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Call {
    /// Build the worker scope.
    Init {
        /// Factory descriptor.
        initializer: Initializer,
    },
    /// Bind the engine to an operation.
    UseMethod {
        /// Operation name.
        method: String,
        /// Operation arguments.
        args: Vec<Value>,
    },
    /// Finish input and drain.
    Close,
}

impl Call {
    /// Protocol name of the call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::UseMethod { .. } => "useMethod",
            Self::Close => "close",
        }
    }
}

/// Successful answer to a [`Call`].
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Reply {
    /// `init` merged the scope.
    Initialized,
    /// `useMethod` bound the engine.
    MethodBound,
    /// `close` drained the engine.
    Drained {
        /// Scalar from a reduce-like operation.
        terminal: Option<Value>,
    },
}

/// Wire classification of an error.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum ErrorKind {
    /// Factory missing or failed.
    Initialization = 1,
    /// Second `init`.
    AlreadyInitialized = 2,
    /// Call made before `init`.
    NotInitialized = 3,
    /// Unknown engine operation.
    UnknownOperation = 4,
    /// Second `useMethod`.
    AlreadyBound = 5,
    /// Function not in scope.
    UnknownFunction = 6,
    /// Malformed operation arguments.
    InvalidArguments = 7,
    /// Per-item evaluation failure.
    Eval = 8,
    /// Unexpected or undecodable envelope.
    ProtocolViolation = 9,
    /// Pending-result queue underflow.
    OrderingViolation = 10,
    /// Anything else.
    Other = 255,
}

/// Error carried in a [`Response`](Envelope::Response).
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RemoteError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Result of a [`Call`].
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Outcome {
    /// The call succeeded.
    Ok(Reply),
    /// The call failed.
    Err(RemoteError),
}

impl Outcome {
    /// Convert into a crate result, rebuilding typed errors.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Self::Ok(reply) => Ok(reply),
            Self::Err(remote) => Err(Error::from_remote(remote)),
        }
    }
}

impl From<Result<Reply>> for Outcome {
    fn from(result: Result<Reply>) -> Self {
        match result {
            Ok(reply) => Self::Ok(reply),
            Err(e) => Self::Err(e.to_remote()),
        }
    }
}

/// One message on the worker channel.
///
/// The first four variants travel coordinator to worker; the rest travel
/// worker to coordinator.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Envelope {
    /// Correlated remote call.
    Call {
        /// Request id echoed in the response.
        id: u64,
        /// The call.
        call: Call,
    },
    /// Items for the worker's engine. No response.
    Push {
        /// Items, in order.
        values: Vec<Value>,
    },
    /// Exit immediately.
    Kill,

    /// Answer to a [`Call`](Envelope::Call).
    Response {
        /// Request id of the call.
        id: u64,
        /// What happened.
        outcome: Outcome,
    },
    /// One result, in input order.
    Pull {
        /// The result.
        value: Value,
    },
    /// The worker drained and is about to exit.
    Closed,
    /// An item failed to evaluate and yields no result.
    Fault {
        /// Evaluation error text.
        message: String,
    },
}

impl Envelope {
    /// Whether the coordinator is the sender.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Call { .. } | Self::Push { .. } | Self::Kill)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Call { call, .. } => call.name(),
            Self::Push { .. } => "push",
            Self::Kill => "kill",
            Self::Response { .. } => "response",
            Self::Pull { .. } => "pull",
            Self::Closed => "closed",
            Self::Fault { .. } => "fault",
        }
    }
}

/// Frame a message for sending.
///
/// Returns a buffer with length prefix followed by serialized message.
pub fn frame_message(msg: &Envelope) -> Result<Vec<u8>> {
    let serialized = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Codec(e.to_string()))?;
    if serialized.len() > MAX_FRAME_LEN {
        return Err(Error::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit of {}",
            serialized.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = serialized.len() as u32;

    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

/// Unframe a message from a buffer.
///
/// Returns the message and the number of bytes consumed, or `None` if the
/// buffer doesn't contain a complete frame yet.
pub fn unframe_message(buf: &[u8]) -> Result<Option<(Envelope, usize)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    check_len(len)?;
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    let msg = decode_payload(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])?;
    Ok(Some((msg, FRAME_HEADER_LEN + len)))
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::ProtocolViolation(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    // Copy to aligned buffer for rkyv
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
    aligned.extend_from_slice(payload);

    rkyv::from_bytes::<Envelope, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::ProtocolViolation(format!("undecodable frame: {e}")))
}

/// Write one framed envelope and flush.
pub async fn write_frame<W>(writer: &mut W, msg: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed envelope.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary. A stream
/// that ends inside a frame is a protocol violation.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::ProtocolViolation("stream ended inside frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ProtocolViolation(format!("stream ended inside {len}-byte frame"))
        } else {
            Error::Io(e)
        }
    })?;

    decode_payload(&payload).map(Some)
}
