//! Error types for forkline.

use crate::execution::{ErrorKind, RemoteError};
use crate::worker::exit;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using forkline's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for forkline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The initializer did not name a known factory, or the factory failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A second `init` reached a worker that already has a scope.
    #[error("worker already initialized")]
    AlreadyInitialized,

    /// `useMethod` arrived before `init`.
    #[error("worker not initialized")]
    NotInitialized,

    /// `useMethod` named an operation the engine does not know.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The worker is already bound to an operation.
    #[error("worker already bound to `{0}`")]
    AlreadyBound(String),

    /// An operation referenced a function that is not in scope.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Operation arguments were malformed.
    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArguments {
        /// The operation being bound.
        method: String,
        /// What was wrong with the arguments.
        reason: String,
    },

    /// A scope function failed while evaluating an item.
    #[error("evaluation failed: {0}")]
    Eval(String),

    /// An envelope was undecodable, unexpected, or out of sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A result was produced with no pending entry to consume.
    #[error("ordering violation: {0}")]
    OrderingViolation(String),

    /// The worker process went away without completing its drain.
    #[error("worker exited unexpectedly (code {code:?})")]
    WorkerExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The stage was killed before it completed.
    #[error("stage was killed")]
    Killed,

    /// The stage can no longer accept pipeline-building calls.
    #[error("stage {0} is terminated")]
    StageTerminated(String),

    /// The stage already forwards its results somewhere.
    #[error("stage already has a consumer")]
    AlreadyLinked,

    /// A remote call got no answer in time.
    #[error("call `{call}` timed out after {after:?}")]
    Timeout {
        /// The call that timed out.
        call: &'static str,
        /// The configured deadline.
        after: Duration,
    },

    /// The channel to the worker is gone.
    #[error("worker channel closed")]
    ChannelClosed,

    /// An error reported by the worker that has no typed counterpart.
    #[error("remote error: {0}")]
    Remote(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Envelope serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::AlreadyBound(_) => ErrorKind::AlreadyBound,
            Self::UnknownFunction(_) => ErrorKind::UnknownFunction,
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::Eval(_) => ErrorKind::Eval,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::OrderingViolation(_) => ErrorKind::OrderingViolation,
            _ => ErrorKind::Other,
        }
    }

    /// Whether a worker must terminate after hitting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization(_) | Self::ProtocolViolation(_) | Self::OrderingViolation(_)
        )
    }

    /// Process exit status for a fatal error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Initialization(_) => exit::INIT_FAILED,
            Self::OrderingViolation(_) => exit::ORDERING_VIOLATION,
            _ => exit::PROTOCOL_VIOLATION,
        }
    }

    /// Convert into the form sent back in a `Response`.
    pub fn to_remote(&self) -> RemoteError {
        let detail = match self {
            Self::Initialization(s)
            | Self::UnknownOperation(s)
            | Self::AlreadyBound(s)
            | Self::UnknownFunction(s)
            | Self::Eval(s)
            | Self::ProtocolViolation(s)
            | Self::OrderingViolation(s) => s.clone(),
            Self::InvalidArguments { method, reason } => format!("{method}: {reason}"),
            other => other.to_string(),
        };
        RemoteError {
            kind: self.kind(),
            detail,
        }
    }

    /// Rebuild a typed error from a worker's `Response`.
    pub fn from_remote(remote: RemoteError) -> Self {
        let RemoteError { kind, detail } = remote;
        match kind {
            ErrorKind::Initialization => Self::Initialization(detail),
            ErrorKind::AlreadyInitialized => Self::AlreadyInitialized,
            ErrorKind::NotInitialized => Self::NotInitialized,
            ErrorKind::UnknownOperation => Self::UnknownOperation(detail),
            ErrorKind::AlreadyBound => Self::AlreadyBound(detail),
            ErrorKind::UnknownFunction => Self::UnknownFunction(detail),
            ErrorKind::InvalidArguments => match detail.split_once(": ") {
                Some((method, reason)) => Self::InvalidArguments {
                    method: method.to_string(),
                    reason: reason.to_string(),
                },
                None => Self::InvalidArguments {
                    method: String::new(),
                    reason: detail,
                },
            },
            ErrorKind::Eval => Self::Eval(detail),
            ErrorKind::ProtocolViolation => Self::ProtocolViolation(detail),
            ErrorKind::OrderingViolation => Self::OrderingViolation(detail),
            ErrorKind::Other => Self::Remote(detail),
        }
    }
}
