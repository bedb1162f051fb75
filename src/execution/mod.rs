//! Worker processes and the protocol spoken with them.
//!
//! Every pipeline stage runs its operation in a dedicated worker process. The
//! coordinator talks to it over the child's stdin/stdout with length-prefixed
//! rkyv frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Coordinator                         │
//! │  Stage ──► Stage ──► Stage ──► results()                 │
//! │    │         │         │                                 │
//! │ WorkerHandle (writer / reader / exit-monitor tasks)      │
//! └────┼─────────┼─────────┼─────────────────────────────────┘
//!      │ stdin: Call / Push / Kill
//!      │ stdout: Response / Pull / Fault / Closed
//!      ▼         ▼         ▼
//!  ┌───────┐ ┌───────┐ ┌───────┐
//!  │worker │ │worker │ │worker │   one engine + one bound
//!  │ (map) │ │(filter│ │(chunk)│   operation per process
//!  └───────┘ └───────┘ └───────┘
//! ```
//!
//! Calls (`init`, `useMethod`, `close`) are correlated by request id.
//! Results are not: they arrive as `Pull` notifications in input order.

mod process;
mod protocol;

pub use process::{
    DEFAULT_WORKER, Notification, PendingReply, WorkerCommand, WorkerExit, WorkerHandle,
};
pub use protocol::{
    Call, Envelope, ErrorKind, FRAME_HEADER_LEN, Initializer, MAX_FRAME_LEN, Outcome,
    RemoteError, Reply, frame_message, read_frame, unframe_message, write_frame,
};
