//! # forkline
//!
//! Multi-process stream pipelines. Every stage of a pipeline runs one
//! engine operation (`map`, `filter`, `reduce`, ...) inside its own worker
//! process; the coordinator forwards each stage's results into the next.
//!
//! ## Features
//!
//! - **One process per stage**: a crash or a kill takes down one stage only
//! - **Ordered results**: every worker emits results in the order items arrived
//! - **rkyv framing**: length-prefixed archives over the worker's stdin/stdout
//! - **Lifecycle events**: push, pull, fault, close and kill are observable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forkline::prelude::*;
//!
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default().with_initializer(Initializer::named("arith")),
//! )?;
//!
//! let evens = pipeline.filter_map("double_if_even").await?;
//! let mut results = evens.results()?;
//!
//! evens.push([1, 2, 3, 4]);
//! evens.close();
//!
//! assert_eq!(results.collect_all().await, vec![4.into(), 8.into()]);
//! ```
//!
//! Workers are started from the `forkline-worker` binary unless
//! [`PipelineConfig::worker`](pipeline::PipelineConfig) says otherwise. A
//! custom worker calls [`worker::main`] with its own [`engine::Registry`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod engine;
pub mod error;
pub mod execution;
pub mod observability;
pub mod pipeline;
pub mod value;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::engine::{Registry, Scope};
    pub use crate::error::{Error, Result};
    pub use crate::execution::{Initializer, WorkerCommand};
    pub use crate::pipeline::{Lifecycle, Pipeline, PipelineConfig, Stage, StageEvent};
    pub use crate::value::Value;
}

pub use error::{Error, Result};
