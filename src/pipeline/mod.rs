//! Pipeline construction on the coordinator side.
//!
//! - [`Pipeline`]: the namespace owning configuration and live stages
//! - [`Stage`]: one stage, bound to one worker process
//! - [`StageEvent`]: lifecycle events broadcast by each stage
//! - [`PipelineConfig`]: worker command, initializer and timeouts
//!
//! # Example
//!
//! ```rust,ignore
//! use forkline::prelude::*;
//!
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default().with_initializer(Initializer::named("arith")),
//! )?;
//!
//! let sum = pipeline.map("square").await?.reduce("add", 0).await?;
//! ```

mod config;
mod events;
mod graph;
mod stage;

pub use config::{CALL_TIMEOUT_ENV, INIT_ENV, PipelineConfig, WORKER_ENV};
pub use events::{EventReceiver, EventSender, StageEvent};
pub use graph::Pipeline;
pub use stage::{CloseGuard, Lifecycle, PushGuard, ResultStream, Stage, StageId};
