//! Embedded single-process stream engine.
//!
//! Every worker owns one engine instance. The engine knows a fixed vocabulary
//! of named operations; functions referenced by those operations come from the
//! worker's [`Scope`], which is built by a named factory in the [`Registry`].
//!
//! ```rust,ignore
//! use forkline::engine::{Flow, Registry};
//! use forkline::execution::Initializer;
//!
//! let scope = Registry::with_builtins().build(&Initializer::named("arith"))?;
//! let mut flow = Flow::bind("filterMap", &["double_if_even".into()], &scope)?;
//!
//! assert_eq!(flow.accept(1.into())?, None);
//! assert_eq!(flow.accept(2.into())?, Some(4.into()));
//! ```

mod flow;
mod registry;
mod scope;

pub use flow::{
    CHUNK, Completion, FILTER, FILTER_MAP, FOR_EACH, Flow, MAP, OPERATIONS, REDUCE, REJECT, TAKE,
    is_operation,
};
pub use registry::{ARITH, BLANK, Registry, ScopeFactory};
pub use scope::{Function, Scope};
