//! Named functions available to a worker's operations.

use crate::error::Result;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A function callable from an operation.
///
/// Receives the current item first, followed by any extra arguments given to
/// the operation (or the accumulator and item, for `reduce`).
pub type Function = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A set of named functions.
///
/// The worker's environment is itself a `Scope`; initializer scopes are merged
/// into it key by key.
#[derive(Clone, Default)]
pub struct Scope {
    functions: HashMap<String, Function>,
}

impl Scope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, builder style.
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, f);
        self
    }

    /// Add or replace a function.
    pub fn insert<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Check whether a name is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Merge every key of `other` into this scope, replacing existing keys.
    pub fn merge(&mut self, other: Scope) {
        self.functions.extend(other.functions);
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Check if the scope is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Bound names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("functions", &self.names())
            .finish()
    }
}
