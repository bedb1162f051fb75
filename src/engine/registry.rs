//! Initializer factories.
//!
//! A worker never receives executable code. The coordinator names a factory
//! and passes a configuration value; the worker resolves that name against
//! the `Registry` compiled into its binary.

use super::scope::Scope;
use crate::error::{Error, Result};
use crate::execution::Initializer;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a scope from initializer configuration.
pub type ScopeFactory = Arc<dyn Fn(&Value) -> Result<Scope> + Send + Sync>;

/// Name of the factory that yields an empty scope.
pub const BLANK: &str = "blank";

/// Name of the built-in arithmetic factory.
pub const ARITH: &str = "arith";

/// Named scope factories known to a worker binary.
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<String, ScopeFactory>,
}

impl Registry {
    /// Registry containing only the `blank` factory.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(BLANK, |_| Ok(Scope::new()));
        registry
    }

    /// Registry with `blank` and the `arith` function set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ARITH, arith_scope);
        registry
    }

    /// Register a factory, builder style.
    pub fn factory<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Scope> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    /// Register or replace a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Scope> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(f));
    }

    /// Check whether a factory is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Run the factory an initializer names.
    ///
    /// Any failure is an [`Error::Initialization`].
    pub fn build(&self, initializer: &Initializer) -> Result<Scope> {
        let factory = self.factories.get(&initializer.factory).ok_or_else(|| {
            Error::Initialization(format!("no factory named `{}`", initializer.factory))
        })?;

        factory(&initializer.config).map_err(|e| match e {
            Error::Initialization(_) => e,
            other => Error::Initialization(format!("factory `{}`: {}", initializer.factory, other)),
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("factories", &names).finish()
    }
}

fn int_arg(args: &[Value], index: usize, func: &str) -> Result<i64> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| match args.get(index) {
            Some(v) => Error::Eval(format!("{func}: expected int, got {}", v.type_name())),
            None => Error::Eval(format!("{func}: missing argument {index}")),
        })
}

fn num_arg(args: &[Value], index: usize, func: &str) -> Result<Value> {
    match args.get(index) {
        Some(v @ (Value::Int(_) | Value::Float(_))) => Ok(v.clone()),
        Some(v) => Err(Error::Eval(format!(
            "{func}: expected number, got {}",
            v.type_name()
        ))),
        None => Err(Error::Eval(format!("{func}: missing argument {index}"))),
    }
}

fn binary<I, F>(args: &[Value], func: &str, int_op: I, float_op: F) -> Result<Value>
where
    I: Fn(i64, i64) -> Option<i64>,
    F: Fn(f64, f64) -> f64,
{
    let a = num_arg(args, 0, func)?;
    let b = num_arg(args, 1, func)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| Error::Eval(format!("{func}: integer overflow"))),
        _ => {
            let x = a.as_float().unwrap_or_default();
            let y = b.as_float().unwrap_or_default();
            Ok(Value::Float(float_op(x, y)))
        }
    }
}

/// The `arith` scope: small numeric functions useful for tests and demos.
///
/// A numeric config value enables `scale`, which multiplies by that factor.
fn arith_scope(config: &Value) -> Result<Scope> {
    let mut scope = Scope::new()
        .function("identity", |args| {
            args.first()
                .cloned()
                .ok_or_else(|| Error::Eval("identity: missing argument 0".into()))
        })
        .function("double", |args| {
            let x = num_arg(args, 0, "double")?;
            binary(&[x, Value::Int(2)], "double", i64::checked_mul, |a, b| a * b)
        })
        .function("square", |args| {
            let x = num_arg(args, 0, "square")?;
            binary(&[x.clone(), x], "square", i64::checked_mul, |a, b| a * b)
        })
        .function("inc", |args| {
            let x = num_arg(args, 0, "inc")?;
            binary(&[x, Value::Int(1)], "inc", i64::checked_add, |a, b| a + b)
        })
        .function("negate", |args| match num_arg(args, 0, "negate")? {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| Error::Eval("negate: integer overflow".into())),
            other => Ok(Value::Float(-other.as_float().unwrap_or_default())),
        })
        .function("is_even", |args| {
            Ok(Value::Bool(int_arg(args, 0, "is_even")? % 2 == 0))
        })
        .function("is_odd", |args| {
            Ok(Value::Bool(int_arg(args, 0, "is_odd")? % 2 != 0))
        })
        .function("double_if_even", |args| {
            let x = int_arg(args, 0, "double_if_even")?;
            if x % 2 == 0 {
                x.checked_mul(2)
                    .map(Value::Int)
                    .ok_or_else(|| Error::Eval("double_if_even: integer overflow".into()))
            } else {
                Ok(Value::Null)
            }
        })
        .function("add", |args| binary(args, "add", i64::checked_add, |x, y| x + y))
        .function("mul", |args| binary(args, "mul", i64::checked_mul, |x, y| x * y))
        .function("max", |args| binary(args, "max", |x, y| Some(x.max(y)), f64::max))
        .function("min", |args| binary(args, "min", |x, y| Some(x.min(y)), f64::min))
        .function("fail", |args| {
            Err(Error::Eval(format!(
                "fail: rejected {}",
                args.first().cloned().unwrap_or_default()
            )))
        });

    match config {
        Value::Null => {}
        Value::Int(_) | Value::Float(_) => {
            let factor = config.clone();
            scope.insert("scale", move |args| {
                binary(
                    &[num_arg(args, 0, "scale")?, factor.clone()],
                    "scale",
                    i64::checked_mul,
                    |x, y| x * y,
                )
            });
        }
        other => {
            return Err(Error::Initialization(format!(
                "arith: config must be a number or null, got {}",
                other.type_name()
            )));
        }
    }

    Ok(scope)
}
