//! Operations and the per-worker flow that applies one of them.

use super::scope::{Function, Scope};
use crate::error::{Error, Result};
use crate::value::Value;

/// `map(fn, extra..)`: emit `fn(item, extra..)`.
pub const MAP: &str = "map";
/// `filter(pred, extra..)`: keep items for which the predicate is truthy.
pub const FILTER: &str = "filter";
/// `reject(pred, extra..)`: drop items for which the predicate is truthy.
pub const REJECT: &str = "reject";
/// `filterMap(fn, extra..)`: emit `fn(item, extra..)` unless it is `Null`.
pub const FILTER_MAP: &str = "filterMap";
/// `forEach(fn, extra..)`: call `fn` for its side effects, pass the item on.
pub const FOR_EACH: &str = "forEach";
/// `reduce(fn, initial?)`: fold into a terminal value reported at close.
pub const REDUCE: &str = "reduce";
/// `chunk(n)`: group items into lists of `n`.
pub const CHUNK: &str = "chunk";
/// `take(n)`: pass the first `n` items.
pub const TAKE: &str = "take";

/// Every operation name the engine accepts.
pub const OPERATIONS: &[&str] = &[MAP, FILTER, REJECT, FILTER_MAP, FOR_EACH, REDUCE, CHUNK, TAKE];

/// Check whether `name` is an engine operation.
pub fn is_operation(name: &str) -> bool {
    OPERATIONS.contains(&name)
}

/// A scope function resolved for an operation, with its extra arguments.
struct Callee {
    name: String,
    function: Function,
    extra: Vec<Value>,
}

impl Callee {
    fn resolve(method: &str, args: &[Value], scope: &Scope) -> Result<Self> {
        let name = match args.first() {
            Some(Value::Text(name)) => name.clone(),
            Some(other) => {
                return Err(Error::InvalidArguments {
                    method: method.to_string(),
                    reason: format!("expected function name, got {}", other.type_name()),
                });
            }
            None => {
                return Err(Error::InvalidArguments {
                    method: method.to_string(),
                    reason: "missing function name".to_string(),
                });
            }
        };

        let function = scope
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.clone()))?;

        Ok(Self {
            name,
            function,
            extra: args[1..].to_vec(),
        })
    }

    fn invoke(&self, leading: &[Value]) -> Result<Value> {
        let mut args = Vec::with_capacity(leading.len() + self.extra.len());
        args.extend_from_slice(leading);
        args.extend(self.extra.iter().cloned());
        (self.function)(&args).map_err(|e| match e {
            Error::Eval(msg) => Error::Eval(msg),
            other => Error::Eval(format!("{}: {}", self.name, other)),
        })
    }
}

enum Operation {
    Map(Callee),
    Filter(Callee),
    Reject(Callee),
    FilterMap(Callee),
    ForEach(Callee),
    Reduce {
        callee: Callee,
        acc: Option<Value>,
    },
    Chunk {
        size: usize,
        current: Vec<Value>,
    },
    Take {
        remaining: u64,
    },
}

fn count_arg(method: &str, args: &[Value], allow_zero: bool) -> Result<i64> {
    let invalid = |reason: String| Error::InvalidArguments {
        method: method.to_string(),
        reason,
    };
    match args.first() {
        Some(Value::Int(n)) if *n > 0 || (allow_zero && *n == 0) => Ok(*n),
        Some(Value::Int(n)) => Err(invalid(format!("count must be positive, got {n}"))),
        Some(other) => Err(invalid(format!("expected int, got {}", other.type_name()))),
        None => Err(invalid("missing count".to_string())),
    }
}

impl Operation {
    fn bind(method: &str, args: &[Value], scope: &Scope) -> Result<Self> {
        let op = match method {
            MAP => Self::Map(Callee::resolve(method, args, scope)?),
            FILTER => Self::Filter(Callee::resolve(method, args, scope)?),
            REJECT => Self::Reject(Callee::resolve(method, args, scope)?),
            FILTER_MAP => Self::FilterMap(Callee::resolve(method, args, scope)?),
            FOR_EACH => Self::ForEach(Callee::resolve(method, args, scope)?),
            REDUCE => {
                // The optional initial value is not an extra argument to the reducer.
                let callee = Callee::resolve(method, args.get(..1).unwrap_or_default(), scope)?;
                Self::Reduce {
                    callee,
                    acc: args.get(1).cloned(),
                }
            }
            CHUNK => Self::Chunk {
                size: count_arg(method, args, false)? as usize,
                current: Vec::new(),
            },
            TAKE => Self::Take {
                remaining: count_arg(method, args, true)? as u64,
            },
            other => return Err(Error::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }
}

/// What a flow yields once its input is finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Outputs still held by the operation (a partial chunk).
    pub trailing: Vec<Value>,
    /// Scalar result of a reduce-like operation.
    pub terminal: Option<Value>,
}

/// One operation applied to a stream of items.
///
/// Each accepted item yields at most one output, so a flow never emits more
/// results than it accepted items.
pub struct Flow {
    method: String,
    op: Operation,
    accepted: u64,
    emitted: u64,
    finished: bool,
}

impl Flow {
    /// Bind a flow to `method(args)`, resolving function names in `scope`.
    pub fn bind(method: &str, args: &[Value], scope: &Scope) -> Result<Self> {
        Ok(Self {
            method: method.to_string(),
            op: Operation::bind(method, args, scope)?,
            accepted: 0,
            emitted: 0,
            finished: false,
        })
    }

    /// The bound operation name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Items accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Outputs emitted so far, including trailing ones.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Feed one item; returns the output it produced, if any.
    ///
    /// An `Err` means the item's function call failed and the item yields
    /// nothing. The flow stays usable.
    pub fn accept(&mut self, item: Value) -> Result<Option<Value>> {
        if self.finished {
            return Err(Error::ProtocolViolation(format!(
                "`{}` received an item after its input finished",
                self.method
            )));
        }
        self.accepted += 1;

        let out = match &mut self.op {
            Operation::Map(callee) => Some(callee.invoke(std::slice::from_ref(&item))?),
            Operation::Filter(callee) => callee
                .invoke(std::slice::from_ref(&item))?
                .is_truthy()
                .then_some(item),
            Operation::Reject(callee) => (!callee
                .invoke(std::slice::from_ref(&item))?
                .is_truthy())
            .then_some(item),
            Operation::FilterMap(callee) => {
                let v = callee.invoke(std::slice::from_ref(&item))?;
                (!v.is_null()).then_some(v)
            }
            Operation::ForEach(callee) => {
                callee.invoke(std::slice::from_ref(&item))?;
                Some(item)
            }
            Operation::Reduce { callee, acc } => {
                let next = match acc.take() {
                    None => item,
                    Some(prev) => match callee.invoke(&[prev.clone(), item]) {
                        Ok(v) => v,
                        Err(e) => {
                            *acc = Some(prev);
                            return Err(e);
                        }
                    },
                };
                *acc = Some(next);
                None
            }
            Operation::Chunk { size, current } => {
                current.push(item);
                (current.len() >= *size).then(|| Value::List(std::mem::take(current)))
            }
            Operation::Take { remaining } => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Some(item)
                } else {
                    None
                }
            }
        };

        if out.is_some() {
            self.emitted += 1;
        }
        Ok(out)
    }

    /// Signal end of input. Idempotent; later calls return an empty completion.
    pub fn finish(&mut self) -> Completion {
        if self.finished {
            return Completion::default();
        }
        self.finished = true;

        let completion = match &mut self.op {
            Operation::Chunk { current, .. } if !current.is_empty() => Completion {
                trailing: vec![Value::List(std::mem::take(current))],
                terminal: None,
            },
            Operation::Reduce { acc, .. } => Completion {
                trailing: Vec::new(),
                terminal: acc.take(),
            },
            _ => Completion::default(),
        };

        self.emitted += completion.trailing.len() as u64;
        completion
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("method", &self.method)
            .field("accepted", &self.accepted)
            .field("emitted", &self.emitted)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Registry;
    use crate::execution::Initializer;

    fn arith() -> Scope {
        Registry::with_builtins()
            .build(&Initializer::named("arith"))
            .unwrap()
    }

    fn run(flow: &mut Flow, items: impl IntoIterator<Item = i64>) -> Vec<Value> {
        items
            .into_iter()
            .filter_map(|i| flow.accept(Value::Int(i)).unwrap())
            .collect()
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn test_map_preserves_order() {
        let mut flow = Flow::bind(MAP, &["double".into()], &arith()).unwrap();
        assert_eq!(run(&mut flow, 1..=5), ints(&[2, 4, 6, 8, 10]));
        assert_eq!(flow.accepted(), 5);
        assert_eq!(flow.emitted(), 5);
    }

    #[test]
    fn test_map_extra_arguments() {
        let mut flow = Flow::bind(MAP, &["add".into(), Value::Int(10)], &arith()).unwrap();
        assert_eq!(run(&mut flow, [1, 2]), ints(&[11, 12]));
    }

    #[test]
    fn test_filter_and_reject() {
        let mut keep = Flow::bind(FILTER, &["is_even".into()], &arith()).unwrap();
        assert_eq!(run(&mut keep, 1..=6), ints(&[2, 4, 6]));

        let mut drop = Flow::bind(REJECT, &["is_even".into()], &arith()).unwrap();
        assert_eq!(run(&mut drop, 1..=6), ints(&[1, 3, 5]));
    }

    #[test]
    fn test_filter_map_keep_even_double() {
        let mut flow = Flow::bind(FILTER_MAP, &["double_if_even".into()], &arith()).unwrap();
        assert_eq!(run(&mut flow, [1, 2, 3, 4]), ints(&[4, 8]));
        assert_eq!(flow.finish(), Completion::default());
    }

    #[test]
    fn test_for_each_passes_items_through() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen = counter.clone();
        let scope = Scope::new().function("count", move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(Value::Null)
        });

        let mut flow = Flow::bind(FOR_EACH, &["count".into()], &scope).unwrap();
        assert_eq!(run(&mut flow, [7, 8]), ints(&[7, 8]));
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[test]
    fn test_reduce_terminal_value() {
        let mut flow = Flow::bind(REDUCE, &["add".into(), Value::Int(0)], &arith()).unwrap();
        assert!(run(&mut flow, 1..=4).is_empty());
        let done = flow.finish();
        assert!(done.trailing.is_empty());
        assert_eq!(done.terminal, Some(Value::Int(10)));
    }

    #[test]
    fn test_reduce_without_initial_seeds_from_first_item() {
        let mut flow = Flow::bind(REDUCE, &["max".into()], &arith()).unwrap();
        run(&mut flow, [3, 9, 2]);
        assert_eq!(flow.finish().terminal, Some(Value::Int(9)));

        let mut empty = Flow::bind(REDUCE, &["max".into()], &arith()).unwrap();
        assert_eq!(empty.finish().terminal, None);
    }

    #[test]
    fn test_reduce_keeps_accumulator_on_error() {
        let mut flow = Flow::bind(REDUCE, &["add".into(), Value::Int(1)], &arith()).unwrap();
        assert!(flow.accept(Value::from("oops")).is_err());
        flow.accept(Value::Int(2)).unwrap();
        assert_eq!(flow.finish().terminal, Some(Value::Int(3)));
    }

    #[test]
    fn test_chunk_with_trailing_partial() {
        let mut flow = Flow::bind(CHUNK, &[Value::Int(2)], &Scope::new()).unwrap();
        let out = run(&mut flow, 1..=5);
        assert_eq!(
            out,
            vec![Value::from(vec![1, 2]), Value::from(vec![3, 4])]
        );
        let done = flow.finish();
        assert_eq!(done.trailing, vec![Value::from(vec![5])]);
        assert_eq!(flow.emitted(), 3);
        assert!(flow.emitted() <= flow.accepted());
    }

    #[test]
    fn test_take() {
        let mut flow = Flow::bind(TAKE, &[Value::Int(2)], &Scope::new()).unwrap();
        assert_eq!(run(&mut flow, 1..=5), ints(&[1, 2]));

        let mut none = Flow::bind(TAKE, &[Value::Int(0)], &Scope::new()).unwrap();
        assert!(run(&mut none, 1..=3).is_empty());
    }

    #[test]
    fn test_bind_errors() {
        let scope = arith();
        assert!(matches!(
            Flow::bind("frobnicate", &[], &scope),
            Err(Error::UnknownOperation(ref m)) if m == "frobnicate"
        ));
        assert!(matches!(
            Flow::bind(MAP, &["nope".into()], &scope),
            Err(Error::UnknownFunction(_))
        ));
        assert!(matches!(
            Flow::bind(MAP, &[], &scope),
            Err(Error::InvalidArguments { .. })
        ));
        assert!(matches!(
            Flow::bind(MAP, &[Value::Int(1)], &scope),
            Err(Error::InvalidArguments { .. })
        ));
        assert!(matches!(
            Flow::bind(CHUNK, &[Value::Int(0)], &scope),
            Err(Error::InvalidArguments { .. })
        ));
        assert!(matches!(
            Flow::bind(TAKE, &[Value::Int(-1)], &scope),
            Err(Error::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_eval_error_yields_nothing_and_flow_continues() {
        let mut flow = Flow::bind(MAP, &["double".into()], &arith()).unwrap();
        assert!(matches!(flow.accept(Value::from("x")), Err(Error::Eval(_))));
        assert_eq!(flow.accept(Value::Int(3)).unwrap(), Some(Value::Int(6)));
        assert_eq!(flow.accepted(), 2);
        assert_eq!(flow.emitted(), 1);
    }

    #[test]
    fn test_accept_after_finish_is_rejected() {
        let mut flow = Flow::bind(MAP, &["identity".into()], &arith()).unwrap();
        flow.finish();
        assert!(matches!(
            flow.accept(Value::Int(1)),
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(flow.finish(), Completion::default());
    }

    #[test]
    fn test_operation_vocabulary() {
        for op in OPERATIONS {
            assert!(is_operation(op));
        }
        assert!(!is_operation("as"));
        assert!(!is_operation("concat"));
    }
}
