//! Caller-supplied bindings for `$variables` and `prefix:function(...)` calls.

use std::collections::HashMap;

use crate::{FilterError, Value};

pub trait VariableResolver: Send + Sync {
    /// The value bound to `name`, or `None` if it is unbound.
    fn variable(&self, name: &str) -> Option<Value>;
}

pub trait FunctionResolver: Send + Sync {
    /// Call the external function `name`. `None` means no such function.
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, FilterError>>;
}

impl VariableResolver for HashMap<String, Value> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl<F> FunctionResolver for F
where
    F: Fn(&str, &[Value]) -> Option<Result<Value, FilterError>> + Send + Sync,
{
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, FilterError>> {
        self(name, args)
    }
}

pub(crate) fn resolve_variable(
    resolver: Option<&dyn VariableResolver>,
    name: &str,
) -> Result<Value, FilterError> {
    let value = resolver
        .and_then(|r| r.variable(name))
        .ok_or_else(|| FilterError::UnresolvedVariable(name.to_owned()))?;
    Ok(normalize(value))
}

pub(crate) fn call_external(
    resolver: Option<&dyn FunctionResolver>,
    name: &str,
    args: &[Value],
) -> Result<Value, FilterError> {
    match resolver.and_then(|r| r.call(name, args)) {
        Some(result) => result.map(normalize),
        None => Err(FilterError::UnresolvedFunction(name.to_owned())),
    }
}

/// Node-sets from outside may arrive unordered.
fn normalize(value: Value) -> Value {
    match value {
        Value::NodeSet(mut nodes) => {
            nodes.sort_unstable();
            nodes.dedup();
            Value::NodeSet(nodes)
        }
        other => other,
    }
}
