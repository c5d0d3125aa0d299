//! Direct evaluation of query expression trees.
//!
//! The interpreter walks the [`Expr`] tree node by node. It is the simple
//! counterpart of the compiled VM: one-shot queries use it directly, and the
//! compiler's output is checked against it.

use switchyard_core::{Document, NodeId};

use crate::ast::{Expr, Step};
use crate::functions::{self, CallContext};
use crate::resolve::{call_external, resolve_variable};
use crate::value::{compare, union_nodes};
use crate::{axis, FilterError, FunctionResolver, Value, VariableResolver, WorkCounter};

pub struct Interpreter<'a> {
    doc: &'a Document,
    counter: &'a WorkCounter,
    variables: Option<&'a dyn VariableResolver>,
    functions: Option<&'a dyn FunctionResolver>,
}

impl<'a> Interpreter<'a> {
    pub fn new(doc: &'a Document, counter: &'a WorkCounter) -> Self {
        Self {
            doc,
            counter,
            variables: None,
            functions: None,
        }
    }

    pub fn with_variables(mut self, variables: &'a dyn VariableResolver) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_functions(mut self, functions: &'a dyn FunctionResolver) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Evaluate with the document root as the context node.
    pub fn evaluate(&self, expr: &Expr) -> Result<Value, FilterError> {
        self.evaluate_at(expr, self.doc.root())
    }

    pub fn evaluate_at(&self, expr: &Expr, node: NodeId) -> Result<Value, FilterError> {
        self.eval(expr, &CallContext::single(node))
    }

    fn eval(&self, expr: &Expr, ctx: &CallContext) -> Result<Value, FilterError> {
        Ok(match expr {
            Expr::And(left, right) => Value::Boolean(
                self.eval(left, ctx)?.to_boolean() && self.eval(right, ctx)?.to_boolean(),
            ),
            Expr::Or(left, right) => Value::Boolean(
                self.eval(left, ctx)?.to_boolean() || self.eval(right, ctx)?.to_boolean(),
            ),
            Expr::Relational { op, left, right } => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Value::Boolean(compare(*op, &left, &right, self.doc, self.counter)?)
            }
            Expr::Math { op, left, right } => {
                let left = self.eval(left, ctx)?.to_number(self.doc, self.counter)?;
                let right = self.eval(right, ctx)?.to_number(self.doc, self.counter)?;
                Value::Number(op.apply(left, right))
            }
            Expr::Negate(inner) => {
                Value::Number(-self.eval(inner, ctx)?.to_number(self.doc, self.counter)?)
            }
            Expr::Number(n) => Value::Number(*n),
            Expr::String(s) => Value::String(s.clone()),
            Expr::Function { function, args } => {
                let args = self.eval_all(args, ctx)?;
                functions::call(*function, &args, ctx, self.doc, self.counter)?
            }
            Expr::Union(left, right) => {
                let left = self.eval(left, ctx)?.into_node_set()?;
                let right = self.eval(right, ctx)?;
                Value::NodeSet(union_nodes(left, right.as_node_set()?))
            }
            Expr::LocationPath(path) => {
                let start = if path.absolute {
                    self.doc.root()
                } else {
                    ctx.node
                };
                Value::NodeSet(self.steps(vec![start], &path.steps)?)
            }
            Expr::RelativePath { base, path } => {
                let nodes = self.eval(base, ctx)?.into_node_set()?;
                Value::NodeSet(self.steps(nodes, &path.steps)?)
            }
            Expr::Filter { base, predicates } => {
                let mut nodes = self.eval(base, ctx)?.into_node_set()?;
                for predicate in predicates {
                    nodes = self.filter(nodes, predicate)?;
                }
                Value::NodeSet(nodes)
            }
            Expr::Variable(name) => resolve_variable(self.variables, name)?,
            Expr::ExternalFunction { name, args } => {
                let args = self.eval_all(args, ctx)?;
                call_external(self.functions, name, &args)?
            }
        })
    }

    fn eval_all(&self, exprs: &[Expr], ctx: &CallContext) -> Result<Vec<Value>, FilterError> {
        exprs.iter().map(|e| self.eval(e, ctx)).collect()
    }

    fn steps(&self, mut nodes: Vec<NodeId>, steps: &[Step]) -> Result<Vec<NodeId>, FilterError> {
        for step in steps {
            let mut next = Vec::new();
            for node in &nodes {
                let mut selected = Vec::new();
                axis::select(
                    self.doc,
                    *node,
                    step.axis,
                    &step.test,
                    self.counter,
                    &mut selected,
                )?;
                for predicate in &step.predicates {
                    selected = self.filter(selected, predicate)?;
                }
                next.extend(selected);
            }
            next.sort_unstable();
            next.dedup();
            nodes = next;
        }
        Ok(nodes)
    }

    /// Keep the nodes for which `predicate` holds. Positions follow the
    /// order of `nodes`.
    fn filter(&self, nodes: Vec<NodeId>, predicate: &Expr) -> Result<Vec<NodeId>, FilterError> {
        let size = nodes.len();
        let mut kept = Vec::with_capacity(size);
        for (index, node) in nodes.into_iter().enumerate() {
            let ctx = CallContext {
                node,
                position: index + 1,
                size,
            };
            if predicate_holds(&self.eval(predicate, &ctx)?, ctx.position) {
                kept.push(node);
            }
        }
        Ok(kept)
    }
}

/// A numeric predicate selects by position, anything else by truth value.
pub(crate) fn predicate_holds(value: &Value, position: usize) -> bool {
    match value {
        Value::Number(n) => *n == position as f64,
        other => other.to_boolean(),
    }
}
