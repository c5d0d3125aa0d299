//! Compiled queries.

use std::sync::Arc;

use switchyard_core::{Document, NodeId, DEFAULT_FILTER_NODE_QUOTA};

use crate::ast::{Expr, ValueType};
use crate::compiler::{CompileMode, Compiler};
use crate::opcode::Program;
use crate::vm::{ExecStats, ProcessingContext};
use crate::{optimizer, parse, FilterError, FunctionResolver, Value, VariableResolver, WorkCounter};

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub mode: CompileMode,
    /// Work budget per evaluation.
    pub quota: usize,
    pub optimize: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            mode: CompileMode::Forward,
            quota: DEFAULT_FILTER_NODE_QUOTA,
            optimize: true,
        }
    }
}

/// A query compiled once and evaluated many times, from any thread.
#[derive(Debug, Clone)]
pub struct Query {
    source: Arc<str>,
    program: Arc<Program>,
    result_type: ValueType,
    quota: usize,
}

impl Query {
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        Self::compile_with(source, QueryOptions::default())
    }

    pub fn compile_with(source: &str, options: QueryOptions) -> Result<Self, FilterError> {
        let expr = parse(source)?;
        Self::from_expr(source, &expr, options)
    }

    pub fn from_expr(source: &str, expr: &Expr, options: QueryOptions) -> Result<Self, FilterError> {
        let (mut program, result_type) = Compiler::new(options.mode).compile_query(expr)?;
        if options.optimize {
            optimizer::optimize(&mut program)?;
        }
        tracing::debug!(
            query = source,
            opcodes = program.len(),
            ?result_type,
            "compiled query"
        );
        Ok(Self {
            source: source.into(),
            program: Arc::new(program),
            result_type,
            quota: options.quota,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn result_type(&self) -> ValueType {
        self.result_type
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Whether the result depends on the node the query is evaluated at.
    pub fn needs_context(&self) -> bool {
        self.program.needs_context()
    }

    /// Evaluate as a boolean at the document root.
    pub fn evaluate(&self, doc: &Document) -> Result<bool, FilterError> {
        Ok(self.evaluation(doc).run()?.to_boolean())
    }

    /// Evaluate as a node-set at the document root.
    pub fn select(&self, doc: &Document) -> Result<Vec<NodeId>, FilterError> {
        self.evaluation(doc).run()?.into_node_set()
    }

    pub fn evaluate_value(&self, doc: &Document) -> Result<Value, FilterError> {
        self.evaluation(doc).run()
    }

    pub fn evaluate_at(&self, doc: &Document, node: NodeId) -> Result<Value, FilterError> {
        self.evaluation(doc).at(node).run()
    }

    /// Start configuring a single evaluation.
    pub fn evaluation<'a>(&'a self, doc: &'a Document) -> Evaluation<'a> {
        Evaluation {
            query: self,
            doc,
            node: None,
            counter: None,
            variables: None,
            functions: None,
            stats: None,
        }
    }
}

/// One evaluation of a [`Query`] with its bindings.
///
/// ```ignore
/// let total = query.evaluation(&doc).variables(&vars).at(order).run()?;
/// ```
pub struct Evaluation<'a> {
    query: &'a Query,
    doc: &'a Document,
    node: Option<NodeId>,
    counter: Option<&'a WorkCounter>,
    variables: Option<&'a dyn VariableResolver>,
    functions: Option<&'a dyn FunctionResolver>,
    stats: Option<&'a ExecStats>,
}

impl<'a> Evaluation<'a> {
    pub fn at(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Charge work to a caller-owned counter instead of a fresh one.
    pub fn counter(mut self, counter: &'a WorkCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn variables(mut self, variables: &'a dyn VariableResolver) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn functions(mut self, functions: &'a dyn FunctionResolver) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn stats(mut self, stats: &'a ExecStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn run(self) -> Result<Value, FilterError> {
        let fresh;
        let counter = match self.counter {
            Some(counter) => counter,
            None => {
                fresh = WorkCounter::new(self.query.quota);
                &fresh
            }
        };
        let node = match self.node {
            Some(node) if self.query.needs_context() => node,
            _ => self.doc.root(),
        };
        let mut context = ProcessingContext::new(&self.query.program, self.doc, counter)
            .with_resolvers(self.variables, self.functions)
            .with_stats(self.stats);
        context
            .run(node)?
            .ok_or_else(|| FilterError::InvalidProgram("query produced no result".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use switchyard_core::DocumentBuilder;

    fn doc() -> Document {
        DocumentBuilder::new()
            .start("order", &[("id", "7")])
            .leaf("a", "1")
            .leaf("a", "2")
            .leaf("b", "x")
            .end()
            .finish()
    }

    #[test]
    fn top_level_or_stops_at_the_first_true_operand() {
        let doc = DocumentBuilder::new().leaf("a", "1").finish();
        let query = Query::compile("a = 1 or a = 2 or a = 3").unwrap();
        let stats = ExecStats::new();
        let root = doc.root();
        let result = query.evaluation(&doc).at(root).stats(&stats).run().unwrap();
        assert_eq!(result, Value::Boolean(true));
        assert_eq!(stats.count("NumberEquals"), 1);

        stats.reset();
        let doc = DocumentBuilder::new().leaf("a", "3").finish();
        assert!(query.evaluation(&doc).stats(&stats).run().unwrap().to_boolean());
        assert_eq!(stats.count("NumberEquals"), 3);
    }

    #[test]
    fn select_returns_document_order() {
        let doc = doc();
        let nodes = Query::compile("//a | /order/@id").unwrap().select(&doc).unwrap();
        let names: Vec<_> = nodes.iter().map(|n| doc.name(*n)).collect();
        assert_eq!(names, ["id", "a", "a"]);
    }

    #[test]
    fn relative_queries_run_at_the_given_node() {
        let doc = doc();
        let order = doc.document_element().unwrap();
        let query = Query::compile("count(a)").unwrap();
        assert!(query.needs_context());
        assert_eq!(query.evaluate_at(&doc, order).unwrap(), Value::Number(2.0));
        assert_eq!(query.evaluate_value(&doc).unwrap(), Value::Number(0.0));
    }

    #[test]
    fn variables_and_external_functions_are_resolved_per_evaluation() {
        let doc = doc();
        let vars: HashMap<String, Value> = [("want".to_owned(), Value::String("x".into()))].into();
        let twice = |name: &str, args: &[Value]| -> Option<Result<Value, FilterError>> {
            match (name, args) {
                ("ext:twice", [Value::Number(n)]) => Some(Ok(Value::Number(n * 2.0))),
                _ => None,
            }
        };
        let query = Query::compile("/order/b = $want and ext:twice(2) = 4").unwrap();
        let result = query
            .evaluation(&doc)
            .variables(&vars)
            .functions(&twice)
            .run()
            .unwrap();
        assert_eq!(result, Value::Boolean(true));

        let err = query.evaluation(&doc).run();
        assert_eq!(err, Err(FilterError::UnresolvedVariable("want".into())));
    }

    #[test]
    fn the_quota_bounds_evaluation() {
        let doc = doc();
        let options = QueryOptions {
            quota: 4,
            ..QueryOptions::default()
        };
        let query = Query::compile_with("count(//*) > 0", options).unwrap();
        assert_eq!(
            query.evaluate(&doc),
            Err(FilterError::QuotaExceeded { quota: 4 })
        );
    }

    #[test]
    fn queries_are_shareable_across_threads() {
        let doc = Arc::new(doc());
        let query = Query::compile("/order[@id = 7]/a[2] = 2").unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (doc, query) = (doc.clone(), query.clone());
                std::thread::spawn(move || query.evaluate(&doc).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
