//! Built-in function library shared by the interpreter and the VM.

use switchyard_core::{Document, NodeId};

use crate::ast::Function;
use crate::value::{node_text, parse_number};
use crate::{FilterError, Value, WorkCounter};

/// The evaluation context of a single call: the context node and its
/// proximity position within a context of `size` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallContext {
    pub node: NodeId,
    pub position: usize,
    pub size: usize,
}

impl CallContext {
    pub fn single(node: NodeId) -> Self {
        Self {
            node,
            position: 1,
            size: 1,
        }
    }
}

pub(crate) fn call(
    function: Function,
    args: &[Value],
    ctx: &CallContext,
    doc: &Document,
    counter: &WorkCounter,
) -> Result<Value, FilterError> {
    let text_arg = |i: usize| -> Result<String, FilterError> {
        match args.get(i) {
            Some(value) => value.to_text(doc, counter),
            None => node_text(doc, ctx.node, counter),
        }
    };

    Ok(match function {
        Function::True => Value::Boolean(true),
        Function::False => Value::Boolean(false),
        Function::Not => Value::Boolean(!first(args, function)?.to_boolean()),
        Function::Boolean => Value::Boolean(first(args, function)?.to_boolean()),
        Function::Count => Value::Number(first(args, function)?.as_node_set()?.len() as f64),
        Function::Position => Value::Number(ctx.position as f64),
        Function::Last => Value::Number(ctx.size as f64),
        Function::String => Value::String(text_arg(0)?),
        Function::StringLength => Value::Number(text_arg(0)?.chars().count() as f64),
        Function::Concat => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&arg.to_text(doc, counter)?);
            }
            Value::String(out)
        }
        Function::Contains => Value::Boolean(text_arg(0)?.contains(text_arg(1)?.as_str())),
        Function::StartsWith => Value::Boolean(text_arg(0)?.starts_with(text_arg(1)?.as_str())),
        Function::LocalName | Function::Name => {
            let node = match args.first() {
                Some(value) => value.as_node_set()?.first().copied(),
                None => Some(ctx.node),
            };
            let name = node.map(|n| doc.name(n)).unwrap_or("");
            let name = if function == Function::LocalName {
                name.rsplit(':').next().unwrap_or(name)
            } else {
                name
            };
            Value::String(name.to_owned())
        }
        Function::Number => match args.first() {
            Some(value) => Value::Number(value.to_number(doc, counter)?),
            None => Value::Number(parse_number(&node_text(doc, ctx.node, counter)?)),
        },
        Function::Sum => {
            let mut total = 0.0;
            for node in first(args, function)?.as_node_set()? {
                total += parse_number(&node_text(doc, *node, counter)?);
            }
            Value::Number(total)
        }
        Function::NormalizeSpace => {
            let text = text_arg(0)?;
            Value::String(text.split_whitespace().collect::<Vec<_>>().join(" "))
        }
    })
}

fn first(args: &[Value], function: Function) -> Result<&Value, FilterError> {
    args.first().ok_or_else(|| FilterError::Arity {
        function: function.name().to_owned(),
        expected: "1".to_owned(),
        found: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::DocumentBuilder;

    #[test]
    fn string_functions_use_the_context_node_without_arguments() {
        let doc = DocumentBuilder::new().leaf("p:item", "  a   b ").finish();
        let item = doc.document_element().unwrap();
        let ctx = CallContext::single(item);
        let counter = WorkCounter::unbounded();
        let call = |f| call(f, &[], &ctx, &doc, &counter).unwrap();
        assert_eq!(call(Function::NormalizeSpace), Value::String("a b".into()));
        assert_eq!(call(Function::LocalName), Value::String("item".into()));
        assert_eq!(call(Function::Name), Value::String("p:item".into()));
        assert_eq!(call(Function::StringLength), Value::Number(8.0));
    }

    #[test]
    fn count_rejects_non_node_sets() {
        let doc = Document::empty();
        let counter = WorkCounter::unbounded();
        let ctx = CallContext::single(doc.root());
        let err = call(Function::Count, &[Value::Number(1.0)], &ctx, &doc, &counter);
        assert!(matches!(err, Err(FilterError::TypeMismatch(_))));
    }
}
