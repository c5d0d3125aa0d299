//! Runtime values and the comparison rules between them.

use switchyard_core::{Document, NodeId};

use crate::ast::RelOp;
use crate::{FilterError, WorkCounter};

/// A query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Number(f64),
    String(String),
    /// Nodes in document order without duplicates.
    NodeSet(Vec<NodeId>),
}

impl Value {
    pub fn to_boolean(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::NodeSet(nodes) => !nodes.is_empty(),
        }
    }

    pub fn to_number(&self, doc: &Document, counter: &WorkCounter) -> Result<f64, FilterError> {
        Ok(match self {
            Self::NodeSet(_) => parse_number(&self.to_text(doc, counter)?),
            atom => atom_number(atom),
        })
    }

    /// The string conversion; the first node's string value for node-sets.
    pub fn to_text(&self, doc: &Document, counter: &WorkCounter) -> Result<String, FilterError> {
        Ok(match self {
            Self::NodeSet(nodes) => match nodes.first() {
                Some(node) => node_text(doc, *node, counter)?,
                None => String::new(),
            },
            atom => atom_text(atom),
        })
    }

    pub fn as_node_set(&self) -> Result<&[NodeId], FilterError> {
        match self {
            Self::NodeSet(nodes) => Ok(nodes),
            other => Err(FilterError::TypeMismatch(format!(
                "expected a node-set, found {other:?}"
            ))),
        }
    }

    pub fn into_node_set(self) -> Result<Vec<NodeId>, FilterError> {
        match self {
            Self::NodeSet(nodes) => Ok(nodes),
            other => Err(FilterError::TypeMismatch(format!(
                "expected a node-set, found {other:?}"
            ))),
        }
    }
}

/// A node's string value, charged against the work budget.
pub(crate) fn node_text(
    doc: &Document,
    node: NodeId,
    counter: &WorkCounter,
) -> Result<String, FilterError> {
    counter.increase()?;
    Ok(doc.string_value(node))
}

pub(crate) fn atom_number(value: &Value) -> f64 {
    match value {
        Value::Boolean(b) => f64::from(u8::from(*b)),
        Value::Number(n) => *n,
        Value::String(s) => parse_number(s),
        Value::NodeSet(_) => f64::NAN,
    }
}

pub(crate) fn atom_text(value: &Value) -> String {
    match value {
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.clone(),
        Value::NodeSet(_) => String::new(),
    }
}

/// Number syntax: optional minus, digits with an optional fraction, with
/// surrounding whitespace. Anything else is NaN.
pub fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let well_formed = !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|c| *c == '.').count() <= 1
        && digits != ".";
    if !well_formed {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_owned()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Compare two values with the query language's rules: node-sets compare
/// existentially, booleans dominate equality, otherwise numbers, otherwise
/// strings.
pub fn compare(
    op: RelOp,
    left: &Value,
    right: &Value,
    doc: &Document,
    counter: &WorkCounter,
) -> Result<bool, FilterError> {
    match (left, right) {
        (Value::NodeSet(a), Value::NodeSet(b)) => {
            let mut right_texts = Vec::with_capacity(b.len());
            for node in b {
                right_texts.push(Value::String(node_text(doc, *node, counter)?));
            }
            for node in a {
                let text = Value::String(node_text(doc, *node, counter)?);
                for other in &right_texts {
                    counter.increase()?;
                    if compare_atoms(op, &text, other) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        (Value::NodeSet(nodes), atom) => node_set_vs_atom(op, nodes, atom, doc, counter),
        (atom, Value::NodeSet(nodes)) => node_set_vs_atom(op.flip(), nodes, atom, doc, counter),
        (l, r) => Ok(compare_atoms(op, l, r)),
    }
}

fn node_set_vs_atom(
    op: RelOp,
    nodes: &[NodeId],
    atom: &Value,
    doc: &Document,
    counter: &WorkCounter,
) -> Result<bool, FilterError> {
    if let Value::Boolean(_) = atom {
        return Ok(compare_atoms(op, &Value::Boolean(!nodes.is_empty()), atom));
    }
    for node in nodes {
        let text = node_text(doc, *node, counter)?;
        let lhs = match atom {
            Value::Number(_) => Value::Number(parse_number(&text)),
            _ => Value::String(text),
        };
        if compare_atoms(op, &lhs, atom) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Compare two non-node-set values.
pub(crate) fn compare_atoms(op: RelOp, left: &Value, right: &Value) -> bool {
    match op {
        RelOp::Eq | RelOp::Ne => {
            let equal = match (left, right) {
                (Value::Boolean(_), _) | (_, Value::Boolean(_)) => {
                    left.to_boolean() == right.to_boolean()
                }
                (Value::Number(_), _) | (_, Value::Number(_)) => {
                    atom_number(left) == atom_number(right)
                }
                _ => atom_text(left) == atom_text(right),
            };
            (op == RelOp::Eq) == equal
        }
        RelOp::Lt => atom_number(left) < atom_number(right),
        RelOp::Le => atom_number(left) <= atom_number(right),
        RelOp::Gt => atom_number(left) > atom_number(right),
        RelOp::Ge => atom_number(left) >= atom_number(right),
    }
}

/// Merge two node lists into document order without duplicates.
pub(crate) fn union_nodes(mut left: Vec<NodeId>, right: &[NodeId]) -> Vec<NodeId> {
    left.extend_from_slice(right);
    left.sort_unstable();
    left.dedup();
    left
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::DocumentBuilder;

    #[test]
    fn number_syntax_is_strict() {
        assert_eq!(parse_number(" 42 "), 42.0);
        assert_eq!(parse_number("-1.5"), -1.5);
        assert_eq!(parse_number(".5"), 0.5);
        assert!(parse_number("1e3").is_nan());
        assert!(parse_number("inf").is_nan());
        assert!(parse_number(".").is_nan());
        assert!(parse_number("").is_nan());
    }

    #[test]
    fn numbers_format_without_trailing_zeroes() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn node_sets_compare_existentially() {
        let doc = DocumentBuilder::new()
            .start("r", &[])
            .leaf("a", "1")
            .leaf("a", "2")
            .end()
            .finish();
        let r = doc.document_element().unwrap();
        let nodes = Value::NodeSet(doc.children(r).to_vec());
        let counter = WorkCounter::unbounded();
        assert!(compare(RelOp::Eq, &nodes, &Value::Number(2.0), &doc, &counter).unwrap());
        assert!(compare(RelOp::Ne, &nodes, &Value::Number(2.0), &doc, &counter).unwrap());
        assert!(compare(RelOp::Gt, &Value::Number(3.0), &nodes, &doc, &counter).unwrap());
        assert!(!compare(RelOp::Eq, &nodes, &Value::String("3".into()), &doc, &counter).unwrap());
        assert!(compare(RelOp::Eq, &nodes, &Value::Boolean(true), &doc, &counter).unwrap());
    }
}
