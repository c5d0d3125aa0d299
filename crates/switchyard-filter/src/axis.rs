//! Axis traversal.

use switchyard_core::{Document, NodeId, NodeKind};

use crate::ast::{Axis, NodeTest};
use crate::{FilterError, WorkCounter};

/// Append the nodes reachable from `node` along `axis` that pass `test`, in
/// axis order (nearest first for reverse axes). Every visited node is charged.
pub(crate) fn select(
    doc: &Document,
    node: NodeId,
    axis: Axis,
    test: &NodeTest,
    counter: &WorkCounter,
    out: &mut Vec<NodeId>,
) -> Result<(), FilterError> {
    let mut visit = |candidate: NodeId, out: &mut Vec<NodeId>| -> Result<(), FilterError> {
        counter.increase()?;
        if matches(doc, candidate, axis, test) {
            out.push(candidate);
        }
        Ok(())
    };

    match axis {
        Axis::Child => {
            for child in doc.children(node) {
                visit(*child, out)?;
            }
        }
        Axis::Attribute => {
            for attr in doc.attributes(node) {
                visit(*attr, out)?;
            }
        }
        Axis::SelfAxis => visit(node, out)?,
        Axis::Descendant | Axis::DescendantOrSelf => {
            if axis == Axis::DescendantOrSelf {
                visit(node, out)?;
            }
            let mut stack: Vec<NodeId> = doc.children(node).iter().rev().copied().collect();
            while let Some(next) = stack.pop() {
                visit(next, out)?;
                stack.extend(doc.children(next).iter().rev().copied());
            }
        }
        Axis::Parent => {
            if let Some(parent) = doc.parent(node) {
                visit(parent, out)?;
            }
        }
        Axis::Ancestor | Axis::AncestorOrSelf => {
            if axis == Axis::AncestorOrSelf {
                visit(node, out)?;
            }
            let mut current = doc.parent(node);
            while let Some(ancestor) = current {
                visit(ancestor, out)?;
                current = doc.parent(ancestor);
            }
        }
        Axis::FollowingSibling => {
            let siblings = doc.siblings(node);
            if let Some(at) = siblings.iter().position(|s| *s == node) {
                for sibling in &siblings[at + 1..] {
                    visit(*sibling, out)?;
                }
            }
        }
        Axis::PrecedingSibling => {
            let siblings = doc.siblings(node);
            if let Some(at) = siblings.iter().position(|s| *s == node) {
                for sibling in siblings[..at].iter().rev() {
                    visit(*sibling, out)?;
                }
            }
        }
    }
    Ok(())
}

fn matches(doc: &Document, node: NodeId, axis: Axis, test: &NodeTest) -> bool {
    let kind = doc.kind(node);
    let principal = if axis == Axis::Attribute {
        NodeKind::Attribute
    } else {
        NodeKind::Element
    };
    match test {
        NodeTest::Node => true,
        NodeTest::Text => kind == NodeKind::Text,
        NodeTest::Wildcard => kind == principal,
        NodeTest::Name(name) => kind == principal && doc.name(node) == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::DocumentBuilder;

    #[test]
    fn reverse_axes_yield_nearest_first() {
        let doc = DocumentBuilder::new()
            .start("a", &[])
            .start("b", &[])
            .leaf("c", "x")
            .end()
            .end()
            .finish();
        let a = doc.document_element().unwrap();
        let b = doc.children(a)[0];
        let c = doc.children(b)[0];
        let counter = WorkCounter::unbounded();
        let mut out = Vec::new();
        select(&doc, c, Axis::Ancestor, &NodeTest::Wildcard, &counter, &mut out).unwrap();
        assert_eq!(out, vec![b, a]);
    }

    #[test]
    fn traversal_is_charged_per_visited_node() {
        let doc = DocumentBuilder::new()
            .start("a", &[])
            .leaf("b", "1")
            .leaf("b", "2")
            .end()
            .finish();
        let counter = WorkCounter::new(3);
        let mut out = Vec::new();
        let result = select(
            &doc,
            doc.root(),
            Axis::Descendant,
            &NodeTest::Name("b".into()),
            &counter,
            &mut out,
        );
        assert!(matches!(result, Err(FilterError::QuotaExceeded { .. })));
    }
}
