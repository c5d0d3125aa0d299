//! The node tree message bodies are made of.
//!
//! Nodes live in an arena and are identified by [`NodeId`]. Ids are handed out
//! in document order (an element, then its attributes, then its children), so
//! sorting ids sorts nodes into document order.

use core::fmt;

/// Index of a node within its [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element,
    Attribute,
    Text,
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    name: String,
    value: String,
    parent: Option<NodeId>,
    attributes: Vec<NodeId>,
    children: Vec<NodeId>,
}

/// An immutable node tree.
#[derive(Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
}

impl Document {
    /// A document holding only the root node.
    pub fn empty() -> Self {
        DocumentBuilder::new().finish()
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The first element child of the root.
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|id| self.kind(*id) == NodeKind::Element)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document_element().is_none()
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind
    }

    /// Element or attribute name; empty for root and text nodes.
    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn attributes(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).attributes
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attributes(id)
            .iter()
            .find(|a| self.name(**a) == name)
            .map(|a| self.node(*a).value.as_str())
    }

    /// Siblings of `id` in document order, including `id` itself.
    pub fn siblings(&self, id: NodeId) -> &[NodeId] {
        match (self.kind(id), self.parent(id)) {
            (NodeKind::Element | NodeKind::Text, Some(parent)) => self.children(parent),
            _ => &[],
        }
    }

    /// The text value of a node: the concatenated descendant text for roots and
    /// elements, the literal value for attributes and text.
    pub fn string_value(&self, id: NodeId) -> String {
        let node = self.node(id);
        match node.kind {
            NodeKind::Attribute | NodeKind::Text => node.value.clone(),
            NodeKind::Root | NodeKind::Element => {
                let mut out = String::new();
                self.collect_text(id, &mut out);
                out
            }
        }
    }

    /// The first element child of `id` with the given name.
    pub fn child_element(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.kind(*c) == NodeKind::Element && self.name(*c) == name)
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        for child in &self.node(id).children {
            let node = self.node(*child);
            match node.kind {
                NodeKind::Text => out.push_str(&node.value),
                NodeKind::Element => self.collect_text(*child, out),
                NodeKind::Root | NodeKind::Attribute => {}
            }
        }
    }

    fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(doc: &Document, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match doc.kind(id) {
                NodeKind::Text => write!(f, "{:?}", doc.node(id).value),
                NodeKind::Attribute => Ok(()),
                NodeKind::Root | NodeKind::Element => {
                    if doc.kind(id) == NodeKind::Element {
                        write!(f, "<{}", doc.name(id))?;
                        for attr in doc.attributes(id) {
                            write!(f, " {}={:?}", doc.name(*attr), doc.node(*attr).value)?;
                        }
                        write!(f, ">")?;
                    }
                    for child in doc.children(id) {
                        write_node(doc, *child, f)?;
                    }
                    if doc.kind(id) == NodeKind::Element {
                        write!(f, "</{}>", doc.name(id))?;
                    }
                    Ok(())
                }
            }
        }
        write_node(self, self.root(), f)
    }
}

/// Builds a [`Document`] top-down.
///
/// ```
/// use switchyard_core::DocumentBuilder;
///
/// let doc = DocumentBuilder::new()
///     .start("order", &[("id", "7")])
///     .leaf("item", "apple")
///     .end()
///     .finish();
/// assert_eq!(doc.string_value(doc.root()), "apple");
/// ```
#[derive(Debug)]
pub struct DocumentBuilder {
    nodes: Vec<NodeData>,
    open: Vec<NodeId>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                kind: NodeKind::Root,
                name: String::new(),
                value: String::new(),
                parent: None,
                attributes: Vec::new(),
                children: Vec::new(),
            }],
            open: vec![NodeId(0)],
        }
    }

    /// Open an element with its attributes.
    pub fn start(mut self, name: &str, attributes: &[(&str, &str)]) -> Self {
        let element = self.push_child(NodeKind::Element, name, "");
        for (attr_name, attr_value) in attributes {
            let attr = self.push(NodeKind::Attribute, attr_name, attr_value, Some(element));
            self.nodes[element.index()].attributes.push(attr);
        }
        self.open.push(element);
        self
    }

    /// Close the innermost open element. Closing the root is ignored.
    pub fn end(mut self) -> Self {
        if self.open.len() > 1 {
            self.open.pop();
        }
        self
    }

    pub fn text(mut self, value: &str) -> Self {
        self.push_child(NodeKind::Text, "", value);
        self
    }

    /// `<name>value</name>` in one call.
    pub fn leaf(self, name: &str, value: &str) -> Self {
        self.start(name, &[]).text(value).end()
    }

    /// Copy the subtree rooted at `id` from another document under the
    /// innermost open element.
    pub fn copy_subtree(mut self, source: &Document, id: NodeId) -> Self {
        self.copy_node(source, id);
        self
    }

    pub fn finish(self) -> Document {
        Document { nodes: self.nodes }
    }

    fn copy_node(&mut self, source: &Document, id: NodeId) {
        match source.kind(id) {
            NodeKind::Root => {
                for child in source.children(id) {
                    self.copy_node(source, *child);
                }
            }
            NodeKind::Text => {
                self.push_child(NodeKind::Text, "", &source.node(id).value);
            }
            NodeKind::Attribute => {}
            NodeKind::Element => {
                let element = self.push_child(NodeKind::Element, source.name(id), "");
                for attr in source.attributes(id) {
                    let copied = self.push(
                        NodeKind::Attribute,
                        source.name(*attr),
                        &source.node(*attr).value,
                        Some(element),
                    );
                    self.nodes[element.index()].attributes.push(copied);
                }
                self.open.push(element);
                for child in source.children(id) {
                    self.copy_node(source, *child);
                }
                self.open.pop();
            }
        }
    }

    fn push_child(&mut self, kind: NodeKind, name: &str, value: &str) -> NodeId {
        let parent = self.open.last().copied().unwrap_or(NodeId(0));
        let id = self.push(kind, name, value, Some(parent));
        self.nodes[parent.index()].children.push(id);
        id
    }

    fn push(&mut self, kind: NodeKind, name: &str, value: &str, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            kind,
            name: name.to_owned(),
            value: value.to_owned(),
            parent,
            attributes: Vec::new(),
            children: Vec::new(),
        });
        id
    }
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        DocumentBuilder::new()
            .start("a", &[("k", "v")])
            .leaf("b", "one")
            .start("c", &[])
            .leaf("b", "two")
            .end()
            .end()
            .finish()
    }

    #[test]
    fn ids_follow_document_order() {
        let doc = sample();
        let a = doc.document_element().unwrap();
        let attr = doc.attributes(a)[0];
        let b = doc.children(a)[0];
        assert!(a < attr && attr < b);
        assert_eq!(doc.attribute(a, "k"), Some("v"));
    }

    #[test]
    fn string_value_concatenates_descendant_text() {
        let doc = sample();
        assert_eq!(doc.string_value(doc.root()), "onetwo");
        let c = doc.child_element(doc.document_element().unwrap(), "c").unwrap();
        assert_eq!(doc.string_value(c), "two");
    }

    #[test]
    fn copy_subtree_preserves_structure() {
        let source = sample();
        let copied = DocumentBuilder::new()
            .start("wrapper", &[])
            .copy_subtree(&source, source.root())
            .end()
            .finish();
        let wrapper = copied.document_element().unwrap();
        let a = copied.child_element(wrapper, "a").unwrap();
        assert_eq!(copied.attribute(a, "k"), Some("v"));
        assert_eq!(copied.string_value(wrapper), "onetwo");
    }
}
