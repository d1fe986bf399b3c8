//! Structured configuration trees.
//!
//! Every payload that crosses the protocol boundary (edit subtrees, filters,
//! datastore contents, `<data>` replies) is held as a [`Node`] tree. A node is
//! an XML element reduced to what NETCONF cares about: a local name, a resolved
//! namespace, non-namespace attributes, optional text and ordered children.
//!
//! # Canonical form
//!
//! [`Node::to_xml`] renders a tree deterministically: attributes in insertion
//! order, a namespace declaration only where it differs from the parent (a
//! node without a namespace inherits its parent's), and no insignificant
//! whitespace. Two trees are structurally equal exactly when
//! their canonical renderings are equal.
//!
//! # Example
//! ```rust
//! use netconfd::tree::Node;
//!
//! let node = Node::parse(r#"<interface xmlns="urn:example"><name>lo1</name></interface>"#).unwrap();
//! assert_eq!(node.child_text("name"), Some("lo1"));
//! assert_eq!(node.namespace.as_deref(), Some("urn:example"));
//! ```
use std::fmt;

use quick_xml::{
    escape::escape,
    events::{BytesStart, Event},
    reader::Reader,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("xml syntax error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid utf-8 in document: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("namespace prefix '{0}' is not bound")]
    UnboundPrefix(String),

    #[error("element '{0}' is never closed")]
    Unclosed(String),

    #[error("closing tag without matching opening tag")]
    UnexpectedEnd,

    #[error("document has no root element")]
    Empty,

    #[error("document has more than one root element")]
    MultipleRoots,

    #[error("text outside of the root element")]
    StrayText,
}

/// A single element of a configuration or protocol tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Node>,
}

type Scope = Vec<(Option<String>, String)>;

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Leaf element carrying `text`.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: Node) {
        self.children.push(child);
    }

    /// True for elements without children (leaves and empty containers).
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.text.as_deref().is_none_or(|t| t.trim().is_empty())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text.as_deref())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(k, _)| k == name)?;
        Some(self.attributes.remove(pos).1)
    }

    /// Copy of this node without its children.
    pub fn shell(&self) -> Node {
        Node {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            attributes: self.attributes.clone(),
            text: self.text.clone(),
            children: Vec::new(),
        }
    }

    /// Parse a complete XML document into a tree rooted at its document element.
    pub fn parse(xml: &str) -> Result<Node, TreeError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Node> = Vec::new();
        let mut scopes: Vec<Scope> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let node = open_element(&e, &mut scopes)?;
                    stack.push(node);
                }
                Event::Empty(e) => {
                    let node = open_element(&e, &mut scopes)?;
                    scopes.pop();
                    close_element(node, &mut stack, &mut root)?;
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or(TreeError::UnexpectedEnd)?;
                    scopes.pop();
                    close_element(node, &mut stack, &mut root)?;
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    append_text(&mut stack, &text)?;
                }
                Event::CData(c) => {
                    let text = std::str::from_utf8(&c)?.to_string();
                    append_text(&mut stack, &text)?;
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.pop() {
            return Err(TreeError::Unclosed(open.name));
        }
        root.ok_or(TreeError::Empty)
    }

    /// Canonical serialization.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, None);
        out
    }

    fn write_xml(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        let namespace = self.namespace.as_deref().or(parent_ns);
        if let Some(ns) = namespace.filter(|ns| Some(*ns) != parent_ns) {
            out.push_str(" xmlns=\"");
            out.push_str(&escape(ns));
            out.push('"');
        }
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }

        let text = self.text.as_deref().filter(|t| !t.is_empty());
        if text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        if let Some(text) = text {
            out.push_str(&escape(text));
        }
        for child in &self.children {
            child.write_xml(out, namespace);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn open_element(e: &BytesStart, scopes: &mut Vec<Scope>) -> Result<Node, TreeError> {
    let mut scope = Scope::new();
    let mut attributes = Vec::new();

    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attr.key.as_ref())?;
        let value = attr.unescape_value()?.into_owned();

        if key == "xmlns" {
            scope.push((None, value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.push((Some(prefix.to_string()), value));
        } else {
            let local = key.rsplit(':').next().unwrap_or(key);
            attributes.push((local.to_string(), value));
        }
    }
    scopes.push(scope);

    let qname = std::str::from_utf8(e.name().as_ref())?.to_string();
    let (prefix, local) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname.as_str()),
    };

    let namespace = resolve(scopes, prefix)?;
    Ok(Node {
        name: local.to_string(),
        namespace,
        attributes,
        text: None,
        children: Vec::new(),
    })
}

fn resolve(scopes: &[Scope], prefix: Option<&str>) -> Result<Option<String>, TreeError> {
    for scope in scopes.iter().rev() {
        if let Some((_, uri)) = scope.iter().find(|(p, _)| p.as_deref() == prefix) {
            return Ok(Some(uri.clone()).filter(|u| !u.is_empty()));
        }
    }
    match prefix {
        Some("xml") | None => Ok(None),
        Some(p) => Err(TreeError::UnboundPrefix(p.to_string())),
    }
}

fn close_element(
    node: Node,
    stack: &mut [Node],
    root: &mut Option<Node>,
) -> Result<(), TreeError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_some() => Err(TreeError::MultipleRoots),
        None => {
            *root = Some(node);
            Ok(())
        }
    }
}

fn append_text(stack: &mut [Node], text: &str) -> Result<(), TreeError> {
    match stack.last_mut() {
        Some(node) => {
            node.text.get_or_insert_with(String::new).push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(TreeError::StrayText),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_default_and_prefixed_namespaces() {
        let xml = r#"<nc:rpc xmlns:nc="urn:base" message-id="7">
            <edit-config xmlns="urn:ops"><target><candidate/></target></edit-config>
        </nc:rpc>"#;
        let root = Node::parse(xml).unwrap();

        assert_eq!(root.name, "rpc");
        assert_eq!(root.namespace.as_deref(), Some("urn:base"));
        assert_eq!(root.attribute("message-id"), Some("7"));

        let edit = root.child("edit-config").unwrap();
        assert_eq!(edit.namespace.as_deref(), Some("urn:ops"));
        let target = edit.child("target").unwrap();
        assert_eq!(target.namespace.as_deref(), Some("urn:ops"));
        assert!(target.child("candidate").is_some());
    }

    #[test]
    fn prefixed_attributes_keep_local_name() {
        let xml = r#"<interface xmlns:nc="urn:base" nc:operation="delete"/>"#;
        let root = Node::parse(xml).unwrap();
        assert_eq!(root.attribute("operation"), Some("delete"));
    }

    #[test]
    fn text_is_unescaped_and_reescaped() {
        let root = Node::parse("<description>a &lt;b&gt; &amp; c</description>").unwrap();
        assert_eq!(root.text.as_deref(), Some("a <b> & c"));
        assert_eq!(
            root.to_xml(),
            "<description>a &lt;b&gt; &amp; c</description>"
        );
    }

    #[test]
    fn canonical_form_declares_namespace_once() {
        let tree = Node::new("interfaces")
            .with_namespace("urn:if")
            .with_child(
                Node::new("interface")
                    .with_namespace("urn:if")
                    .with_child(Node::leaf("name", "lo1").with_namespace("urn:if")),
            );
        assert_eq!(
            tree.to_xml(),
            r#"<interfaces xmlns="urn:if"><interface><name>lo1</name></interface></interfaces>"#
        );
    }

    #[test]
    fn canonical_form_is_stable_across_reparse() {
        let xml = r#"<a xmlns="urn:x"><b k="v">t</b><c/></a>"#;
        let once = Node::parse(xml).unwrap();
        let twice = Node::parse(&once.to_xml()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_xml(), xml);
    }

    #[test]
    fn unclosed_element_is_rejected() {
        assert!(Node::parse("<a><b></b>").is_err());
        assert!(Node::parse("<a></b>").is_err());
    }

    #[test]
    #[should_panic(expected = "UnboundPrefix")]
    fn unbound_prefix_is_rejected() {
        Node::parse("<x:a/>").unwrap();
    }

    #[test]
    fn empty_document_is_rejected() {
        assert!(matches!(Node::parse("  "), Err(TreeError::Empty)));
    }

    #[test]
    fn attribute_helpers() {
        let mut node = Node::new("a").with_attribute("operation", "merge");
        node.set_attribute("operation", "delete");
        assert_eq!(node.attribute("operation"), Some("delete"));
        assert_eq!(node.remove_attribute("operation").as_deref(), Some("delete"));
        assert!(node.attributes.is_empty());
    }
}
