//! Retrieval filters for `get` and `get-config`.
//!
//! Subtree filters follow the NETCONF selection rules: an empty leaf in the
//! filter selects the matching data node, a leaf with text is a content match
//! constraining its siblings, and an element with children is a containment
//! node that is descended into.
//!
//! XPath filters support absolute location paths with the child (`/`) and
//! descendant (`//`) axes, name tests (prefixes are ignored, `*` matches
//! anything), equality predicates on child leaves and `|` unions, e.g.
//! `/if:interfaces/if:interface[if:name='lo1']/if:mtu`. Matches are returned
//! together with their ancestors and the leaves their predicates tested.
use std::collections::BTreeSet;

use thiserror::Error;

use crate::{protocol::codec::BASE_NAMESPACE, tree::Node};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("xpath filter requires a 'select' attribute")]
    MissingSelect,

    #[error("unsupported filter type '{0}'")]
    UnknownType(String),

    #[error("invalid xpath '{expr}': {reason}")]
    XPath { expr: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The `<filter>` element; its children are the selectors.
    Subtree(Node),
    XPath(String),
}

impl Filter {
    pub fn from_node(node: &Node) -> Result<Self, FilterError> {
        match node.attribute("type").unwrap_or("subtree") {
            "subtree" => Ok(Filter::Subtree(node.clone())),
            "xpath" => node
                .attribute("select")
                .map(|s| Filter::XPath(s.to_string()))
                .ok_or(FilterError::MissingSelect),
            other => Err(FilterError::UnknownType(other.to_string())),
        }
    }

    pub fn to_node(&self) -> Node {
        match self {
            Filter::Subtree(node) => {
                let mut filter = node.clone();
                filter.name = "filter".to_string();
                filter.set_attribute("type", "subtree");
                filter
            }
            Filter::XPath(expr) => Node::new("filter")
                .with_attribute("type", "xpath")
                .with_attribute("select", expr.clone()),
        }
    }

    /// Reduce `root` (a `<data>`-like container) to the selected content.
    pub fn apply(&self, root: &Node) -> Result<Node, FilterError> {
        match self {
            Filter::Subtree(filter) => Ok(apply_subtree(root, filter)),
            Filter::XPath(expr) => apply_xpath(root, expr),
        }
    }
}

fn same_element(data: &Node, filter: &Node) -> bool {
    if data.name != filter.name {
        return false;
    }
    match filter.namespace.as_deref() {
        None | Some(BASE_NAMESPACE) => true,
        Some(ns) => data.namespace.as_deref() == Some(ns),
    }
}

fn content_value(filter: &Node) -> Option<&str> {
    if !filter.children.is_empty() {
        return None;
    }
    filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

fn apply_subtree(root: &Node, filter: &Node) -> Node {
    let mut out = root.shell();
    for data in &root.children {
        let filters: Vec<&Node> = filter
            .children
            .iter()
            .filter(|f| same_element(data, f))
            .collect();
        if let Some(selected) = select_subtree(data, &filters) {
            out.push(selected);
        }
    }
    out
}

/// Select from `data` by every sibling filter node that names it; the result
/// is the union of their selections.
fn select_subtree(data: &Node, filters: &[&Node]) -> Option<Node> {
    let mut active = Vec::new();
    for filter in filters {
        if let Some(value) = content_value(filter) {
            if data.text.as_deref().map(str::trim) == Some(value) {
                return Some(data.clone());
            }
            continue;
        }
        if filter.children.is_empty() {
            return Some(data.clone());
        }

        let (matches, others): (Vec<&Node>, Vec<&Node>) = filter
            .children
            .iter()
            .partition(|f| content_value(f).is_some());
        let satisfied = matches.iter().all(|m| {
            data.children
                .iter()
                .any(|d| same_element(d, m) && d.text.as_deref().map(str::trim) == content_value(m))
        });
        if !satisfied {
            continue;
        }
        if others.is_empty() {
            return Some(data.clone());
        }
        active.push((matches, others));
    }
    if active.is_empty() {
        return None;
    }

    let mut out = data.shell();
    let mut selected = false;
    for child in &data.children {
        if active
            .iter()
            .any(|(matches, _)| matches.iter().any(|m| same_element(child, m)))
        {
            out.push(child.clone());
            continue;
        }
        let nested: Vec<&Node> = active
            .iter()
            .flat_map(|(_, others)| others.iter().copied())
            .filter(|f| same_element(child, f))
            .collect();
        if nested.is_empty() {
            continue;
        }
        if let Some(node) = select_subtree(child, &nested) {
            out.push(node);
            selected = true;
        }
    }
    selected.then_some(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    descendant: bool,
    name: String,
    predicates: Vec<(String, String)>,
}

impl Step {
    fn matches(&self, node: &Node) -> bool {
        (self.name == "*" || self.name == node.name)
            && self.predicates.iter().all(|(leaf, value)| {
                node.children_named(leaf)
                    .any(|c| c.text.as_deref().map(str::trim) == Some(value.as_str()))
            })
    }
}

fn apply_xpath(root: &Node, expr: &str) -> Result<Node, FilterError> {
    let mut selected = BTreeSet::new();
    for path in split_outside_quotes(expr, '|') {
        let steps = parse_path(path.trim()).map_err(|reason| FilterError::XPath {
            expr: expr.to_string(),
            reason,
        })?;
        evaluate(root, &steps, &mut Vec::new(), &mut selected);
    }

    let mut out = root.shell();
    let mut prefix = Vec::new();
    for (i, child) in root.children.iter().enumerate() {
        prefix.push(i);
        if let Some(node) = prune(child, &mut prefix, &selected) {
            out.push(node);
        }
        prefix.pop();
    }
    Ok(out)
}

fn evaluate(
    node: &Node,
    steps: &[Step],
    prefix: &mut Vec<usize>,
    selected: &mut BTreeSet<Vec<usize>>,
) {
    let Some((step, rest)) = steps.split_first() else {
        return;
    };

    for (i, child) in node.children.iter().enumerate() {
        prefix.push(i);
        if step.matches(child) {
            for (leaf, _) in &step.predicates {
                if let Some(j) = child.children.iter().position(|c| &c.name == leaf) {
                    let mut path = prefix.clone();
                    path.push(j);
                    selected.insert(path);
                }
            }
            if rest.is_empty() {
                selected.insert(prefix.clone());
            } else {
                evaluate(child, rest, prefix, selected);
            }
        }
        if step.descendant {
            evaluate(child, steps, prefix, selected);
        }
        prefix.pop();
    }
}

fn prune(node: &Node, prefix: &mut Vec<usize>, selected: &BTreeSet<Vec<usize>>) -> Option<Node> {
    if selected.contains(prefix.as_slice()) {
        return Some(node.clone());
    }
    let below = selected
        .range(prefix.clone()..)
        .next()
        .is_some_and(|p| p.starts_with(prefix));
    if !below {
        return None;
    }

    let mut out = node.shell();
    for (i, child) in node.children.iter().enumerate() {
        prefix.push(i);
        if let Some(n) = prune(child, prefix, selected) {
            out.push(n);
        }
        prefix.pop();
    }
    Some(out)
}

fn split_outside_quotes(expr: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn parse_path(path: &str) -> Result<Vec<Step>, String> {
    if !path.starts_with('/') {
        return Err("only absolute location paths are supported".to_string());
    }

    let mut steps = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            return Err(format!("expected '/' before '{rest}'"));
        };

        let end = rest.find(['/', '[']).unwrap_or(rest.len());
        let name = local_name(rest[..end].trim());
        if name.is_empty() {
            return Err("empty step".to_string());
        }
        if !name
            .chars()
            .all(|c| c == '*' || c == '-' || c == '_' || c == '.' || c.is_alphanumeric())
        {
            return Err(format!("unsupported step '{name}'"));
        }
        rest = &rest[end..];

        let mut predicates = Vec::new();
        while let Some(r) = rest.strip_prefix('[') {
            let close = find_predicate_end(r).ok_or("unterminated predicate")?;
            predicates.push(parse_predicate(&r[..close])?);
            rest = &r[close + 1..];
        }

        steps.push(Step {
            descendant,
            name: name.to_string(),
            predicates,
        });
    }

    if steps.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(steps)
}

fn find_predicate_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_predicate(body: &str) -> Result<(String, String), String> {
    let (leaf, value) = body
        .split_once('=')
        .ok_or_else(|| format!("unsupported predicate '[{body}]'"))?;
    let leaf = local_name(leaf.trim());
    let value = value.trim();

    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .ok_or_else(|| format!("predicate value {value} must be quoted"))?;

    if leaf.is_empty() {
        return Err("predicate without a leaf name".to_string());
    }
    Ok((leaf.to_string(), unquoted.to_string()))
}
