//! The edit-config algorithm.
//!
//! An edit is a `<config>` tree whose elements may carry an `operation`
//! attribute (`merge`, `replace`, `create`, `delete`, `remove`, `none`).
//! Elements without one inherit their parent's, and top-level elements
//! inherit the request's default operation. Data nodes are matched by name,
//! namespace and, for list entries, by their key leaves as reported by the
//! schema library.
//!
//! The edit is applied to a scratch copy of the target and only swapped in
//! once it has applied cleanly and the result passes schema validation, so a
//! failed edit never leaves a half-applied tree behind. The exception is
//! `continue-on-error`, which keeps every element that applied and reports
//! the first failure.
use log::trace;
use thiserror::Error;

use crate::{
    adapter::schema::{NodeKind, SchemaError, SchemaLibrary, entry_path},
    tree::Node,
};

const OPERATION_ATTRIBUTE: &str = "operation";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("data already exists at {path}")]
    DataExists { path: String },

    #[error("no data to delete at {path}")]
    DataMissing { path: String },

    #[error("list entry at {path} is missing key '{key}'")]
    MissingKey { key: String, path: String },

    #[error("invalid operation '{operation}' at {path}")]
    BadOperation { operation: String, path: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl EditError {
    pub fn path(&self) -> &str {
        match self {
            EditError::DataExists { path }
            | EditError::DataMissing { path }
            | EditError::MissingKey { path, .. }
            | EditError::BadOperation { path, .. } => path,
            EditError::Schema(e) => &e.path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOperation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

impl EditOperation {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "merge" => EditOperation::Merge,
            "replace" => EditOperation::Replace,
            "create" => EditOperation::Create,
            "delete" => EditOperation::Delete,
            "remove" => EditOperation::Remove,
            "none" => EditOperation::None,
            _ => return None,
        })
    }
}

/// The `default-operation` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultOperation {
    #[default]
    Merge,
    Replace,
    None,
}

impl DefaultOperation {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "merge" => DefaultOperation::Merge,
            "replace" => DefaultOperation::Replace,
            "none" => DefaultOperation::None,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultOperation::Merge => "merge",
            DefaultOperation::Replace => "replace",
            DefaultOperation::None => "none",
        }
    }

    fn operation(&self) -> EditOperation {
        match self {
            DefaultOperation::Merge => EditOperation::Merge,
            DefaultOperation::Replace => EditOperation::Replace,
            DefaultOperation::None => EditOperation::None,
        }
    }
}

/// The `error-option` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorOption {
    #[default]
    StopOnError,
    ContinueOnError,
    RollbackOnError,
}

impl ErrorOption {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "stop-on-error" => ErrorOption::StopOnError,
            "continue-on-error" => ErrorOption::ContinueOnError,
            "rollback-on-error" => ErrorOption::RollbackOnError,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOption::StopOnError => "stop-on-error",
            ErrorOption::ContinueOnError => "continue-on-error",
            ErrorOption::RollbackOnError => "rollback-on-error",
        }
    }
}

/// One edit-config invocation.
pub struct Edit<'a> {
    schema: &'a dyn SchemaLibrary,
    default_operation: DefaultOperation,
    error_option: ErrorOption,
}

impl<'a> Edit<'a> {
    pub fn new(schema: &'a dyn SchemaLibrary) -> Self {
        Self {
            schema,
            default_operation: DefaultOperation::default(),
            error_option: ErrorOption::default(),
        }
    }

    pub fn default_operation(mut self, op: DefaultOperation) -> Self {
        self.default_operation = op;
        self
    }

    pub fn error_option(mut self, option: ErrorOption) -> Self {
        self.error_option = option;
        self
    }

    /// Apply the children of `config` to `target`.
    ///
    /// On error `target` is unchanged, except under `continue-on-error` where
    /// the elements that applied are kept and the first error is returned.
    pub fn apply(&self, target: &mut Node, config: &Node) -> Result<(), EditError> {
        let mut edit = config.clone();
        self.schema.normalize(&mut edit);

        let mut scratch = target.clone();
        if self.default_operation == DefaultOperation::Replace {
            scratch.children.clear();
        }

        let mut errors = Vec::new();
        let mut path = Vec::new();
        self.edit_children(
            &mut scratch,
            &edit,
            &mut path,
            "",
            self.default_operation.operation(),
            &[],
            &mut errors,
        )?;

        self.schema.validate(&scratch)?;
        *target = scratch;

        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_children<'e>(
        &self,
        data: &mut Node,
        edit: &'e Node,
        path: &mut Vec<&'e str>,
        data_path: &str,
        inherited: EditOperation,
        skip: &[String],
        errors: &mut Vec<EditError>,
    ) -> Result<(), EditError> {
        for child in edit.children.iter().filter(|c| !skip.contains(&c.name)) {
            if self.error_option != ErrorOption::ContinueOnError {
                self.edit_node(data, child, path, data_path, inherited, errors)?;
                continue;
            }

            let snapshot = data.clone();
            if let Err(err) = self.edit_node(data, child, path, data_path, inherited, errors) {
                trace!("continuing past failed edit: {err}");
                *data = snapshot;
                errors.push(err);
            }
        }
        Ok(())
    }

    fn edit_node<'e>(
        &self,
        data: &mut Node,
        edit: &'e Node,
        path: &mut Vec<&'e str>,
        data_path: &str,
        inherited: EditOperation,
        errors: &mut Vec<EditError>,
    ) -> Result<(), EditError> {
        path.push(&edit.name);
        let result = self.edit_node_at(data, edit, path, data_path, inherited, errors);
        path.pop();
        result
    }

    fn edit_node_at<'e>(
        &self,
        data: &mut Node,
        edit: &'e Node,
        path: &mut Vec<&'e str>,
        data_path: &str,
        inherited: EditOperation,
        errors: &mut Vec<EditError>,
    ) -> Result<(), EditError> {
        let kind = self.schema.node_kind(path).unwrap_or(if edit.children.is_empty() {
            NodeKind::Leaf
        } else {
            NodeKind::Container
        });

        let node_path = match &kind {
            NodeKind::List(keys) => {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                let node_path = entry_path(data_path, edit, &keys);
                if let Some(missing) = keys.iter().find(|k| edit.child(k).is_none()) {
                    return Err(EditError::MissingKey {
                        key: missing.to_string(),
                        path: node_path,
                    });
                }
                node_path
            }
            _ => format!("{data_path}/{}", edit.name),
        };

        let op = match edit.attribute(OPERATION_ATTRIBUTE) {
            Some(attr) => EditOperation::parse(attr).ok_or_else(|| EditError::BadOperation {
                operation: attr.to_string(),
                path: node_path.clone(),
            })?,
            None => inherited,
        };

        let existing = data.children.iter().position(|d| matches(d, edit, &kind));
        trace!("{op:?} at {node_path} (present: {})", existing.is_some());

        match (op, existing) {
            (EditOperation::Create, Some(_)) => Err(EditError::DataExists { path: node_path }),
            (EditOperation::Delete, None) => Err(EditError::DataMissing { path: node_path }),
            (EditOperation::Delete | EditOperation::Remove, Some(idx)) => {
                data.children.remove(idx);
                Ok(())
            }
            (EditOperation::Remove, None) => Ok(()),
            (EditOperation::Create | EditOperation::Merge | EditOperation::Replace, None) => {
                data.push(fresh(edit, &kind));
                let idx = data.children.len() - 1;
                self.descend(&mut data.children[idx], edit, path, &node_path, op, &kind, errors)
            }
            (EditOperation::Replace, Some(idx)) => {
                data.children[idx] = fresh(edit, &kind);
                self.descend(&mut data.children[idx], edit, path, &node_path, op, &kind, errors)
            }
            (EditOperation::Merge, Some(idx)) => {
                let node = &mut data.children[idx];
                if matches!(kind, NodeKind::Leaf | NodeKind::LeafList) {
                    node.text = edit.text.clone();
                    return Ok(());
                }
                self.descend(node, edit, path, &node_path, op, &kind, errors)
            }
            (EditOperation::None, Some(idx)) => {
                self.descend(&mut data.children[idx], edit, path, &node_path, op, &kind, errors)
            }
            (EditOperation::None, None) => {
                if matches!(kind, NodeKind::Leaf | NodeKind::LeafList) {
                    return Ok(());
                }
                let mut implicit = fresh(edit, &kind);
                let baseline = implicit.children.len();
                self.descend(&mut implicit, edit, path, &node_path, op, &kind, errors)?;
                if implicit.children.len() > baseline {
                    data.push(implicit);
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn descend<'e>(
        &self,
        node: &mut Node,
        edit: &'e Node,
        path: &mut Vec<&'e str>,
        node_path: &str,
        op: EditOperation,
        kind: &NodeKind,
        errors: &mut Vec<EditError>,
    ) -> Result<(), EditError> {
        match kind {
            NodeKind::Leaf | NodeKind::LeafList => Ok(()),
            // Key leaves identify the entry and are never edited themselves.
            NodeKind::List(keys) => {
                self.edit_children(node, edit, path, node_path, op, keys, errors)
            }
            NodeKind::Container => self.edit_children(node, edit, path, node_path, op, &[], errors),
        }
    }
}

/// Whether data node `data` is the instance addressed by edit node `edit`.
fn matches(data: &Node, edit: &Node, kind: &NodeKind) -> bool {
    if data.name != edit.name {
        return false;
    }
    if let (Some(a), Some(b)) = (&data.namespace, &edit.namespace) {
        if a != b {
            return false;
        }
    }
    match kind {
        NodeKind::List(keys) => keys
            .iter()
            .all(|k| data.child_text(k).map(str::trim) == edit.child_text(k).map(str::trim)),
        NodeKind::LeafList => data.text.as_deref().map(str::trim) == edit.text.as_deref().map(str::trim),
        NodeKind::Container | NodeKind::Leaf => true,
    }
}

/// A new data node for `edit`: leaves take its value, list entries start
/// out with their key leaves, containers start empty.
fn fresh(edit: &Node, kind: &NodeKind) -> Node {
    let mut node = edit.shell();
    node.remove_attribute(OPERATION_ATTRIBUTE);
    match kind {
        NodeKind::Leaf | NodeKind::LeafList => {}
        NodeKind::List(keys) => {
            node.text = None;
            for key in keys {
                if let Some(leaf) = edit.child(key) {
                    let mut leaf = leaf.shell();
                    leaf.remove_attribute(OPERATION_ATTRIBUTE);
                    node.push(leaf);
                }
            }
        }
        NodeKind::Container => node.text = None,
    }
    node
}

#[cfg(test)]
mod tests {
    use crate::adapter::schema::{INTERFACES_NAMESPACE, SchemaContext};

    use super::*;

    fn schema() -> SchemaContext {
        SchemaContext::with_default_modules(Vec::new()).unwrap()
    }

    fn config(schema: &SchemaContext, body: &str) -> Node {
        schema.parse(&format!("<config>{body}</config>")).unwrap()
    }

    fn lo(name: &str, mtu: &str) -> String {
        format!("<interfaces><interface><name>{name}</name><mtu>{mtu}</mtu></interface></interfaces>")
    }

    fn mtu_of(tree: &Node, name: &str) -> Option<String> {
        tree.child("interfaces")?
            .children_named("interface")
            .find(|i| i.child_text("name") == Some(name))?
            .child_text("mtu")
            .map(str::to_string)
    }

    #[test]
    fn merge_creates_then_updates() {
        let schema = schema();
        let mut target = Node::new("config");

        Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "1500")))
            .unwrap();
        assert_eq!(mtu_of(&target, "lo1").as_deref(), Some("1500"));
        assert_eq!(
            target.child("interfaces").unwrap().namespace.as_deref(),
            Some(INTERFACES_NAMESPACE)
        );

        Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "9000")))
            .unwrap();
        assert_eq!(mtu_of(&target, "lo1").as_deref(), Some("9000"));
        assert_eq!(
            target.child("interfaces").unwrap().children_named("interface").count(),
            1
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let schema = schema();
        let edit = config(&schema, &lo("lo1", "1500"));
        let mut once = Node::new("config");
        Edit::new(&schema).apply(&mut once, &edit).unwrap();
        let mut twice = once.clone();
        Edit::new(&schema).apply(&mut twice, &edit).unwrap();
        assert_eq!(once.to_xml(), twice.to_xml());
    }

    #[test]
    fn create_existing_is_data_exists() {
        let schema = schema();
        let mut target = Node::new("config");
        Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "1500")))
            .unwrap();
        let before = target.clone();

        let edit = config(
            &schema,
            r#"<interfaces><interface operation="create"><name>lo1</name></interface></interfaces>"#,
        );
        let err = Edit::new(&schema).apply(&mut target, &edit).unwrap_err();
        assert_eq!(
            err,
            EditError::DataExists {
                path: "/interfaces/interface[name='lo1']".to_string()
            }
        );
        assert_eq!(target, before);
    }

    #[test]
    fn delete_and_remove() {
        let schema = schema();
        let mut target = Node::new("config");
        Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "1500")))
            .unwrap();

        let delete_mtu = config(
            &schema,
            r#"<interfaces><interface><name>lo1</name><mtu operation="delete"/></interface></interfaces>"#,
        );
        Edit::new(&schema).apply(&mut target, &delete_mtu).unwrap();
        assert_eq!(mtu_of(&target, "lo1"), None);

        let err = Edit::new(&schema).apply(&mut target, &delete_mtu).unwrap_err();
        assert!(matches!(err, EditError::DataMissing { .. }));

        let remove_mtu = config(
            &schema,
            r#"<interfaces><interface><name>lo1</name><mtu operation="remove"/></interface></interfaces>"#,
        );
        Edit::new(&schema).apply(&mut target, &remove_mtu).unwrap();
    }

    #[test]
    fn replace_drops_unmentioned_children() {
        let schema = schema();
        let mut target = Node::new("config");
        Edit::new(&schema)
            .apply(
                &mut target,
                &config(
                    &schema,
                    "<interfaces><interface><name>lo1</name><mtu>1500</mtu>\
                     <description>uplink</description></interface></interfaces>",
                ),
            )
            .unwrap();

        let edit = config(
            &schema,
            r#"<interfaces><interface operation="replace"><name>lo1</name><mtu>9000</mtu></interface></interfaces>"#,
        );
        Edit::new(&schema).apply(&mut target, &edit).unwrap();
        let iface = target.child("interfaces").unwrap().child("interface").unwrap();
        assert_eq!(iface.child_text("mtu"), Some("9000"));
        assert!(iface.child("description").is_none());
        assert!(iface.attribute("operation").is_none());
    }

    #[test]
    fn none_does_not_create_empty_entries() {
        let schema = schema();
        let mut target = Node::new("config");
        let edit = config(
            &schema,
            r#"<interfaces><interface><name>lo9</name><mtu operation="remove"/></interface></interfaces>"#,
        );
        Edit::new(&schema)
            .default_operation(DefaultOperation::None)
            .apply(&mut target, &edit)
            .unwrap();
        assert!(target.children.is_empty());
    }

    #[test]
    fn invalid_result_leaves_target_untouched() {
        let schema = schema();
        let mut target = Node::new("config");
        let err = Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "10")))
            .unwrap_err();
        assert_eq!(err.path(), "/interfaces/interface[name='lo1']/mtu");
        assert!(target.children.is_empty());
    }

    #[test]
    fn continue_on_error_keeps_successful_elements() {
        let schema = schema();
        let mut target = Node::new("config");
        let edit = config(
            &schema,
            r#"<interfaces>
                 <interface><name>lo1</name><mtu operation="delete"/></interface>
                 <interface><name>lo2</name><mtu>1500</mtu></interface>
               </interfaces>"#,
        );
        let err = Edit::new(&schema)
            .error_option(ErrorOption::ContinueOnError)
            .apply(&mut target, &edit)
            .unwrap_err();
        assert!(matches!(err, EditError::DataMissing { .. }));
        assert_eq!(mtu_of(&target, "lo2").as_deref(), Some("1500"));
    }

    #[test]
    fn bad_operation_attribute() {
        let schema = schema();
        let mut target = Node::new("config");
        let edit = config(
            &schema,
            r#"<interfaces operation="upsert"/>"#,
        );
        let err = Edit::new(&schema).apply(&mut target, &edit).unwrap_err();
        assert_eq!(
            err,
            EditError::BadOperation {
                operation: "upsert".to_string(),
                path: "/interfaces".to_string()
            }
        );
    }

    #[test]
    fn default_replace_swaps_whole_tree() {
        let schema = schema();
        let mut target = Node::new("config");
        Edit::new(&schema)
            .apply(&mut target, &config(&schema, &lo("lo1", "1500")))
            .unwrap();
        Edit::new(&schema)
            .default_operation(DefaultOperation::Replace)
            .apply(&mut target, &config(&schema, &lo("lo2", "1400")))
            .unwrap();
        assert_eq!(mtu_of(&target, "lo1"), None);
        assert_eq!(mtu_of(&target, "lo2").as_deref(), Some("1400"));
    }

    #[test]
    fn leaf_lists_match_by_value() {
        let schema = schema();
        let mut target = Node::new("config");
        let members = |op: &str| {
            config(
                &schema,
                &format!(
                    "<interfaces><interface><name>lo1</name></interface>\
                     <interface><name>lo2</name></interface>\
                     <interface><name>lagg0</name><member {op}>lo1</member><member>lo2</member></interface>\
                     </interfaces>"
                ),
            )
        };
        Edit::new(&schema).apply(&mut target, &members("")).unwrap();
        Edit::new(&schema).apply(&mut target, &members("")).unwrap();
        let lagg = |t: &Node| {
            t.child("interfaces")
                .unwrap()
                .children_named("interface")
                .find(|i| i.child_text("name") == Some("lagg0"))
                .unwrap()
                .children_named("member")
                .count()
        };
        assert_eq!(lagg(&target), 2);

        Edit::new(&schema)
            .apply(&mut target, &members(r#"operation="delete""#))
            .unwrap();
        assert_eq!(lagg(&target), 1);
    }
}
