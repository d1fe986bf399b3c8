use crate::{
    storage::{
        ConfigSource, DatastoreId,
        edit::{DefaultOperation, ErrorOption},
        filter::Filter,
    },
    tree::Node,
};

use super::{
    codec::BASE_NAMESPACE,
    error::{ErrorTag, RpcError},
};

/// A typed NETCONF operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        filter: Option<Filter>,
    },
    GetConfig {
        source: DatastoreId,
        filter: Option<Filter>,
    },
    EditConfig {
        target: DatastoreId,
        default_operation: DefaultOperation,
        error_option: ErrorOption,
        config: Node,
    },
    CopyConfig {
        target: DatastoreId,
        source: ConfigSource,
    },
    DeleteConfig {
        target: DatastoreId,
    },
    Lock {
        target: DatastoreId,
    },
    Unlock {
        target: DatastoreId,
    },
    Commit,
    DiscardChanges,
    Validate {
        source: ConfigSource,
    },
    CloseSession,
    KillSession {
        session_id: u32,
    },
}

fn missing(parameter: &str) -> RpcError {
    RpcError::new(ErrorTag::MissingElement)
        .with_message(format!("missing parameter '{parameter}'"))
        .with_info("bad-element", parameter)
}

fn bad(parameter: &str, message: impl Into<String>) -> RpcError {
    RpcError::new(ErrorTag::BadElement)
        .with_message(message)
        .with_info("bad-element", parameter)
}

fn datastore(op: &Node, parameter: &str) -> Result<DatastoreId, RpcError> {
    let node = op.child(parameter).ok_or_else(|| missing(parameter))?;
    DatastoreId::from_node(node).ok_or_else(|| {
        let given = node.children.first().map_or("nothing", |c| c.name.as_str());
        RpcError::new(ErrorTag::InvalidValue)
            .with_message(format!("'{given}' is not a datastore"))
            .with_info("bad-element", parameter)
    })
}

fn source(op: &Node, parameter: &str) -> Result<ConfigSource, RpcError> {
    let node = op.child(parameter).ok_or_else(|| missing(parameter))?;
    if node.child("url").is_some() {
        return Err(RpcError::new(ErrorTag::OperationNotSupported)
            .with_message("url sources are not supported"));
    }
    ConfigSource::from_node(node).ok_or_else(|| bad(parameter, "expected a datastore or <config>"))
}

fn filter(op: &Node) -> Result<Option<Filter>, RpcError> {
    op.child("filter")
        .map(Filter::from_node)
        .transpose()
        .map_err(RpcError::from)
}

fn parameter<T>(
    op: &Node,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, RpcError> {
    op.child_text(name)
        .map(|value| {
            parse(value.trim()).ok_or_else(|| {
                RpcError::new(ErrorTag::InvalidValue)
                    .with_message(format!("invalid {name} '{value}'"))
                    .with_info("bad-element", name)
            })
        })
        .transpose()
}

impl Request {
    /// Build a request from the operation element of an `<rpc>`.
    pub fn from_operation(op: &Node) -> Result<Self, RpcError> {
        if op.namespace.as_deref().is_some_and(|ns| ns != BASE_NAMESPACE) {
            return Err(RpcError::new(ErrorTag::OperationNotSupported)
                .with_message(format!("operation '{}' is not supported", op.name)));
        }

        Ok(match op.name.as_str() {
            "get" => Request::Get { filter: filter(op)? },
            "get-config" => Request::GetConfig {
                source: datastore(op, "source")?,
                filter: filter(op)?,
            },
            "edit-config" => {
                let target = datastore(op, "target")?;
                let default_operation =
                    parameter(op, "default-operation", DefaultOperation::parse)?.unwrap_or_default();
                let error_option =
                    parameter(op, "error-option", ErrorOption::parse)?.unwrap_or_default();
                if op.child("url").is_some() {
                    return Err(RpcError::new(ErrorTag::OperationNotSupported)
                        .with_message("url sources are not supported"));
                }
                let config = op.child("config").ok_or_else(|| missing("config"))?.clone();
                Request::EditConfig {
                    target,
                    default_operation,
                    error_option,
                    config,
                }
            }
            "copy-config" => Request::CopyConfig {
                target: datastore(op, "target")?,
                source: source(op, "source")?,
            },
            "delete-config" => Request::DeleteConfig {
                target: datastore(op, "target")?,
            },
            "lock" => Request::Lock {
                target: datastore(op, "target")?,
            },
            "unlock" => Request::Unlock {
                target: datastore(op, "target")?,
            },
            "commit" => Request::Commit,
            "discard-changes" => Request::DiscardChanges,
            "validate" => Request::Validate {
                source: source(op, "source")?,
            },
            "close-session" => Request::CloseSession,
            "kill-session" => Request::KillSession {
                session_id: parameter(op, "session-id", |s| {
                    s.parse::<u32>().ok().filter(|id| *id > 0)
                })?
                .ok_or_else(|| missing("session-id"))?,
            },
            other => {
                return Err(RpcError::new(ErrorTag::OperationNotSupported)
                    .with_message(format!("operation '{other}' is not supported")));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::GetConfig { .. } => "get-config",
            Request::EditConfig { .. } => "edit-config",
            Request::CopyConfig { .. } => "copy-config",
            Request::DeleteConfig { .. } => "delete-config",
            Request::Lock { .. } => "lock",
            Request::Unlock { .. } => "unlock",
            Request::Commit => "commit",
            Request::DiscardChanges => "discard-changes",
            Request::Validate { .. } => "validate",
            Request::CloseSession => "close-session",
            Request::KillSession { .. } => "kill-session",
        }
    }

    /// The operation element sent inside `<rpc>`.
    pub fn to_operation(&self) -> Node {
        let mut op = Node::new(self.name());
        match self {
            Request::Get { filter } => {
                if let Some(filter) = filter {
                    op.push(filter.to_node());
                }
            }
            Request::GetConfig { source, filter } => {
                op.push(source.to_node("source"));
                if let Some(filter) = filter {
                    op.push(filter.to_node());
                }
            }
            Request::EditConfig {
                target,
                default_operation,
                error_option,
                config,
            } => {
                op.push(target.to_node("target"));
                if *default_operation != DefaultOperation::default() {
                    op.push(Node::leaf("default-operation", default_operation.as_str()));
                }
                if *error_option != ErrorOption::default() {
                    op.push(Node::leaf("error-option", error_option.as_str()));
                }
                let mut config = config.clone();
                config.name = "config".to_string();
                op.push(config);
            }
            Request::CopyConfig { target, source } => {
                op.push(target.to_node("target"));
                op.push(source.to_node("source"));
            }
            Request::DeleteConfig { target }
            | Request::Lock { target }
            | Request::Unlock { target } => op.push(target.to_node("target")),
            Request::Validate { source } => op.push(source.to_node("source")),
            Request::KillSession { session_id } => {
                op.push(Node::leaf("session-id", session_id.to_string()))
            }
            Request::Commit | Request::DiscardChanges | Request::CloseSession => {}
        }
        op
    }
}
