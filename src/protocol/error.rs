//! Wire-level error taxonomy.
//!
//! Handlers fail with their own typed errors; the dispatcher converts them
//! into an [`RpcError`] which the codec renders as a single `<rpc-error>`.
use std::fmt;

use thiserror::Error;

use crate::{
    adapter::{
        KernelError,
        schema::{SchemaError, SchemaErrorKind},
    },
    storage::{DatastoreError, edit::EditError, filter::FilterError},
    tree::Node,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    MalformedMessage,
    UnknownElement,
    MissingElement,
    BadElement,
    MissingAttribute,
    OperationNotSupported,
    UnknownNamespace,
    AccessDenied,
    InvalidValue,
    DataExists,
    DataMissing,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    OperationFailed,
    PartialOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "transport" => ErrorType::Transport,
            "rpc" => ErrorType::Rpc,
            "protocol" => ErrorType::Protocol,
            "application" => ErrorType::Application,
            _ => return None,
        })
    }
}

impl ErrorTag {
    const ALL: [ErrorTag; 16] = [
        ErrorTag::MalformedMessage,
        ErrorTag::UnknownElement,
        ErrorTag::MissingElement,
        ErrorTag::BadElement,
        ErrorTag::MissingAttribute,
        ErrorTag::OperationNotSupported,
        ErrorTag::UnknownNamespace,
        ErrorTag::AccessDenied,
        ErrorTag::InvalidValue,
        ErrorTag::DataExists,
        ErrorTag::DataMissing,
        ErrorTag::LockDenied,
        ErrorTag::ResourceDenied,
        ErrorTag::RollbackFailed,
        ErrorTag::OperationFailed,
        ErrorTag::PartialOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::MalformedMessage => "malformed-message",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::PartialOperation => "partial-operation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == s)
    }

    /// Error type a tag is reported under when the raising layer does not
    /// say otherwise.
    pub fn default_type(&self) -> ErrorType {
        match self {
            ErrorTag::MalformedMessage => ErrorType::Transport,
            ErrorTag::UnknownElement
            | ErrorTag::MissingElement
            | ErrorTag::BadElement
            | ErrorTag::MissingAttribute => ErrorType::Rpc,
            ErrorTag::OperationNotSupported
            | ErrorTag::UnknownNamespace
            | ErrorTag::AccessDenied => ErrorType::Protocol,
            _ => ErrorType::Application,
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured `<rpc-error>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tag}: {}", .message.as_deref().unwrap_or("no message"))]
pub struct RpcError {
    pub error_type: ErrorType,
    pub tag: ErrorTag,
    pub severity: ErrorSeverity,
    pub message: Option<String>,
    pub path: Option<String>,
    pub info: Vec<(String, String)>,
}

impl RpcError {
    pub fn new(tag: ErrorTag) -> Self {
        Self {
            error_type: tag.default_type(),
            tag,
            severity: ErrorSeverity::Error,
            message: None,
            path: None,
            info: Vec::new(),
        }
    }

    pub fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_info(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push((name.into(), value.into()));
        self
    }

    pub fn info(&self, name: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::new("rpc-error")
            .with_child(Node::leaf("error-type", self.error_type.as_str()))
            .with_child(Node::leaf("error-tag", self.tag.as_str()))
            .with_child(Node::leaf(
                "error-severity",
                match self.severity {
                    ErrorSeverity::Error => "error",
                    ErrorSeverity::Warning => "warning",
                },
            ));
        if let Some(path) = &self.path {
            node.push(Node::leaf("error-path", path.clone()));
        }
        if let Some(message) = &self.message {
            node.push(Node::leaf("error-message", message.clone()));
        }
        if !self.info.is_empty() {
            let mut info = Node::new("error-info");
            for (k, v) in &self.info {
                info.push(Node::leaf(k.clone(), v.clone()));
            }
            node.push(info);
        }
        node
    }

    /// Read an `<rpc-error>` element back. Unknown tags degrade to
    /// `operation-failed` rather than failing the whole reply.
    pub fn from_node(node: &Node) -> Self {
        let tag = node
            .child_text("error-tag")
            .and_then(ErrorTag::parse)
            .unwrap_or(ErrorTag::OperationFailed);
        let error_type = node
            .child_text("error-type")
            .and_then(ErrorType::parse)
            .unwrap_or(tag.default_type());
        let severity = match node.child_text("error-severity") {
            Some("warning") => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        };

        Self {
            error_type,
            tag,
            severity,
            message: node.child_text("error-message").map(str::to_string),
            path: node.child_text("error-path").map(str::to_string),
            info: node
                .child("error-info")
                .map(|info| {
                    info.children
                        .iter()
                        .map(|c| (c.name.clone(), c.text.clone().unwrap_or_default()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl From<FilterError> for RpcError {
    fn from(value: FilterError) -> Self {
        let tag = match value {
            FilterError::MissingSelect => ErrorTag::MissingAttribute,
            FilterError::UnknownType(_) | FilterError::XPath { .. } => ErrorTag::InvalidValue,
        };
        RpcError::new(tag)
            .with_type(ErrorType::Protocol)
            .with_message(value.to_string())
    }
}

impl From<SchemaError> for RpcError {
    fn from(value: SchemaError) -> Self {
        let tag = match value.kind {
            SchemaErrorKind::Malformed => ErrorTag::MalformedMessage,
            SchemaErrorKind::UnknownModule => ErrorTag::OperationFailed,
            SchemaErrorKind::UnknownElement => ErrorTag::UnknownElement,
            SchemaErrorKind::UnknownNamespace => ErrorTag::UnknownNamespace,
            SchemaErrorKind::MissingElement => ErrorTag::MissingElement,
            SchemaErrorKind::BadElement => ErrorTag::BadElement,
            SchemaErrorKind::InvalidValue => ErrorTag::InvalidValue,
        };
        RpcError::new(tag)
            .with_type(ErrorType::Application)
            .with_message(value.message)
            .with_path(value.path)
    }
}

impl From<EditError> for RpcError {
    fn from(value: EditError) -> Self {
        let tag = match value {
            EditError::Schema(e) => return e.into(),
            EditError::DataExists { .. } => ErrorTag::DataExists,
            EditError::DataMissing { .. } => ErrorTag::DataMissing,
            EditError::MissingKey { .. } => ErrorTag::MissingElement,
            EditError::BadOperation { .. } => ErrorTag::InvalidValue,
        };
        let path = value.path().to_string();
        RpcError::new(tag)
            .with_type(ErrorType::Application)
            .with_message(value.to_string())
            .with_path(path)
    }
}

impl From<KernelError> for RpcError {
    fn from(value: KernelError) -> Self {
        RpcError::new(ErrorTag::OperationFailed).with_message(value.to_string())
    }
}

impl From<DatastoreError> for RpcError {
    fn from(value: DatastoreError) -> Self {
        let message = value.to_string();
        match value {
            DatastoreError::LockDenied { holder, .. } => RpcError::new(ErrorTag::LockDenied)
                .with_message(message)
                .with_info("session-id", holder.to_string()),
            DatastoreError::CandidateDirty => RpcError::new(ErrorTag::LockDenied)
                .with_message(message)
                .with_info("session-id", "0"),
            DatastoreError::NotLockHolder(_) => {
                RpcError::new(ErrorTag::LockDenied).with_message(message)
            }
            DatastoreError::NotSupported(_) => {
                RpcError::new(ErrorTag::OperationNotSupported).with_message(message)
            }
            DatastoreError::UnknownDatastore(_) | DatastoreError::InvalidValue(_) => {
                RpcError::new(ErrorTag::InvalidValue).with_message(message)
            }
            DatastoreError::Edit(e) => e.into(),
            DatastoreError::Filter(e) => e.into(),
            DatastoreError::Validation(e) => e.into(),
            DatastoreError::CommitValidation(e) | DatastoreError::Startup(e) => {
                RpcError::new(ErrorTag::OperationFailed)
                    .with_message(message)
                    .with_path(e.path)
            }
            DatastoreError::RollbackFailed { .. } | DatastoreError::Inconsistent => {
                RpcError::new(ErrorTag::RollbackFailed).with_message(message)
            }
            DatastoreError::Kernel(_) | DatastoreError::Io(_) => {
                RpcError::new(ErrorTag::OperationFailed).with_message(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_map_to_their_default_types() {
        assert_eq!(ErrorTag::MalformedMessage.default_type(), ErrorType::Transport);
        assert_eq!(ErrorTag::BadElement.default_type(), ErrorType::Rpc);
        assert_eq!(
            ErrorTag::OperationNotSupported.default_type(),
            ErrorType::Protocol
        );
        assert_eq!(ErrorTag::LockDenied.default_type(), ErrorType::Application);
    }

    #[test]
    fn tag_names_parse_back() {
        for tag in ErrorTag::ALL {
            assert_eq!(ErrorTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(ErrorTag::parse("no-such-tag"), None);
    }

    #[test]
    fn error_node_carries_info() {
        let err = RpcError::new(ErrorTag::LockDenied)
            .with_message("lock held")
            .with_info("session-id", "3");
        let node = err.to_node();

        assert_eq!(node.child_text("error-tag"), Some("lock-denied"));
        assert_eq!(node.child_text("error-type"), Some("application"));
        assert_eq!(
            node.child("error-info").unwrap().child_text("session-id"),
            Some("3")
        );
        assert_eq!(RpcError::from_node(&node), err);
    }

    #[test]
    fn lock_denied_names_the_holder() {
        let err = RpcError::from(DatastoreError::LockDenied {
            datastore: crate::storage::DatastoreId::Running,
            holder: 4,
        });
        assert_eq!(err.tag, ErrorTag::LockDenied);
        assert_eq!(err.info("session-id"), Some("4"));
    }

    #[test]
    fn schema_errors_keep_their_path() {
        let err = RpcError::from(EditError::DataMissing {
            path: "/interfaces/interface[name='lo1']".to_string(),
        });
        assert_eq!(err.tag, ErrorTag::DataMissing);
        assert_eq!(err.path.as_deref(), Some("/interfaces/interface[name='lo1']"));

        let err = RpcError::from(DatastoreError::NotSupported("no".to_string()));
        assert_eq!(err.tag, ErrorTag::OperationNotSupported);
        assert_eq!(err.error_type, ErrorType::Protocol);
    }
}
