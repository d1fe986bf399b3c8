//! `<hello>`, `<rpc>` and `<rpc-reply>` envelopes.
//!
//! The codec is the only place that knows what a NETCONF envelope looks like;
//! everything past it deals in [`Message`] values and [`Node`] payloads.
use thiserror::Error;

use crate::tree::{Node, TreeError};

use super::error::{ErrorTag, RpcError};

pub const BASE_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] TreeError),

    #[error("message is not valid utf-8")]
    Encoding,

    #[error("unknown top-level element '{0}'")]
    UnknownElement(String),

    #[error("unknown namespace '{0}' on envelope")]
    UnknownNamespace(String),

    #[error("rpc carries no operation")]
    MissingOperation { message_id: Option<String> },

    #[error("invalid hello: {0}")]
    InvalidHello(String),
}

impl From<&CodecError> for RpcError {
    fn from(value: &CodecError) -> Self {
        let tag = match value {
            CodecError::Malformed(_) | CodecError::Encoding | CodecError::InvalidHello(_) => {
                ErrorTag::MalformedMessage
            }
            CodecError::UnknownElement(_) => ErrorTag::UnknownElement,
            CodecError::UnknownNamespace(_) => ErrorTag::UnknownNamespace,
            CodecError::MissingOperation { .. } => ErrorTag::MissingElement,
        };
        RpcError::new(tag).with_message(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Rpc,
    RpcReply,
    RpcError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub capabilities: Vec<String>,
    pub session_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub message_id: Option<String>,
    pub operation: Node,
}

impl Rpc {
    pub fn new(message_id: impl Into<String>, operation: Node) -> Self {
        Self {
            message_id: Some(message_id.into()),
            operation,
        }
    }

    /// Local name of the operation element.
    pub fn operation_name(&self) -> &str {
        &self.operation.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyContent {
    Ok,
    Data(Node),
    Errors(Vec<RpcError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub message_id: Option<String>,
    pub content: ReplyContent,
}

impl RpcReply {
    pub fn ok(message_id: Option<String>) -> Self {
        Self {
            message_id,
            content: ReplyContent::Ok,
        }
    }

    pub fn error(message_id: Option<String>, error: RpcError) -> Self {
        Self {
            message_id,
            content: ReplyContent::Errors(vec![error]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Rpc(Rpc),
    RpcReply(RpcReply),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Rpc(_) => MessageKind::Rpc,
            Message::RpcReply(RpcReply {
                content: ReplyContent::Errors(_),
                ..
            }) => MessageKind::RpcError,
            Message::RpcReply(_) => MessageKind::RpcReply,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Message::Hello(_) => None,
            Message::Rpc(rpc) => rpc.message_id.as_deref(),
            Message::RpcReply(reply) => reply.message_id.as_deref(),
        }
    }
}

/// Parse one de-framed message.
pub fn parse_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Encoding)?;
    let root = Node::parse(text)?;

    if let Some(ns) = root.namespace.as_deref() {
        if ns != BASE_NAMESPACE {
            return Err(CodecError::UnknownNamespace(ns.to_string()));
        }
    }

    match root.name.as_str() {
        "hello" => parse_hello(&root).map(Message::Hello),
        "rpc" => {
            let message_id = root.attribute("message-id").map(str::to_string);
            let operation = root
                .children
                .into_iter()
                .next()
                .ok_or(CodecError::MissingOperation {
                    message_id: message_id.clone(),
                })?;
            Ok(Message::Rpc(Rpc {
                message_id,
                operation,
            }))
        }
        "rpc-reply" => Ok(Message::RpcReply(parse_reply(root))),
        other => Err(CodecError::UnknownElement(other.to_string())),
    }
}

fn parse_hello(root: &Node) -> Result<Hello, CodecError> {
    let capabilities: Vec<String> = root
        .child("capabilities")
        .ok_or_else(|| CodecError::InvalidHello("missing <capabilities>".to_string()))?
        .children_named("capability")
        .filter_map(|c| c.text.as_deref())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    let session_id = root
        .child_text("session-id")
        .map(|id| {
            id.trim()
                .parse::<u32>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| CodecError::InvalidHello(format!("bad session-id '{id}'")))
        })
        .transpose()?;

    Ok(Hello {
        capabilities,
        session_id,
    })
}

fn parse_reply(root: Node) -> RpcReply {
    let message_id = root.attribute("message-id").map(str::to_string);
    let errors: Vec<RpcError> = root
        .children_named("rpc-error")
        .map(RpcError::from_node)
        .collect();

    let content = if !errors.is_empty() {
        ReplyContent::Errors(errors)
    } else if let Some(data) = root.children.into_iter().find(|c| c.name == "data") {
        ReplyContent::Data(data)
    } else {
        ReplyContent::Ok
    };

    RpcReply {
        message_id,
        content,
    }
}

/// Render a message for framing.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let envelope = match message {
        Message::Hello(hello) => {
            let mut caps = Node::new("capabilities");
            for cap in &hello.capabilities {
                caps.push(Node::leaf("capability", cap.clone()));
            }
            let mut node = Node::new("hello").with_child(caps);
            if let Some(id) = hello.session_id {
                node.push(Node::leaf("session-id", id.to_string()));
            }
            node
        }
        Message::Rpc(rpc) => {
            let mut node = Node::new("rpc");
            if let Some(id) = &rpc.message_id {
                node.set_attribute("message-id", id.clone());
            }
            node.with_child(rpc.operation.clone())
        }
        Message::RpcReply(reply) => {
            let mut node = Node::new("rpc-reply");
            if let Some(id) = &reply.message_id {
                node.set_attribute("message-id", id.clone());
            }
            match &reply.content {
                ReplyContent::Ok => node.push(Node::new("ok")),
                ReplyContent::Data(data) => node.push(data.clone()),
                ReplyContent::Errors(errors) => {
                    for err in errors {
                        node.push(err.to_node());
                    }
                }
            }
            node
        }
    };

    let envelope = envelope.with_namespace(BASE_NAMESPACE);
    let mut out = String::from(XML_DECLARATION);
    out.push_str(&envelope.to_xml());
    out.into_bytes()
}

/// Best-effort scan for a `message-id` attribute in bytes that failed to
/// parse as XML.
pub fn recover_message_id(bytes: &[u8]) -> Option<String> {
    const KEY: &[u8] = b"message-id=";
    let pos = bytes.windows(KEY.len()).position(|w| w == KEY)?;
    let rest = &bytes[pos + KEY.len()..];
    let (&quote, rest) = rest.split_first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let end = rest.iter().position(|b| *b == quote)?;
    let id = std::str::from_utf8(&rest[..end]).ok()?;
    (!id.is_empty()).then(|| id.to_string())
}
