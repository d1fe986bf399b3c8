use crate::tree::Node;

use super::{
    codec::ReplyContent,
    error::{ErrorTag, RpcError},
};

/// Successful outcome of a [`Request`](super::Request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Data(Node),
}

impl Response {
    pub fn data(&self) -> Option<&Node> {
        match self {
            Response::Ok => None,
            Response::Data(data) => Some(data),
        }
    }

    /// Read the content of an `<rpc-reply>`. Only the first of several
    /// errors is surfaced.
    pub fn from_reply(content: ReplyContent) -> Result<Self, RpcError> {
        match content {
            ReplyContent::Ok => Ok(Response::Ok),
            ReplyContent::Data(data) => Ok(Response::Data(data)),
            ReplyContent::Errors(errors) => Err(errors
                .into_iter()
                .next()
                .unwrap_or_else(|| RpcError::new(ErrorTag::OperationFailed))),
        }
    }
}

impl From<Response> for ReplyContent {
    fn from(value: Response) -> Self {
        match value {
            Response::Ok => ReplyContent::Ok,
            Response::Data(data) => ReplyContent::Data(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_content_conversion() {
        let data = Node::new("data").with_child(Node::new("interfaces"));
        assert_eq!(
            Response::from_reply(ReplyContent::Data(data.clone())),
            Ok(Response::Data(data))
        );

        let err = RpcError::new(ErrorTag::LockDenied);
        assert_eq!(
            Response::from_reply(ReplyContent::Errors(vec![err.clone()])),
            Err(err)
        );
        assert_eq!(ReplyContent::from(Response::Ok), ReplyContent::Ok);
    }
}
