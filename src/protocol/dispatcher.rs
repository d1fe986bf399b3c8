use std::sync::Arc;

use log::{debug, warn};

use crate::storage::DatastoreManager;

use super::{
    Request, Response,
    codec::{ReplyContent, Rpc, RpcReply},
    error::{ErrorTag, ErrorType, RpcError},
    session::SessionRegistry,
};

/// What the session loop does after writing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Turns `<rpc>` envelopes into replies against the shared datastores.
pub struct Dispatcher {
    datastores: Arc<DatastoreManager>,
    sessions: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(datastores: Arc<DatastoreManager>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            datastores,
            sessions,
        }
    }

    pub fn datastores(&self) -> &Arc<DatastoreManager> {
        &self.datastores
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Answer one rpc from `session`. Every rpc gets exactly one reply.
    pub fn handle(&self, session: u32, rpc: Rpc) -> (RpcReply, Disposition) {
        let Some(message_id) = rpc.message_id else {
            let err = RpcError::new(ErrorTag::MissingAttribute)
                .with_type(ErrorType::Rpc)
                .with_message("rpc has no message-id")
                .with_info("bad-attribute", "message-id")
                .with_info("bad-element", "rpc");
            return (RpcReply::error(None, err), Disposition::Continue);
        };

        let request = match Request::from_operation(&rpc.operation) {
            Ok(request) => request,
            Err(err) => {
                debug!("session {session}: rejected '{}': {err}", rpc.operation.name);
                return (RpcReply::error(Some(message_id), err), Disposition::Continue);
            }
        };
        debug!("session {session}: {} (message-id {message_id})", request.name());

        let disposition = match request {
            Request::CloseSession => Disposition::Close,
            _ => Disposition::Continue,
        };
        let content = match self.dispatch(session, request) {
            Ok(response) => ReplyContent::from(response),
            Err(err) => {
                warn!("session {session}: message-id {message_id} failed: {err}");
                ReplyContent::Errors(vec![err])
            }
        };

        (
            RpcReply {
                message_id: Some(message_id),
                content,
            },
            disposition,
        )
    }

    pub fn dispatch(&self, session: u32, request: Request) -> Result<Response, RpcError> {
        let ds = &self.datastores;
        Ok(match request {
            Request::Get { filter } => Response::Data(ds.get(filter.as_ref())?),
            Request::GetConfig { source, filter } => {
                Response::Data(ds.get_config(source, filter.as_ref())?)
            }
            Request::EditConfig {
                target,
                default_operation,
                error_option,
                config,
            } => {
                ds.edit_config(session, target, &config, default_operation, error_option)?;
                Response::Ok
            }
            Request::CopyConfig { target, source } => {
                ds.copy_config(session, target, &source)?;
                Response::Ok
            }
            Request::DeleteConfig { target } => {
                ds.delete_config(session, target)?;
                Response::Ok
            }
            Request::Lock { target } => {
                ds.lock(session, target)?;
                Response::Ok
            }
            Request::Unlock { target } => {
                ds.unlock(session, target)?;
                Response::Ok
            }
            Request::Commit => {
                ds.commit(session)?;
                Response::Ok
            }
            Request::DiscardChanges => {
                ds.discard_changes(session)?;
                Response::Ok
            }
            Request::Validate { source } => {
                ds.validate(&source)?;
                Response::Ok
            }
            Request::CloseSession => Response::Ok,
            Request::KillSession { session_id } => {
                self.sessions.kill(session, session_id)?;
                ds.release_session(session_id);
                Response::Ok
            }
        })
    }
}
