use std::{
    net::Shutdown,
    os::unix::net::UnixStream,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    config::{ClientConfig, ConfigError},
    storage::{
        ConfigSource, DatastoreId,
        edit::{DefaultOperation, ErrorOption},
        filter::Filter,
    },
    tree::Node,
};

use super::{
    Request, Response,
    codec::{Message, Rpc},
    error::RpcError,
    expectation::{Callback, ExpectationRegistry},
    framing::{FrameReader, FrameWriter},
    session::{self, Session, SessionError},
    transport::{self, ProtocolTransport, TransportError},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("hello failed: {0}")]
    Handshake(#[from] SessionError),

    #[error("server error: {0}")]
    Rpc(RpcError),

    #[error("no reply to message {message_id} in time")]
    Timeout { message_id: String },

    #[error("session closed")]
    SessionClosed,

    #[error("message-id {0} is already awaiting a reply")]
    DuplicateMessageId(String),
}

/// A NETCONF client session.
///
/// Replies are read on a background thread and handed to whoever sent the
/// request, so [`Client::send`] never blocks on the server.
pub struct Client {
    session: Session,
    stream: UnixStream,
    writer: Mutex<FrameWriter<UnixStream>>,
    expectations: Arc<ExpectationRegistry>,
    next_message_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    sweeper: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl Client {
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let stream = transport::connect(&config.socket_path)?;
        stream
            .set_read_timeout(Some(config.hello_timeout))
            .map_err(TransportError::from)?;

        let mut transport =
            ProtocolTransport::from_stream(stream.try_clone().map_err(TransportError::from)?)?;
        let session = session::client_hello(&mut transport, &session::client_capabilities())?;
        stream.set_read_timeout(None).map_err(TransportError::from)?;
        debug!("connected as session {} ({:?})", session.id, session.framing);

        let (reader, writer) = transport.into_parts();
        let expectations = Arc::new(ExpectationRegistry::new(config.ttl));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let expectations = Arc::clone(&expectations);
            let closed = Arc::clone(&closed);
            let session_id = session.id.to_string();
            thread::spawn(move || read_replies(reader, &session_id, &expectations, &closed))
        };

        let sweeper = {
            let expectations = Arc::clone(&expectations);
            let (stop, stopped) = mpsc::channel::<()>();
            let interval = (config.ttl / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
            let handle = thread::spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    expectations.sweep();
                }
            });
            (stop, handle)
        };

        Ok(Self {
            session,
            stream,
            writer: Mutex::new(writer),
            expectations,
            next_message_id: AtomicU64::new(1),
            closed,
            reader: Some(reader),
            sweeper: Some(sweeper),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> u32 {
        self.session.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.expectations.len()
    }

    /// Send `request`; `callback` receives the reply, a timeout or the
    /// session loss. Returns the message-id used.
    pub fn send(&self, request: &Request, callback: Callback) -> Result<String, ClientError> {
        if self.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst).to_string();
        let session_id = self.session.id.to_string();
        self.expectations.insert(&session_id, &message_id, callback)?;

        let message = Message::Rpc(Rpc::new(message_id.clone(), request.to_operation()));
        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            transport::write_message(&mut writer, &message)
        };
        if let Err(e) = written {
            self.expectations
                .resolve(&session_id, &message_id, Err(ClientError::SessionClosed));
            return Err(e.into());
        }
        debug!("sent {} as message {message_id}", request.name());
        Ok(message_id)
    }

    /// Send `request` and wait for its outcome.
    pub fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let (tx, rx) = mpsc::channel();
        self.send(
            request,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        rx.recv().unwrap_or(Err(ClientError::SessionClosed))
    }

    fn call_ok(&self, request: Request) -> Result<(), ClientError> {
        self.call(&request).map(|_| ())
    }

    fn call_data(&self, request: Request) -> Result<Node, ClientError> {
        match self.call(&request)? {
            Response::Data(data) => Ok(data),
            Response::Ok => Ok(Node::new("data")),
        }
    }

    pub fn get(&self, filter: Option<Filter>) -> Result<Node, ClientError> {
        self.call_data(Request::Get { filter })
    }

    pub fn get_config(&self, source: DatastoreId, filter: Option<Filter>) -> Result<Node, ClientError> {
        self.call_data(Request::GetConfig { source, filter })
    }

    pub fn edit_config(&self, target: DatastoreId, config: Node) -> Result<(), ClientError> {
        self.edit_config_with(target, config, DefaultOperation::default(), ErrorOption::default())
    }

    pub fn edit_config_with(
        &self,
        target: DatastoreId,
        config: Node,
        default_operation: DefaultOperation,
        error_option: ErrorOption,
    ) -> Result<(), ClientError> {
        self.call_ok(Request::EditConfig {
            target,
            default_operation,
            error_option,
            config,
        })
    }

    pub fn copy_config(&self, target: DatastoreId, source: ConfigSource) -> Result<(), ClientError> {
        self.call_ok(Request::CopyConfig { target, source })
    }

    pub fn delete_config(&self, target: DatastoreId) -> Result<(), ClientError> {
        self.call_ok(Request::DeleteConfig { target })
    }

    pub fn lock(&self, target: DatastoreId) -> Result<(), ClientError> {
        self.call_ok(Request::Lock { target })
    }

    pub fn unlock(&self, target: DatastoreId) -> Result<(), ClientError> {
        self.call_ok(Request::Unlock { target })
    }

    pub fn commit(&self) -> Result<(), ClientError> {
        self.call_ok(Request::Commit)
    }

    pub fn discard_changes(&self) -> Result<(), ClientError> {
        self.call_ok(Request::DiscardChanges)
    }

    pub fn validate(&self, source: ConfigSource) -> Result<(), ClientError> {
        self.call_ok(Request::Validate { source })
    }

    pub fn kill_session(&self, session_id: u32) -> Result<(), ClientError> {
        self.call_ok(Request::KillSession { session_id })
    }

    /// End the session gracefully.
    pub fn close(self) -> Result<(), ClientError> {
        self.call_ok(Request::CloseSession)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some((stop, sweeper)) = self.sweeper.take() {
            drop(stop);
            let _ = sweeper.join();
        }
    }
}

fn read_replies(
    mut reader: FrameReader<UnixStream>,
    session_id: &str,
    expectations: &ExpectationRegistry,
    closed: &AtomicBool,
) {
    loop {
        match transport::read_message(&mut reader) {
            Ok(Some(Message::RpcReply(reply))) => {
                let Some(message_id) = reply.message_id else {
                    warn!("reply without message-id: {:?}", reply.content);
                    continue;
                };
                let outcome = Response::from_reply(reply.content).map_err(ClientError::Rpc);
                expectations.resolve(session_id, &message_id, outcome);
            }
            Ok(Some(other)) => warn!("ignoring unexpected {:?}", other.kind()),
            Ok(None) => break,
            Err(e) => {
                debug!("session {session_id} read failed: {e}");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let failed = expectations.fail_session(session_id);
    debug!("session {session_id} closed with {failed} requests outstanding");
}
