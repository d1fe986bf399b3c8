//! Per-connection session state and the hello handshake.
//!
//! A session begins with each side sending a `<hello>`; the server's carries
//! the session-id. When both sides advertise base:1.1 every later message
//! uses chunked framing. [`SessionRegistry`] hands out ids and keeps the
//! handles `kill-session` needs to end another session.
use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read, Write},
    net::Shutdown,
    os::unix::net::UnixStream,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::adapter::SchemaLibrary;

use super::{
    codec::{Hello, Message, MessageKind},
    error::{ErrorTag, RpcError},
    framing::{FramingError, FramingMode},
    transport::{ProtocolTransport, TransportError},
};

pub const BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";
pub const BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";
pub const CANDIDATE: &str = "urn:ietf:params:netconf:capability:candidate:1.0";
pub const WRITABLE_RUNNING: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
pub const VALIDATE: &str = "urn:ietf:params:netconf:capability:validate:1.1";
pub const STARTUP: &str = "urn:ietf:params:netconf:capability:startup:1.0";
pub const XPATH: &str = "urn:ietf:params:netconf:capability:xpath:1.0";
pub const ROLLBACK_ON_ERROR: &str = "urn:ietf:params:netconf:capability:rollback-on-error:1.0";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no hello received in time")]
    HelloTimeout,

    #[error("peer closed the connection before hello")]
    Closed,

    #[error("expected hello, got {0:?}")]
    UnexpectedMessage(MessageKind),

    #[error("client hello must not carry a session-id")]
    UnexpectedSessionId,

    #[error("server hello carries no session-id")]
    MissingSessionId,

    #[error("no common base protocol version")]
    NoCommonBase,
}

/// Capabilities the server advertises.
pub fn server_capabilities(writable_running: bool, schema: &dyn SchemaLibrary) -> Vec<String> {
    let mut caps: Vec<String> = [BASE_1_0, BASE_1_1, CANDIDATE]
        .into_iter()
        .map(str::to_string)
        .collect();
    if writable_running {
        caps.push(WRITABLE_RUNNING.to_string());
    }
    caps.extend(
        [VALIDATE, STARTUP, XPATH, ROLLBACK_ON_ERROR]
            .into_iter()
            .map(str::to_string),
    );
    caps.extend(schema.capabilities());
    caps
}

pub fn client_capabilities() -> Vec<String> {
    vec![BASE_1_0.to_string(), BASE_1_1.to_string()]
}

/// Framing both peers can use: chunked only if each advertised base:1.1.
pub fn negotiate_framing(local: &[String], remote: &[String]) -> Result<FramingMode, SessionError> {
    let both = |cap: &str| local.iter().any(|c| c == cap) && remote.iter().any(|c| c == cap);
    if both(BASE_1_1) {
        Ok(FramingMode::Chunked)
    } else if both(BASE_1_0) {
        Ok(FramingMode::EndOfMessage)
    } else {
        Err(SessionError::NoCommonBase)
    }
}

/// An established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub framing: FramingMode,
    /// Capabilities advertised by both sides.
    pub capabilities: Vec<String>,
}

impl Session {
    fn new(id: u32, framing: FramingMode, local: &[String], remote: &[String]) -> Self {
        let capabilities = local
            .iter()
            .filter(|c| remote.contains(c))
            .cloned()
            .collect();
        Self {
            id,
            framing,
            capabilities,
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

fn is_timeout(err: &TransportError) -> bool {
    let io = match err {
        TransportError::Io(e) | TransportError::Framing(FramingError::Io(e)) => e,
        _ => return false,
    };
    matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn read_hello<R: Read, W: Write>(
    transport: &mut ProtocolTransport<R, W>,
) -> Result<Hello, SessionError> {
    match transport.read_message() {
        Ok(Some(Message::Hello(hello))) => Ok(hello),
        Ok(Some(other)) => Err(SessionError::UnexpectedMessage(other.kind())),
        Ok(None) => Err(SessionError::Closed),
        Err(e) if is_timeout(&e) => Err(SessionError::HelloTimeout),
        Err(e) => Err(e.into()),
    }
}

/// Server side of the handshake. Any read timeout must already be set on
/// the underlying stream.
pub fn server_hello<R: Read, W: Write>(
    transport: &mut ProtocolTransport<R, W>,
    id: u32,
    capabilities: &[String],
) -> Result<Session, SessionError> {
    transport.write_message(&Message::Hello(Hello {
        capabilities: capabilities.to_vec(),
        session_id: Some(id),
    }))?;

    let hello = read_hello(transport)?;
    if hello.session_id.is_some() {
        return Err(SessionError::UnexpectedSessionId);
    }
    let framing = negotiate_framing(capabilities, &hello.capabilities)?;
    transport.set_mode(framing);
    debug!("session {id}: client capabilities {:?}", hello.capabilities);
    Ok(Session::new(id, framing, capabilities, &hello.capabilities))
}

/// Client side of the handshake.
pub fn client_hello<R: Read, W: Write>(
    transport: &mut ProtocolTransport<R, W>,
    capabilities: &[String],
) -> Result<Session, SessionError> {
    transport.write_message(&Message::Hello(Hello {
        capabilities: capabilities.to_vec(),
        session_id: None,
    }))?;

    let hello = read_hello(transport)?;
    let id = hello.session_id.ok_or(SessionError::MissingSessionId)?;
    let framing = negotiate_framing(capabilities, &hello.capabilities)?;
    transport.set_mode(framing);
    Ok(Session::new(id, framing, capabilities, &hello.capabilities))
}

#[derive(Debug)]
struct Entry {
    killed: Arc<AtomicBool>,
    stream: Option<UnixStream>,
}

/// Live sessions of one server process.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU32,
    sessions: Mutex<BTreeMap<u32, Entry>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<u32, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next session-id. `stream` is shut down if the session
    /// is killed. The returned flag is raised at the same time.
    pub fn register(&self, stream: Option<UnixStream>) -> (u32, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let killed = Arc::new(AtomicBool::new(false));
        self.sessions().insert(
            id,
            Entry {
                killed: Arc::clone(&killed),
                stream,
            },
        );
        info!("session {id} opened");
        (id, killed)
    }

    pub fn unregister(&self, id: u32) {
        if self.sessions().remove(&id).is_some() {
            info!("session {id} closed");
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.sessions().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End session `target` on behalf of `caller`.
    pub fn kill(&self, caller: u32, target: u32) -> Result<(), RpcError> {
        if caller == target {
            return Err(RpcError::new(ErrorTag::InvalidValue)
                .with_message("a session cannot kill itself")
                .with_info("bad-element", "session-id"));
        }
        let sessions = self.sessions();
        let entry = sessions.get(&target).ok_or_else(|| {
            RpcError::new(ErrorTag::InvalidValue)
                .with_message(format!("no session {target}"))
                .with_info("bad-element", "session-id")
        })?;

        entry.killed.store(true, Ordering::SeqCst);
        if let Some(stream) = &entry.stream {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                warn!("session {target}: shutdown failed: {e}");
            }
        }
        info!("session {caller} killed session {target}");
        Ok(())
    }

    /// End every live session, for server shutdown.
    pub fn shutdown_all(&self) {
        for (id, entry) in self.sessions().iter() {
            entry.killed.store(true, Ordering::SeqCst);
            if let Some(stream) = &entry.stream {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!("session {id}: shutdown failed: {e}");
                }
            }
        }
    }
}
