use std::{
    fs,
    io::ErrorKind,
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    adapter::{DiscoveryBeacon, ServiceDescriptor},
    config::{ConfigError, ServerConfig},
    storage::DatastoreManager,
};

use super::{
    ThreadPool,
    codec::{Message, RpcReply},
    dispatcher::{Disposition, Dispatcher},
    error::RpcError,
    session::{self, SessionError, SessionRegistry},
    thread::PoolError,
    transport::{self, ProtocolTransport, TransportError},
};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Everything a session thread needs.
struct Shared {
    config: ServerConfig,
    dispatcher: Dispatcher,
    capabilities: Vec<String>,
}

/// NETCONF server bound to a local socket.
pub struct NetconfServer {
    shared: Arc<Shared>,
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
    beacon: Option<Box<dyn DiscoveryBeacon>>,
}

impl NetconfServer {
    pub fn new(config: ServerConfig, datastores: Arc<DatastoreManager>) -> Result<Self, ConfigError> {
        config.validate()?;
        let capabilities =
            session::server_capabilities(datastores.writable_running(), datastores.schema().as_ref());
        let dispatcher = Dispatcher::new(datastores, Arc::new(SessionRegistry::new()));
        Ok(Self {
            pool: ThreadPool::new(config.max_sessions),
            shared: Arc::new(Shared {
                config,
                dispatcher,
                capabilities,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            beacon: None,
        })
    }

    pub fn with_beacon(mut self, beacon: Box<dyn DiscoveryBeacon>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    /// Raising this flag stops the accept loop and ends every session.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.shared.dispatcher.sessions()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.shared.capabilities
    }

    /// Bind the configured socket and serve until shut down.
    pub fn listen(self) -> Result<(), TransportError> {
        let listener = transport::bind(&self.shared.config.socket_path)?;
        self.serve(listener)
    }

    pub fn serve(mut self, listener: UnixListener) -> Result<(), TransportError> {
        listener.set_nonblocking(true)?;
        if let Some(beacon) = self.beacon.as_mut() {
            beacon.announce(&ServiceDescriptor {
                name: "netconf".to_string(),
                address: self.shared.config.socket_path.display().to_string(),
                port: 0,
            });
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => self.accept(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => warn!("broken connection: {e}"),
            }
        }

        info!("shutting down");
        if let Some(beacon) = self.beacon.as_mut() {
            beacon.withdraw();
        }
        self.sessions().shutdown_all();
        drop(listener);
        if let Err(e) = fs::remove_file(&self.shared.config.socket_path) {
            debug!("could not remove socket: {e}");
        }
        Ok(())
    }

    fn accept(&self, stream: UnixStream) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("dropping connection: {e}");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let result = self.pool.execute(move || {
            if let Err(e) = run_session(stream, &shared) {
                warn!("session ended with error: {e}");
            }
        });
        match result {
            Ok(()) => {}
            Err(PoolError::Full(max)) => warn!("refusing connection: {max} sessions active"),
            Err(e) => error!("cannot start session: {e}"),
        }
    }
}

fn run_session(stream: UnixStream, shared: &Shared) -> Result<(), SessionError> {
    let sessions = shared.dispatcher.sessions();
    let control = stream.try_clone().map_err(TransportError::from)?;
    let (id, killed) = sessions.register(Some(control));

    let result = session_loop(stream, id, &killed, shared);

    sessions.unregister(id);
    let released = shared.dispatcher.datastores().release_session(id);
    if !released.is_empty() {
        debug!("session {id} ended holding {released:?}");
    }
    result
}

fn session_loop(
    stream: UnixStream,
    id: u32,
    killed: &AtomicBool,
    shared: &Shared,
) -> Result<(), SessionError> {
    stream
        .set_read_timeout(Some(shared.config.hello_timeout))
        .map_err(TransportError::from)?;
    let mut transport = ProtocolTransport::from_stream(stream)?;
    transport.set_chunk_size(shared.config.chunk_size);
    transport.set_limit(Some(shared.config.max_message_size));

    let session = session::server_hello(&mut transport, id, &shared.capabilities)?;
    transport
        .reader()
        .set_read_timeout(None)
        .map_err(TransportError::from)?;
    info!("session {id}: hello complete, {:?} framing", session.framing);

    loop {
        let message = match transport.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("session {id}: peer closed");
                return Ok(());
            }
            Err(TransportError::Codec {
                source,
                message_id: Some(message_id),
            }) => {
                warn!("session {id}: bad message {message_id}: {source}");
                let reply = RpcReply::error(Some(message_id), RpcError::from(&source));
                transport.write_message(&Message::RpcReply(reply))?;
                continue;
            }
            Err(TransportError::Codec { source, .. }) => {
                warn!("session {id}: closing after unparseable message: {source}");
                return Ok(());
            }
            Err(_) if killed.load(Ordering::SeqCst) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if killed.load(Ordering::SeqCst) {
            debug!("session {id}: killed, abandoning message");
            return Ok(());
        }

        let rpc = match message {
            Message::Rpc(rpc) => rpc,
            other => {
                warn!("session {id}: unexpected {:?}, closing", other.kind());
                return Ok(());
            }
        };

        let (reply, disposition) = shared.dispatcher.handle(id, rpc);
        transport.write_message(&Message::RpcReply(reply))?;
        if disposition == Disposition::Close {
            return Ok(());
        }
    }
}
