use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use netconfd::{
    ClientConfig, DatastoreId, DatastoreManager, NetconfServer, ServerConfig,
    adapter::{
        KernelObject, MemoryKernel, ObjectKind, SchemaContext,
        memory::KernelCall,
    },
    protocol::{
        Client, ClientError, Request, RpcError, error::ErrorTag, transport,
    },
    storage::{ConfigSource, filter::Filter},
    tree::Node,
};
use tempdir::TempDir;

const INTERFACES: &str = "urn:ietf:params:xml:ns:yang:ietf-interfaces";

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    stop: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    fn start(kernel: &MemoryKernel) -> Self {
        let dir = TempDir::new("netconfd").unwrap();
        let socket = dir.path().join("netconf.sock");
        let schema = Arc::new(SchemaContext::with_default_modules(Vec::new()).unwrap());
        let datastores = DatastoreManager::new(schema, Box::new(kernel.clone()))
            .with_startup_path(dir.path().join("startup.xml"));
        let config = ServerConfig {
            socket_path: socket.clone(),
            startup_path: Some(dir.path().join("startup.xml")),
            max_sessions: 4,
            ..Default::default()
        };

        let listener = transport::bind(&socket).unwrap();
        let server = NetconfServer::new(config, Arc::new(datastores)).unwrap();
        let stop = server.shutdown_handle();
        let server = thread::spawn(move || server.serve(listener).unwrap());

        Self {
            _dir: dir,
            socket,
            stop,
            server: Some(server),
        }
    }

    fn client(&self) -> Client {
        Client::connect(&client_config(&self.socket)).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

fn client_config(socket: &Path) -> ClientConfig {
    ClientConfig {
        socket_path: socket.to_path_buf(),
        ..Default::default()
    }
}

fn interfaces(body: &str) -> Node {
    Node::parse(&format!(
        r#"<config><interfaces xmlns="{INTERFACES}">{body}</interfaces></config>"#
    ))
    .unwrap()
}

fn has_interface(data: &Node, name: &str) -> bool {
    data.child("interfaces").is_some_and(|i| {
        i.children_named("interface")
            .any(|e| e.child_text("name") == Some(name))
    })
}

fn rpc_error(result: Result<(), ClientError>) -> RpcError {
    match result {
        Err(ClientError::Rpc(err)) => err,
        other => panic!("expected an rpc-error, got {other:?}"),
    }
}

fn read_until(stream: &mut UnixStream, marker: &[u8]) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while !out.windows(marker.len()).any(|w| w == marker) {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed early");
        out.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn handshake_then_get_config_on_empty_candidate() {
    let harness = Harness::start(&MemoryKernel::new());
    let mut stream = UnixStream::connect(&harness.socket).unwrap();

    let hello = read_until(&mut stream, b"]]>]]>");
    assert!(hello.contains("<session-id>1</session-id>"));
    assert!(hello.contains("urn:ietf:params:netconf:base:1.0"));
    assert!(hello.contains("urn:ietf:params:netconf:base:1.1"));

    stream
        .write_all(
            b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities>\
              <capability>urn:ietf:params:netconf:base:1.0</capability>\
              <capability>urn:ietf:params:netconf:base:1.1</capability>\
              </capabilities></hello>]]>]]>",
        )
        .unwrap();

    let body = r#"<rpc message-id="1" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><get-config><source><candidate/></source></get-config></rpc>"#;
    write!(stream, "\n#{}\n{body}\n##\n", body.len()).unwrap();

    let reply = read_until(&mut stream, b"\n##\n");
    assert!(reply.starts_with("\n#"));
    assert!(reply.contains(
        r#"<rpc-reply xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" message-id="1"><data/></rpc-reply>"#
    ));
}

#[test]
fn lock_contention() {
    let harness = Harness::start(&MemoryKernel::new());
    let a = harness.client();
    let b = harness.client();

    a.lock(DatastoreId::Running).unwrap();
    let err = rpc_error(b.lock(DatastoreId::Running));
    assert_eq!(err.tag, ErrorTag::LockDenied);
    assert_eq!(err.info("session-id"), Some(a.session_id().to_string().as_str()));

    a.unlock(DatastoreId::Running).unwrap();
    b.lock(DatastoreId::Running).unwrap();
}

#[test]
fn edit_validate_commit() {
    let kernel = MemoryKernel::new();
    let harness = Harness::start(&kernel);
    let client = harness.client();

    client
        .edit_config(
            DatastoreId::Candidate,
            interfaces("<interface><name>lo1</name><mtu>1500</mtu></interface>"),
        )
        .unwrap();
    client
        .validate(ConfigSource::Datastore(DatastoreId::Candidate))
        .unwrap();
    client.commit().unwrap();

    let running = client.get_config(DatastoreId::Running, None).unwrap();
    assert!(has_interface(&running, "lo1"));
    assert!(kernel.calls().contains(&KernelCall::Create {
        kind: ObjectKind::Loopback,
        name: "lo1".to_string(),
    }));

    let state = client
        .get(Some(Filter::XPath("/interfaces-state".to_string())))
        .unwrap();
    let lo1 = state
        .child("interfaces-state")
        .and_then(|s| s.children_named("interface").find(|i| i.child_text("name") == Some("lo1")));
    assert_eq!(lo1.and_then(|i| i.child_text("mtu")), Some("1500"));
}

#[test]
fn kernel_rejection_is_reverted() {
    let kernel = MemoryKernel::new().with_object(
        KernelObject::new(ObjectKind::Ethernet, "em0").with("addresses", "192.0.2.1/24"),
    );
    let harness = Harness::start(&kernel);
    let client = harness.client();

    client
        .edit_config(
            DatastoreId::Candidate,
            interfaces(
                "<interface><name>lo1</name></interface>\
                 <interface><name>lo2</name><address><ip>192.0.2.1</ip>\
                 <prefix-length>32</prefix-length></address></interface>",
            ),
        )
        .unwrap();

    let err = rpc_error(client.commit());
    assert_eq!(err.tag, ErrorTag::OperationFailed);

    let running = client.get_config(DatastoreId::Running, None).unwrap();
    assert!(!has_interface(&running, "lo1"));
    assert!(!has_interface(&running, "lo2"));
    assert!(kernel.calls().contains(&KernelCall::Destroy {
        kind: ObjectKind::Loopback,
        name: "lo1".to_string(),
    }));
    assert!(kernel.interface("lo1").is_none());
}

#[test]
fn discard_changes() {
    let harness = Harness::start(&MemoryKernel::new());
    let client = harness.client();

    client
        .edit_config(
            DatastoreId::Candidate,
            interfaces("<interface><name>lo2</name></interface>"),
        )
        .unwrap();
    assert!(has_interface(
        &client.get_config(DatastoreId::Candidate, None).unwrap(),
        "lo2"
    ));
    assert!(!has_interface(
        &client.get_config(DatastoreId::Running, None).unwrap(),
        "lo2"
    ));

    client.discard_changes().unwrap();
    let candidate = client.get_config(DatastoreId::Candidate, None).unwrap();
    let running = client.get_config(DatastoreId::Running, None).unwrap();
    assert!(!has_interface(&candidate, "lo2"));
    assert_eq!(candidate.to_xml(), running.to_xml());
}

#[test]
fn kill_session_releases_the_victims_locks() {
    let harness = Harness::start(&MemoryKernel::new());
    let a = harness.client();
    let b = harness.client();

    a.lock(DatastoreId::Candidate).unwrap();
    let err = rpc_error(b.kill_session(b.session_id()));
    assert_eq!(err.tag, ErrorTag::InvalidValue);

    b.kill_session(a.session_id()).unwrap();
    b.lock(DatastoreId::Candidate).unwrap();
    assert!(a.lock(DatastoreId::Running).is_err());
}

#[test]
fn closing_a_session_releases_its_locks() {
    let harness = Harness::start(&MemoryKernel::new());
    let a = harness.client();
    let b = harness.client();

    a.lock(DatastoreId::Startup).unwrap();
    a.close().unwrap();

    // The server releases locks once it sees the session end.
    let mut attempts = 0;
    while b.lock(DatastoreId::Startup).is_err() {
        attempts += 1;
        assert!(attempts < 50, "lock never released");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn copy_running_to_startup_persists() {
    let harness = Harness::start(&MemoryKernel::new());
    let client = harness.client();

    client
        .edit_config(
            DatastoreId::Running,
            interfaces("<interface><name>lo7</name></interface>"),
        )
        .unwrap();
    client
        .copy_config(
            DatastoreId::Startup,
            ConfigSource::Datastore(DatastoreId::Running),
        )
        .unwrap();

    let startup = client.get_config(DatastoreId::Startup, None).unwrap();
    assert!(has_interface(&startup, "lo7"));

    let err = rpc_error(client.delete_config(DatastoreId::Running));
    assert_eq!(err.tag, ErrorTag::OperationNotSupported);
}

#[test]
fn unanswered_request_times_out() {
    let dir = TempDir::new("netconfd").unwrap();
    let socket = dir.path().join("silent.sock");
    let listener = transport::bind(&socket).unwrap();

    // A server that completes the hello and then never answers.
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .write_all(
                b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities>\
                  <capability>urn:ietf:params:netconf:base:1.0</capability></capabilities>\
                  <session-id>1</session-id></hello>]]>]]>",
            )
            .unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    let config = ClientConfig {
        ttl: Duration::from_millis(200),
        ..client_config(&socket)
    };
    let client = Client::connect(&config).unwrap();
    let (tx, rx) = mpsc::channel();
    let message_id = client
        .send(
            &Request::Commit,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Err(ClientError::Timeout { message_id: expired }) => assert_eq!(expired, message_id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.pending(), 0);

    drop(client);
    server.join().unwrap();
}
