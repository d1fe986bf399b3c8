//! NETCONF protocol layer.
//!
//! This module carries NETCONF messages between clients and the server: how
//! they are framed on the byte stream, how sessions start, how `<rpc>`
//! envelopes are parsed into typed requests, and how replies find their way
//! back to the caller.
//!
//! # Overview
//!
//! Sessions run over a local stream socket. Every session opens with a
//! `<hello>` exchange; when both peers speak base:1.1 the session switches
//! from end-of-message framing to chunked framing. After that the server
//! reads one `<rpc>` at a time, dispatches it against the shared
//! datastores and writes exactly one `<rpc-reply>`.
//!
//! # Key Components
//!
//! - [`framing`]: end-of-message and chunked framing.
//! - [`codec`]: `<hello>`, `<rpc>` and `<rpc-reply>` envelopes.
//! - [`Request`] / [`Response`]: typed operations and their results.
//! - [`ProtocolTransport`]: framed messages over a socket.
//! - [`session`]: hello handshake, capabilities and the session registry.
//! - [`Dispatcher`]: maps requests onto the datastore manager.
//! - [`NetconfServer`]: accept loop running one session per worker.
//! - [`Client`] and [`expectation`]: client API and reply correlation.
//!
//! # Wire Format
//!
//! - End-of-message: each message is followed by `]]>]]>`.
//! - Chunked: `\n#<len>\n` followed by `len` bytes, repeated, closed by
//!   `\n##\n`.
//!
//! # See Also
//!
//! - [`storage`](crate::storage): the datastores requests operate on.
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod expectation;
pub mod framing;
mod request;
mod response;
mod server;
pub mod session;
mod thread;
pub mod transport;

use thread::ThreadPool;

pub use client::{Client, ClientError};
pub use dispatcher::Dispatcher;
pub use error::RpcError;
pub use request::Request;
pub use response::Response;
pub use server::NetconfServer;
pub use transport::ProtocolTransport;
