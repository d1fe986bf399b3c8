use std::{
    fs,
    io::{self, ErrorKind, Read, Write},
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use super::{
    codec::{self, CodecError, Message},
    framing::{FrameReader, FrameWriter, FramingError, FramingMode},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("{source}")]
    Codec {
        source: CodecError,
        /// Recovered from the raw bytes when the envelope could not be parsed.
        message_id: Option<String>,
    },

    #[error("{} exists and is not a socket", .0.display())]
    Occupied(PathBuf),

    #[error("another server is listening on {}", .0.display())]
    InUse(PathBuf),

    #[error("{} is not a writable directory", .0.display())]
    DirectoryNotWritable(PathBuf),

    #[error("not permitted to bind {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("no server socket at {}", .0.display())]
    NotFound(PathBuf),

    #[error("connection to {} refused: {source}", .path.display())]
    Refused { path: PathBuf, source: io::Error },
}

/// Framed NETCONF messages over a pair of byte streams.
pub struct ProtocolTransport<R: Read, W: Write> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl ProtocolTransport<UnixStream, UnixStream> {
    /// Split a socket into independent read and write halves.
    pub fn from_stream(stream: UnixStream) -> Result<Self, TransportError> {
        let writer = stream.try_clone()?;
        Ok(Self::new(stream, writer))
    }
}

impl<R: Read, W: Write> ProtocolTransport<R, W> {
    /// Inbound framing is detected on the first message; outbound starts as
    /// end-of-message until the hello exchange says otherwise.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        debug!("switching to {mode:?} framing");
        self.reader.set_mode(mode);
        self.writer.set_mode(mode);
    }

    pub fn mode(&self) -> FramingMode {
        self.writer.mode()
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.writer.set_chunk_size(chunk_size);
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.reader.set_limit(limit);
    }

    pub fn reader(&self) -> &R {
        self.reader.get_ref()
    }

    pub fn writer(&self) -> &W {
        self.writer.get_ref()
    }

    /// Next message, or `None` when the peer closed between messages.
    pub fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        read_message(&mut self.reader)
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        write_message(&mut self.writer, message)
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Read and parse one message off a frame reader.
pub fn read_message<R: Read>(reader: &mut FrameReader<R>) -> Result<Option<Message>, TransportError> {
    let Some(bytes) = reader.read_message()? else {
        return Ok(None);
    };
    trace!("<< {}", String::from_utf8_lossy(&bytes));

    codec::parse_message(&bytes).map(Some).map_err(|source| {
        let message_id = match &source {
            CodecError::MissingOperation { message_id } => message_id.clone(),
            _ => codec::recover_message_id(&bytes),
        };
        TransportError::Codec { source, message_id }
    })
}

pub fn write_message<W: Write>(
    writer: &mut FrameWriter<W>,
    message: &Message,
) -> Result<(), TransportError> {
    let bytes = codec::encode_message(message);
    trace!(">> {}", String::from_utf8_lossy(&bytes));
    writer.write_message(&bytes)?;
    Ok(())
}

/// Bind the server socket at `path`.
///
/// Refuses to touch a path held by something other than a socket, or a
/// socket another server still answers on. A stale socket is removed first.
pub fn bind(path: &Path) -> Result<UnixListener, TransportError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let meta = fs::metadata(dir).map_err(|_| TransportError::DirectoryNotWritable(dir.into()))?;
    if !meta.is_dir() || meta.permissions().readonly() {
        return Err(TransportError::DirectoryNotWritable(dir.into()));
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                return Err(TransportError::InUse(path.into()));
            }
            warn!("removing stale socket {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(_) => return Err(TransportError::Occupied(path.into())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => TransportError::PermissionDenied(path.into()),
        _ => e.into(),
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    info!("listening at {}", path.display());
    Ok(listener)
}

pub fn connect(path: &Path) -> Result<UnixStream, TransportError> {
    UnixStream::connect(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => TransportError::NotFound(path.into()),
        _ => TransportError::Refused {
            path: path.into(),
            source: e,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempdir::TempDir;

    use super::*;
    use crate::protocol::codec::{Hello, RpcReply};

    #[test]
    fn read_write_message() {
        let mut out = ProtocolTransport::new(io::empty(), Vec::new());
        out.write_message(&Message::RpcReply(RpcReply::ok(Some("5".to_string()))))
            .unwrap();
        let written = out.writer().clone();
        assert!(written.ends_with(b"]]>]]>"));

        let mut inbound = ProtocolTransport::new(Cursor::new(written), io::sink());
        let msg = inbound.read_message().unwrap().unwrap();
        assert_eq!(msg, Message::RpcReply(RpcReply::ok(Some("5".to_string()))));
        assert!(inbound.read_message().unwrap().is_none());
    }

    #[test]
    fn chunked_after_switch() {
        let mut out = ProtocolTransport::new(io::empty(), Vec::new());
        out.set_mode(FramingMode::Chunked);
        out.set_chunk_size(16);
        let hello = Message::Hello(Hello {
            capabilities: vec!["urn:ietf:params:netconf:base:1.1".to_string()],
            session_id: Some(3),
        });
        out.write_message(&hello).unwrap();
        let written = out.writer().clone();
        assert!(written.starts_with(b"\n#16\n"));
        assert!(written.ends_with(b"\n##\n"));

        let mut inbound = ProtocolTransport::new(Cursor::new(written), io::sink());
        assert_eq!(inbound.read_message().unwrap(), Some(hello));
    }

    #[test]
    fn malformed_message_recovers_id() {
        let bytes = b"<rpc message-id=\"77\"><get></rpc>]]>]]>".to_vec();
        let mut inbound = ProtocolTransport::new(Cursor::new(bytes), io::sink());
        match inbound.read_message() {
            Err(TransportError::Codec { message_id, .. }) => {
                assert_eq!(message_id.as_deref(), Some("77"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bind_reclaims_stale_socket() {
        let dir = TempDir::new("transport").unwrap();
        let path = dir.path().join("netconf.sock");

        let first = bind(&path).unwrap();
        drop(first);
        assert!(path.exists());

        let _second = bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn bind_refuses_live_socket_and_regular_files() {
        let dir = TempDir::new("transport").unwrap();
        let path = dir.path().join("netconf.sock");
        let _listener = bind(&path).unwrap();
        assert!(matches!(bind(&path), Err(TransportError::InUse(_))));

        let file = dir.path().join("plain");
        fs::write(&file, b"not a socket").unwrap();
        assert!(matches!(bind(&file), Err(TransportError::Occupied(_))));
    }

    #[test]
    fn connect_to_missing_socket() {
        let dir = TempDir::new("transport").unwrap();
        let err = connect(&dir.path().join("absent.sock")).unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }
}
