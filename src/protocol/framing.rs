//! NETCONF message framing.
//!
//! Two framings exist on the wire:
//!
//! - end-of-message (base:1.0): the message is followed by `]]>]]>`.
//! - chunked (base:1.1): the message is split into chunks, each prefixed by
//!   `\n#<length>\n`, and terminated by `\n##\n`.
//!
//! A [`FrameReader`] without a fixed mode detects the framing of the first
//! message it sees by peeking for the `\n#` chunk prefix. The session pins the
//! mode explicitly once the hello exchange has settled it.
use std::io::{self, Cursor, Read, Write};

use thiserror::Error;

pub const EOM_DELIMITER: &[u8] = b"]]>]]>";
pub const CHUNK_PREFIX: &[u8] = b"\n#";
pub const END_OF_CHUNKS: &[u8] = b"\n##\n";
pub const MAX_CHUNK_SIZE: u64 = 4_294_967_295;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const MAX_CHUNK_DIGITS: usize = 10;
const READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    EndOfMessage,
    Chunked,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("framing io error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended inside a message")]
    Truncated,

    #[error("invalid chunk header: {0}")]
    InvalidChunkHeader(String),

    #[error("chunk size '{0}' is out of range")]
    ChunkSizeOutOfRange(String),

    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("cannot frame an empty message")]
    EmptyMessage,

    #[error("message body contains the end-of-message delimiter")]
    DelimiterInBody,
}

/// Parse the decimal length of a chunk header. Leading zeros are rejected,
/// as is anything outside `1..=4294967295`.
pub fn parse_chunk_size(digits: &[u8]) -> Result<u64, FramingError> {
    let text = String::from_utf8_lossy(digits).to_string();
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(FramingError::InvalidChunkHeader(format!(
            "'{text}' is not a decimal length"
        )));
    }
    if digits[0] == b'0' || digits.len() > MAX_CHUNK_DIGITS {
        return Err(FramingError::ChunkSizeOutOfRange(text));
    }

    let size: u64 = text
        .parse()
        .map_err(|_| FramingError::ChunkSizeOutOfRange(text.clone()))?;
    if size > MAX_CHUNK_SIZE {
        return Err(FramingError::ChunkSizeOutOfRange(text));
    }
    Ok(size)
}

/// Frame `body` for the wire.
pub fn encode(body: &[u8], mode: FramingMode, chunk_size: usize) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(body.len() + 16);
    write_frame(&mut out, body, mode, chunk_size)?;
    Ok(out)
}

/// Strip the framing from a single complete frame.
pub fn decode(frame: &[u8], mode: FramingMode) -> Result<Vec<u8>, FramingError> {
    let mut reader = FrameReader::with_mode(Cursor::new(frame), mode);
    reader.read_message()?.ok_or(FramingError::Truncated)
}

fn write_frame<W: Write>(
    out: &mut W,
    body: &[u8],
    mode: FramingMode,
    chunk_size: usize,
) -> Result<(), FramingError> {
    if body.is_empty() {
        return Err(FramingError::EmptyMessage);
    }

    match mode {
        FramingMode::EndOfMessage => {
            if find(body, EOM_DELIMITER).is_some() {
                return Err(FramingError::DelimiterInBody);
            }
            out.write_all(body)?;
            out.write_all(EOM_DELIMITER)?;
        }
        FramingMode::Chunked => {
            let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE as usize);
            for chunk in body.chunks(chunk_size) {
                write!(out, "\n#{}\n", chunk.len())?;
                out.write_all(chunk)?;
            }
            out.write_all(END_OF_CHUNKS)?;
        }
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads framed messages off a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    mode: Option<FramingMode>,
    limit: Option<usize>,
}

impl<R: Read> FrameReader<R> {
    /// Reader that detects the framing of the first message.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            start: 0,
            mode: None,
            limit: None,
        }
    }

    pub fn with_mode(inner: R, mode: FramingMode) -> Self {
        let mut reader = Self::new(inner);
        reader.mode = Some(mode);
        reader
    }

    /// Mode in effect; `None` until the first message settles it.
    pub fn mode(&self) -> Option<FramingMode> {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = Some(mode);
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Read the next message body. `Ok(None)` is a clean end of stream
    /// between messages.
    pub fn read_message(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                let mode = self.detect()?;
                self.mode = Some(mode);
                mode
            }
        };

        let message = match mode {
            FramingMode::EndOfMessage => self.read_end_of_message(),
            FramingMode::Chunked => self.read_chunked(),
        };
        self.compact();
        message
    }

    fn detect(&mut self) -> Result<FramingMode, FramingError> {
        self.fill(CHUNK_PREFIX.len())?;
        if self.available().starts_with(CHUNK_PREFIX) {
            Ok(FramingMode::Chunked)
        } else {
            Ok(FramingMode::EndOfMessage)
        }
    }

    fn read_end_of_message(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let mut searched = 0;
        loop {
            let window = self.available();
            if let Some(pos) = find(&window[searched..], EOM_DELIMITER) {
                let end = searched + pos;
                let message = window[..end].to_vec();
                self.start += end + EOM_DELIMITER.len();
                return Ok(Some(message));
            }
            searched = window.len().saturating_sub(EOM_DELIMITER.len() - 1);
            self.check_limit(window.len())?;

            if !self.read_more()? {
                if self.available().iter().all(u8::is_ascii_whitespace) {
                    self.start = self.buf.len();
                    return Ok(None);
                }
                return Err(FramingError::Truncated);
            }
        }
    }

    fn read_chunked(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let mut message = Vec::new();
        let mut chunks = 0usize;

        loop {
            if !self.fill(CHUNK_PREFIX.len())? {
                if chunks == 0 && self.available().is_empty() {
                    return Ok(None);
                }
                return Err(FramingError::Truncated);
            }
            if !self.available().starts_with(CHUNK_PREFIX) {
                return Err(FramingError::InvalidChunkHeader(
                    "expected '\\n#'".to_string(),
                ));
            }
            self.start += CHUNK_PREFIX.len();

            if self.next_byte()? == b'#' {
                if self.next_byte()? != b'\n' {
                    return Err(FramingError::InvalidChunkHeader(
                        "end-of-chunks marker not followed by newline".to_string(),
                    ));
                }
                if chunks == 0 {
                    return Err(FramingError::InvalidChunkHeader(
                        "end-of-chunks before any chunk".to_string(),
                    ));
                }
                return Ok(Some(message));
            }
            self.start -= 1;

            let mut digits = Vec::with_capacity(MAX_CHUNK_DIGITS);
            loop {
                let b = self.next_byte()?;
                if b == b'\n' {
                    break;
                }
                if digits.len() == MAX_CHUNK_DIGITS {
                    return Err(FramingError::ChunkSizeOutOfRange(
                        String::from_utf8_lossy(&digits).to_string(),
                    ));
                }
                digits.push(b);
            }

            let size = parse_chunk_size(&digits)?;
            let mut remaining = usize::try_from(size)
                .map_err(|_| FramingError::ChunkSizeOutOfRange(size.to_string()))?;

            // The limit applies to bytes received, not to the declared size.
            while remaining > 0 {
                if self.available().is_empty() && !self.read_more()? {
                    return Err(FramingError::Truncated);
                }
                let take = remaining.min(self.available().len());
                self.check_limit(message.len() + take)?;
                message.extend_from_slice(&self.buf[self.start..self.start + take]);
                self.start += take;
                remaining -= take;
                self.compact();
            }
            chunks += 1;
        }
    }

    fn check_limit(&self, len: usize) -> Result<(), FramingError> {
        match self.limit {
            Some(limit) if len > limit => Err(FramingError::MessageTooLarge { limit }),
            _ => Ok(()),
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn next_byte(&mut self) -> Result<u8, FramingError> {
        if !self.fill(1)? {
            return Err(FramingError::Truncated);
        }
        let b = self.buf[self.start];
        self.start += 1;
        Ok(b)
    }

    /// Buffer at least `n` unread bytes. `Ok(false)` if the stream ends first.
    fn fill(&mut self, n: usize) -> Result<bool, FramingError> {
        while self.available().len() < n {
            if !self.read_more()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn read_more(&mut self) -> Result<bool, FramingError> {
        let mut chunk = [0u8; READ_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn compact(&mut self) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > READ_SIZE && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Writes framed messages to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    mode: FramingMode,
    chunk_size: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            mode: FramingMode::EndOfMessage,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn write_message(&mut self, body: &[u8]) -> Result<(), FramingError> {
        write_frame(&mut self.inner, body, self.mode, self.chunk_size)?;
        self.inner.flush()?;
        Ok(())
    }
}
