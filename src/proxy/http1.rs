//! Plaintext HTTP/1.1 backend transport
//!
//! One exchange per connection at a time, keep-alive reuse when both sides
//! allow it. Response bodies may be length-delimited, chunked or
//! close-delimited; request bodies of unknown length are sent chunked.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::http::parser::{ParseError, parse_response_head, response_version};
use crate::http::request::Method;
use crate::http::response::ResponseHead;
use crate::proxy::transport::{
    BackendConnection, Connector, RequestHead, TransportConfig, UpstreamExchange,
};

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Opens plain TCP connections speaking HTTP/1.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1Connector;

#[async_trait]
impl Connector for Http1Connector {
    fn supports(&self, transport: &TransportConfig) -> bool {
        !transport.tls && !transport.multiplexed
    }

    async fn connect(
        &self,
        address: &str,
        _transport: &TransportConfig,
    ) -> io::Result<Arc<dyn BackendConnection>> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;

        tracing::trace!(backend = %address, "Connected to backend");
        Ok(Arc::new(Http1Connection::new(address, stream)))
    }
}

struct Http1Io {
    stream: TcpStream,
    buffer: BytesMut,
}

/// A keep-alive HTTP/1.1 connection to one backend.
pub struct Http1Connection {
    address: String,
    io: Arc<Mutex<Option<Http1Io>>>,
    open: Arc<AtomicBool>,
}

impl Http1Connection {
    pub fn new(address: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            address: address.into(),
            io: Arc::new(Mutex::new(Some(Http1Io {
                stream,
                buffer: BytesMut::with_capacity(BUFFER_SIZE),
            }))),
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "backend connection is closed")
}

#[async_trait]
impl BackendConnection for Http1Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        // An exchange in progress drops the socket itself when it ends
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }
    }

    async fn send_request(&self, head: &RequestHead) -> io::Result<Box<dyn UpstreamExchange>> {
        if !self.is_open() {
            return Err(closed());
        }

        let mut guard = Arc::clone(&self.io).lock_owned().await;
        let io = guard.as_mut().ok_or_else(closed)?;

        let bytes = build_request_head(head, &self.address);
        let written = async {
            io.stream.write_all(&bytes).await?;
            io.stream.flush().await
        }
        .await;

        if let Err(e) = written {
            self.open.store(false, Ordering::Release);
            guard.take();
            return Err(e);
        }

        tracing::trace!(backend = %self.address, "Request head sent to backend");

        Ok(Box::new(Http1Exchange {
            io: guard,
            open: Arc::clone(&self.open),
            chunked_request: head.body_length.is_none(),
            head_request: head.method == Method::HEAD,
            response_started: false,
            body: BodyState::Pending,
            keep_alive: true,
        }))
    }
}

/// Serializes the request line and headers sent to the backend.
///
/// Adds `Host` when the client sent none, and frames the body with
/// `Content-Length` or, when the length is unknown, chunked encoding.
pub fn build_request_head(head: &RequestHead, authority: &str) -> Vec<u8> {
    let mut buffer = Vec::new();

    let path = if head.path.is_empty() {
        "/"
    } else {
        &head.path
    };

    // Request line
    buffer.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method.as_str(), path).as_bytes());

    if !head.headers.contains("Host") {
        buffer.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
    }

    for (key, value) in head.headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length")
            || key.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    match head.body_length {
        Some(0) if !matches!(head.method, Method::POST | Method::PUT | Method::PATCH) => {}
        Some(length) => {
            buffer.extend_from_slice(format!("Content-Length: {}\r\n", length).as_bytes())
        }
        None => buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
    }

    // End of headers
    buffer.extend_from_slice(b"\r\n");

    buffer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    /// Response head not read yet
    Pending,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    UntilClose,
    Done,
}

struct Http1Exchange {
    io: OwnedMutexGuard<Option<Http1Io>>,
    open: Arc<AtomicBool>,
    chunked_request: bool,
    head_request: bool,
    response_started: bool,
    body: BodyState,
    keep_alive: bool,
}

impl Http1Exchange {
    fn io(&mut self) -> io::Result<&mut Http1Io> {
        self.io.as_mut().ok_or_else(closed)
    }

    /// Reads more bytes into the buffer. Returns 0 at end of stream.
    async fn fill(&mut self) -> io::Result<usize> {
        let io = self.io()?;
        io.buffer.reserve(BUFFER_SIZE);
        let n = io.stream.read_buf(&mut io.buffer).await?;
        if n > 0 {
            self.response_started = true;
        }
        Ok(n)
    }

    async fn fill_or_eof(&mut self) -> io::Result<()> {
        if self.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed the connection mid-response",
            ));
        }
        Ok(())
    }

    /// Reads one CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            let io = self.io()?;
            if let Some(pos) = io.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = io.buffer.split_to(pos + 2);
                return String::from_utf8(line[..pos].to_vec())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
            if io.buffer.len() > BUFFER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk header line too long",
                ));
            }
            self.fill_or_eof().await?;
        }
    }

    /// Takes up to `limit` buffered body bytes, reading if none are buffered.
    async fn take_body(&mut self, limit: u64) -> io::Result<Bytes> {
        if self.io()?.buffer.is_empty() {
            self.fill_or_eof().await?;
        }
        let io = self.io()?;
        let n = io.buffer.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(io.buffer.split_to(n).freeze())
    }

    fn body_framing(&self, head: &ResponseHead) -> io::Result<BodyState> {
        if self.head_request || head.status.forbids_body() {
            return Ok(BodyState::Done);
        }

        let chunked = head
            .headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(BodyState::ChunkSize);
        }

        match head.headers.get("Content-Length") {
            Some(value) => {
                let length: u64 = value.trim().parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")
                })?;
                Ok(if length == 0 {
                    BodyState::Done
                } else {
                    BodyState::Length(length)
                })
            }
            None => Ok(BodyState::UntilClose),
        }
    }
}

fn parse_failure(err: ParseError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed backend response: {:?}", err),
    )
}

#[async_trait]
impl UpstreamExchange for Http1Exchange {
    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let chunked = self.chunked_request;
        let io = self.io()?;
        if chunked {
            io.stream
                .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                .await?;
            io.stream.write_all(chunk).await?;
            io.stream.write_all(b"\r\n").await
        } else {
            io.stream.write_all(chunk).await
        }
    }

    async fn finish_request(&mut self) -> io::Result<()> {
        let chunked = self.chunked_request;
        let io = self.io()?;
        if chunked {
            io.stream.write_all(b"0\r\n\r\n").await?;
        }
        io.stream.flush().await
    }

    async fn response_head(&mut self) -> io::Result<ResponseHead> {
        loop {
            let parsed = {
                let io = self.io()?;
                match parse_response_head(&io.buffer) {
                    Ok((head, consumed)) => {
                        let http10 = response_version(&io.buffer) == Some("HTTP/1.0");
                        let _ = io.buffer.split_to(consumed);
                        Some((head, http10))
                    }
                    Err(ParseError::Incomplete) => None,
                    Err(e) => return Err(parse_failure(e)),
                }
            };

            let Some((head, http10)) = parsed else {
                self.fill_or_eof().await?;
                continue;
            };

            // Interim responses are consumed here and never relayed
            if head.status.is_informational() {
                tracing::trace!(status = head.status.as_u16(), "Skipping interim response");
                continue;
            }

            self.keep_alive = match head.headers.get("Connection") {
                Some(v) if v.eq_ignore_ascii_case("close") => false,
                Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
                _ => !http10,
            };
            self.body = self.body_framing(&head)?;
            if self.body == BodyState::UntilClose {
                self.keep_alive = false;
            }
            return Ok(head);
        }
    }

    async fn read_body(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.body {
                BodyState::Pending => {
                    return Err(io::Error::other("response head not read yet"));
                }
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    let chunk = self.take_body(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.body = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::UntilClose => {
                    if self.io()?.buffer.is_empty() && self.fill().await? == 0 {
                        self.body = BodyState::Done;
                        return Ok(None);
                    }
                    let io = self.io()?;
                    let len = io.buffer.len();
                    return Ok(Some(io.buffer.split_to(len).freeze()));
                }
                BodyState::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    self.body = if size == 0 {
                        BodyState::Trailers
                    } else {
                        BodyState::ChunkData(size)
                    };
                }
                BodyState::ChunkData(remaining) => {
                    let chunk = self.take_body(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.body = if left == 0 {
                        BodyState::ChunkEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkEnd => {
                    if !self.read_line().await?.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.body = BodyState::ChunkSize;
                }
                BodyState::Trailers => {
                    if self.read_line().await?.is_empty() {
                        self.body = BodyState::Done;
                    }
                }
            }
        }
    }

    fn response_started(&self) -> bool {
        self.response_started
    }

    fn is_reusable(&self) -> bool {
        self.body == BodyState::Done && self.keep_alive && self.open.load(Ordering::Acquire)
    }
}

impl Drop for Http1Exchange {
    fn drop(&mut self) {
        if !self.is_reusable() {
            self.open.store(false, Ordering::Release);
            // Dropping the stream closes the socket
            self.io.take();
        }
    }
}
