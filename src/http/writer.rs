use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseHead, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Writable side of an inbound exchange.
///
/// The forwarder relays the backend response through this. Once `send_head`
/// has been called the status is committed and can no longer change; the
/// only way to report a later failure is `abort`.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send_head(&mut self, head: &ResponseHead) -> io::Result<()>;

    async fn send_body(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Completes the response.
    async fn finish(&mut self) -> io::Result<()>;

    /// Terminates the response abruptly, without a clean ending.
    async fn abort(&mut self);

    fn is_committed(&self) -> bool;
}

pub fn serialize_head(status: StatusCode, headers: &Headers) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = serialize_head(resp.status, &resp.headers);
    buf.extend_from_slice(&resp.body);
    buf
}

/// Writes a response generated by the proxy itself (parse errors and the like).
pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response),
            written: 0,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    NoBody,
    Length,
    Chunked,
    UntilClose,
}

/// HTTP/1.1 response sink over any async writer.
///
/// Picks the body framing from the relayed head: a declared length is kept,
/// otherwise HTTP/1.1 clients get chunked encoding and HTTP/1.0 clients a
/// close-delimited body.
pub struct Http1ResponseSink<W> {
    writer: W,
    head_request: bool,
    chunked_allowed: bool,
    framing: Framing,
    committed: bool,
    keep_alive: bool,
}

impl<W> Http1ResponseSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, request: &Request) -> Self {
        Self {
            writer,
            head_request: request.method == Method::HEAD,
            chunked_allowed: request.version != "HTTP/1.0",
            framing: Framing::NoBody,
            committed: false,
            keep_alive: request.keep_alive(),
        }
    }

    /// Whether the client connection can carry another request afterwards.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ResponseSink for Http1ResponseSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        let mut headers = head.headers.clone();
        headers.remove("Transfer-Encoding");
        headers.remove("Connection");

        self.framing = if self.head_request || head.status.forbids_body() {
            Framing::NoBody
        } else if head.content_length().is_some() {
            Framing::Length
        } else if self.chunked_allowed {
            headers.append("Transfer-Encoding", "chunked");
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::UntilClose
        };

        if !self.keep_alive {
            headers.append("Connection", "close");
        }

        self.committed = true;
        self.writer
            .write_all(&serialize_head(head.status, &headers))
            .await
    }

    async fn send_body(&mut self, chunk: Bytes) -> io::Result<()> {
        match self.framing {
            Framing::NoBody => Ok(()),
            Framing::Length | Framing::UntilClose => self.writer.write_all(&chunk).await,
            Framing::Chunked => {
                if chunk.is_empty() {
                    return Ok(());
                }
                self.writer
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                self.writer.write_all(&chunk).await?;
                self.writer.write_all(b"\r\n").await
            }
        }
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.framing == Framing::Chunked {
            self.writer.write_all(b"0\r\n\r\n").await?;
        }
        self.writer.flush().await
    }

    async fn abort(&mut self) {
        self.keep_alive = false;
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!(error = %e, "Failed to shut down aborted client stream");
        }
    }

    fn is_committed(&self) -> bool {
        self.committed
    }
}
