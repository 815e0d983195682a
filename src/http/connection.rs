//! Client connection handling.
//!
//! Each accepted socket is driven through the state machine described in
//! [`crate::http`]. Small request bodies are buffered so a failed attempt
//! can be retried; larger and chunked bodies are streamed to the backend
//! while the exchange is in flight.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::ReadHalf;
use tokio::sync::mpsc;

use crate::http::body::{BodyDecoder, BodyFraming};
use crate::http::parser::{ParseError, parse_request_head};
use crate::http::request::{Request, RequestBody};
use crate::http::response::Response;
use crate::http::writer::{Http1ResponseSink, ResponseWriter};
use crate::proxy::forwarder::ExchangeForwarder;
use crate::proxy::host::WorkerId;

/// Bodies up to this size are read in full before forwarding.
pub const MAX_BUFFERED_BODY: usize = 8192;

/// Body chunks in flight between the client socket and the backend.
const BODY_CHANNEL_CAPACITY: usize = 4;

/// One client connection, served on a single worker.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    worker: WorkerId,
    forwarder: ExchangeForwarder,
    buffer: Vec<u8>,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Forwarding(Request, BodyDecoder),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        worker: WorkerId,
        forwarder: ExchangeForwarder,
    ) -> Self {
        Self {
            stream,
            peer,
            worker,
            forwarder,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await {
                        Ok(Some((req, body))) => ConnectionState::Forwarding(req, body),
                        Ok(None) => ConnectionState::Closed,
                        Err(e) => {
                            tracing::debug!(peer = %self.peer, error = %e, "Rejecting malformed request");
                            ConnectionState::Writing(ResponseWriter::new(&Response::bad_request()), false)
                        }
                    };
                }

                ConnectionState::Forwarding(mut req, body) => {
                    let keep_alive = self.forward(&mut req, body).await;
                    self.state = if keep_alive {
                        ConnectionState::Reading // go back for next request
                    } else {
                        ConnectionState::Closed
                    };
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    self.state = if keep_alive {
                        ConnectionState::Reading
                    } else {
                        ConnectionState::Closed
                    };
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Proxies one request. Returns whether the connection stays open.
    ///
    /// The forward is cancelled if the client goes away first; its backend
    /// connection is then discarded rather than returned to the pool. A body
    /// that was not read to its end leaves the connection unusable.
    async fn forward(&mut self, req: &mut Request, mut body: BodyDecoder) -> bool {
        let body_tx = if body.is_done() {
            None
        } else {
            let (tx, streaming) =
                RequestBody::streaming(BODY_CHANNEL_CAPACITY, body.framing().length());
            req.body = streaming;
            Some(tx)
        };

        let peer = self.peer;
        let buffer = &mut self.buffer;
        let (mut reader, writer) = self.stream.split();
        let mut sink = Http1ResponseSink::new(writer, req);

        let finished = {
            let reader = &mut reader;
            let decoder = &mut body;
            let client = async move {
                if let Some(tx) = body_tx {
                    if let Err(e) = pump_body(decoder, reader, buffer, tx).await {
                        tracing::debug!(peer = %peer, error = %e, "Failed to read request body");
                        return;
                    }
                }
                watch_client(reader, buffer).await
            };

            tokio::select! {
                outcome = self.forwarder.forward(self.worker, req, &mut sink) => Some(outcome),
                _ = client => None,
            }
        };

        match finished {
            Some(outcome) => !outcome.is_aborted() && sink.keep_alive() && body.is_done(),
            None => {
                tracing::debug!(
                    peer = %peer,
                    method = ?req.method,
                    path = %req.path,
                    "Client disconnected mid-request, cancelling exchange"
                );
                false
            }
        }
    }

    /// Reads the next request head. Bodies up to [`MAX_BUFFERED_BODY`] are
    /// read here too; anything else is left to the returned decoder.
    pub async fn read_request(&mut self) -> anyhow::Result<Option<(Request, BodyDecoder)>> {
        let (mut request, framing) = loop {
            // Try parsing whatever we already have
            match parse_request_head(&self.buffer) {
                Ok((request, framing, consumed)) => {
                    // Remove consumed bytes
                    self.buffer.drain(..consumed);
                    break (request, framing);
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => {
                    // Malformed request → protocol error
                    return Err(anyhow::anyhow!("HTTP parse error: {:?}", e));
                }
            }

            if !self.fill().await? {
                if !self.buffer.is_empty() {
                    tracing::debug!(peer = %self.peer, "Client closed mid-request");
                }
                return Ok(None);
            }
        };
        request.peer = Some(self.peer);

        if let BodyFraming::Length(length) = framing {
            if length <= MAX_BUFFERED_BODY as u64 {
                let length = length as usize;
                while self.buffer.len() < length {
                    if !self.fill().await? {
                        tracing::debug!(peer = %self.peer, "Client closed mid-request");
                        return Ok(None);
                    }
                }
                let body: Vec<u8> = self.buffer.drain(..length).collect();
                request.body = RequestBody::from(body);
                return Ok(Some((request, BodyDecoder::new(BodyFraming::None))));
            }
        }

        Ok(Some((request, BodyDecoder::new(framing))))
    }

    /// Reads more client bytes. Returns false at end of stream.
    async fn fill(&mut self) -> io::Result<bool> {
        let mut temp = [0u8; 4096];
        let n = self.stream.read(&mut temp).await?;
        self.buffer.extend_from_slice(&temp[..n]);
        Ok(n > 0)
    }
}

/// Feeds the request body to the exchange until it ends or the exchange
/// stops reading it.
async fn pump_body(
    decoder: &mut BodyDecoder,
    reader: &mut ReadHalf<'_>,
    buffer: &mut Vec<u8>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<()> {
    loop {
        match decoder.next_chunk(reader, buffer).await {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                return Err(e);
            }
        }
    }
}

/// Resolves once the client socket fails. Pipelined bytes that arrive
/// meanwhile are kept for the next request.
async fn watch_client(reader: &mut ReadHalf<'_>, buffer: &mut Vec<u8>) {
    let mut temp = [0u8; 1024];
    loop {
        match reader.read(&mut temp).await {
            // A half-closed client still reads the response
            Ok(0) => return std::future::pending().await,
            Ok(n) => buffer.extend_from_slice(&temp[..n]),
            Err(_) => return,
        }
    }
}
