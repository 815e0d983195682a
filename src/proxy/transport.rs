//! Backend transport contract
//!
//! The balancer never speaks a wire protocol itself. It asks a [`Connector`]
//! for a [`BackendConnection`], and each connection can carry one (or, when
//! multiplexed, several) [`UpstreamExchange`]s at a time.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;

use crate::http::headers::Headers;
use crate::http::request::Method;
use crate::http::response::ResponseHead;

/// Transport profile of a backend host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Connection must be TLS-wrapped (`https` backends)
    pub tls: bool,
    /// Connection may carry concurrent exchanges (HTTP/2-style)
    pub multiplexed: bool,
    /// Concurrent exchange limit for multiplexed connections
    pub max_concurrent_streams: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: false,
            multiplexed: false,
            max_concurrent_streams: 100,
        }
    }
}

impl TransportConfig {
    /// Exchanges one connection may carry at once.
    pub fn exchange_capacity(&self) -> usize {
        if self.multiplexed {
            self.max_concurrent_streams.max(1)
        } else {
            1
        }
    }
}

/// Request line and headers sent to a backend.
///
/// `body_length` of `None` means the length is not known up front and the
/// transport must frame the body itself.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body_length: Option<u64>,
}

/// Opens connections to backend hosts.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Whether this connector can serve hosts with the given profile.
    fn supports(&self, transport: &TransportConfig) -> bool {
        let _ = transport;
        true
    }

    /// Opens a connection to `address` (`host:port`). Callers bound the
    /// wait with their own timeout.
    async fn connect(
        &self,
        address: &str,
        transport: &TransportConfig,
    ) -> io::Result<Arc<dyn BackendConnection>>;
}

/// An open transport session to one backend.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Concurrent exchanges this connection can carry.
    fn max_concurrent_exchanges(&self) -> usize {
        1
    }

    /// False once the connection failed or was closed.
    fn is_open(&self) -> bool;

    /// Closes the session. Exchanges still in flight fail.
    fn close(&self);

    /// Writes a request head and returns the exchange to continue it.
    ///
    /// An error here means the backend did not receive a usable request.
    async fn send_request(&self, head: &RequestHead) -> io::Result<Box<dyn UpstreamExchange>>;
}

/// One request/response exchange on a backend connection.
#[async_trait]
pub trait UpstreamExchange: Send {
    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Marks the end of the request body.
    async fn finish_request(&mut self) -> io::Result<()>;

    /// Waits for the final (non-1xx) response head.
    async fn response_head(&mut self) -> io::Result<ResponseHead>;

    /// Next response body chunk, `None` at end of body.
    async fn read_body(&mut self) -> io::Result<Option<Bytes>>;

    /// Whether any response byte has been received.
    fn response_started(&self) -> bool;

    /// Whether the connection can carry another exchange once this one is
    /// dropped.
    fn is_reusable(&self) -> bool;
}
