use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::http::headers::Headers;

/// HTTP request methods.
///
/// Represents the HTTP method/verb of a request. Every method is proxied
/// as-is; `HEAD` additionally tells the transport not to expect a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, typically uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use sentinel_lb::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

/// Request entity as seen by the proxy.
///
/// `Empty` and `Full` bodies can be sent any number of times, so a failed
/// attempt may be retried on another backend. A `Streaming` body is pulled
/// from the client chunk by chunk and stops being replayable as soon as the
/// first chunk has been taken.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Full(Bytes),
    Streaming(BodyStream),
}

/// Client-side half of a streaming request body.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    length: Option<u64>,
    consumed: bool,
}

impl BodyStream {
    /// Next chunk from the client, `None` at end of body.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        let chunk = self.rx.recv().await;
        if chunk.is_some() {
            self.consumed = true;
        }
        chunk
    }

    /// Declared length, when the client announced one.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

impl RequestBody {
    /// Creates a streaming body fed through a bounded channel of `capacity`
    /// chunks. A full channel pauses the producer, which is how backend
    /// backpressure reaches the client.
    pub fn streaming(
        capacity: usize,
        length: Option<u64>,
    ) -> (mpsc::Sender<io::Result<Bytes>>, RequestBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = BodyStream {
            rx,
            length,
            consumed: false,
        };
        (tx, RequestBody::Streaming(stream))
    }

    /// Whether the body can still be sent again in full.
    pub fn is_replayable(&self) -> bool {
        match self {
            RequestBody::Empty | RequestBody::Full(_) => true,
            RequestBody::Streaming(stream) => !stream.is_consumed(),
        }
    }

    /// Body length when known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Full(bytes) => Some(bytes.len() as u64),
            RequestBody::Streaming(stream) => stream.length(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length() == Some(0)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(body: Vec<u8>) -> Self {
        if body.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Full(Bytes::from(body))
        }
    }
}

/// Represents an inbound HTTP request from a client.
///
/// Contains all information extracted from the HTTP request line and headers,
/// plus the address of the client it came from.
#[derive(Debug)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request path/URL (e.g., "/index.html")
    pub path: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Request headers in arrival order
    pub headers: Headers,
    /// Request entity
    pub body: RequestBody,
    /// Client address, when known
    pub peer: Option<SocketAddr>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: RequestBody,
    peer: Option<SocketAddr>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: Headers::new(),
            body: RequestBody::Empty,
            peer: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
            peer: self.peer,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }
}
