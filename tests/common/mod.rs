//! In-memory backend transport shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_lb::http::headers::Headers;
use sentinel_lb::http::request::{Method, Request, RequestBuilder};
use sentinel_lb::http::response::{ResponseHead, StatusCode};
use sentinel_lb::http::writer::ResponseSink;
use sentinel_lb::proxy::host::WorkerId;
use sentinel_lb::proxy::transport::{
    BackendConnection, Connector, RequestHead, TransportConfig, UpstreamExchange,
};

pub const WORKER: WorkerId = WorkerId(0);

/// How a mock backend treats the next exchanges.
#[derive(Debug, Clone)]
pub enum Behavior {
    Respond { status: u16, body: String },
    RefuseConnect,
    FailSend,
    FailBodyWrite,
    CloseBeforeResponse,
    FailMidBody,
    Stall,
    /// Answers normally on a fresh connection, but has closed any
    /// connection that sat idle since its last exchange
    CloseIdle,
}

/// What a backend received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body_length: Option<u64>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct MockBackend {
    pub address: String,
    behavior: Mutex<Behavior>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockBackend {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            behavior: Mutex::new(Behavior::Respond {
                status: 200,
                body: format!("hello from {}", address),
            }),
            connect_delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Connections successfully opened.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Request heads received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Connector whose backends live in memory, looked up by `host:port`.
#[derive(Debug, Default)]
pub struct MockConnector {
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
    concurrency: usize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(HashMap::new()),
            concurrency: 1,
        })
    }

    /// Connections carry up to `concurrency` exchanges at once.
    pub fn multiplexed(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(HashMap::new()),
            concurrency,
        })
    }

    /// The backend at `address`, created with default behaviour on first use.
    pub fn backend(&self, address: &str) -> Arc<MockBackend> {
        let mut backends = self.backends.lock().unwrap();
        Arc::clone(
            backends
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(MockBackend::new(address))),
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        _transport: &TransportConfig,
    ) -> io::Result<Arc<dyn BackendConnection>> {
        let backend = self.backend(address);

        let delay = *backend.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if matches!(backend.behavior(), Behavior::RefuseConnect) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }

        backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            backend,
            open: Arc::new(AtomicBool::new(true)),
            concurrency: self.concurrency,
            served: AtomicUsize::new(0),
        }))
    }
}

pub struct MockConnection {
    backend: Arc<MockBackend>,
    open: Arc<AtomicBool>,
    concurrency: usize,
    served: AtomicUsize,
}

#[async_trait]
impl BackendConnection for MockConnection {
    fn max_concurrent_exchanges(&self) -> usize {
        self.concurrency
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send_request(&self, head: &RequestHead) -> io::Result<Box<dyn UpstreamExchange>> {
        let behavior = match self.backend.behavior() {
            Behavior::CloseIdle if self.served.fetch_add(1, Ordering::SeqCst) > 0 => {
                Behavior::CloseBeforeResponse
            }
            Behavior::CloseIdle => Behavior::Respond {
                status: 200,
                body: format!("hello from {}", self.backend.address),
            },
            other => other,
        };
        if matches!(behavior, Behavior::FailSend) {
            self.close();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }

        let index = {
            let mut requests = self.backend.requests.lock().unwrap();
            requests.push(RecordedRequest {
                method: head.method.clone(),
                path: head.path.clone(),
                headers: head.headers.clone(),
                body_length: head.body_length,
                body: Vec::new(),
            });
            requests.len() - 1
        };

        Ok(Box::new(MockExchange {
            backend: Arc::clone(&self.backend),
            open: Arc::clone(&self.open),
            index,
            behavior,
            started: false,
            body_sent: false,
            done: false,
        }))
    }
}

struct MockExchange {
    backend: Arc<MockBackend>,
    open: Arc<AtomicBool>,
    index: usize,
    behavior: Behavior,
    started: bool,
    body_sent: bool,
    done: bool,
}

#[async_trait]
impl UpstreamExchange for MockExchange {
    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if matches!(self.behavior, Behavior::FailBodyWrite) {
            self.open.store(false, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reset mid-body"));
        }
        self.backend.requests.lock().unwrap()[self.index]
            .body
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn finish_request(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn response_head(&mut self) -> io::Result<ResponseHead> {
        match &self.behavior {
            Behavior::CloseBeforeResponse => {
                self.open.store(false, Ordering::SeqCst);
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "closed before response",
                ))
            }
            Behavior::Stall => std::future::pending().await,
            Behavior::FailMidBody => {
                self.started = true;
                let mut head = ResponseHead::new(StatusCode::OK);
                head.headers.append("Content-Length", "100");
                Ok(head)
            }
            Behavior::Respond { status, body } => {
                self.started = true;
                let status = StatusCode::from_u16(*status).unwrap();
                let mut head = ResponseHead::new(status);
                head.headers.append("Content-Length", body.len().to_string());
                head.headers.append("X-Backend", self.backend.address.clone());
                head.headers.append("Connection", "keep-alive");
                Ok(head)
            }
            other => panic!("no response for {:?}", other),
        }
    }

    async fn read_body(&mut self) -> io::Result<Option<Bytes>> {
        match &self.behavior {
            Behavior::FailMidBody if !self.body_sent => {
                self.body_sent = true;
                Ok(Some(Bytes::from_static(b"partial")))
            }
            Behavior::FailMidBody => {
                self.open.store(false, Ordering::SeqCst);
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
            Behavior::Respond { body, .. } if !self.body_sent => {
                self.body_sent = true;
                Ok(Some(Bytes::from(body.clone())))
            }
            _ => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn response_started(&self) -> bool {
        self.started
    }

    fn is_reusable(&self) -> bool {
        self.done && self.open.load(Ordering::SeqCst)
    }
}

/// Response sink that records everything written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub head: Option<ResponseHead>,
    pub body: Vec<u8>,
    pub finished: bool,
    pub aborted: bool,
    /// Every write fails, as if the client went away
    pub fail_writes: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|head| head.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head
            .as_ref()
            .and_then(|head| head.headers.get(name))
            .map(str::to_string)
    }

    fn check(&self) -> io::Result<()> {
        if self.fail_writes {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn send_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.check()?;
        self.head = Some(head.clone());
        Ok(())
    }

    async fn send_body(&mut self, chunk: Bytes) -> io::Result<()> {
        self.check()?;
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.check()?;
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.aborted = true;
    }

    fn is_committed(&self) -> bool {
        self.head.is_some()
    }
}

pub fn get(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .build()
        .unwrap()
}

/// A GET carrying a session cookie routed to `route`.
pub fn sticky_get(path: &str, route: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .header("Cookie", format!("JSESSIONID=8f2c1e9a.{}", route))
        .build()
        .unwrap()
}

/// Lets spawned tasks run until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
