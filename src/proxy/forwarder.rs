//! Exchange forwarding
//!
//! Relays one inbound exchange to a backend chosen by a [`ProxyClient`] and
//! streams the response back through a [`ResponseSink`].
//!
//! ```text
//! Selecting -> Connecting -> SendingRequest -> AwaitingResponse -> StreamingResponse -> Done
//!     ^            |               |                  |
//!     +------------+---------------+------------------+   (retryable failure)
//! ```
//!
//! Anything that fails before the backend saw the request, or before it sent
//! a single response byte, is retried on a host that has not been tried yet,
//! as long as the request body can be sent again. A reused keep-alive
//! connection that turns out to be dead gets one more try on a fresh
//! connection to the same host first. Everything else ends the
//! exchange with a fixed response, or aborts the client stream once the
//! response head is on its way.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ForwardError;
use crate::http::request::{Request, RequestBody};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseSink;
use crate::proxy::client::{AttemptOutcome, ProxyClient, Selection};
use crate::proxy::host::WorkerId;
use crate::proxy::transport::{RequestHead, UpstreamExchange};

/// Relay chunk size for request bodies
const RELAY_BUFFER_SIZE: usize = 8192;

/// Forwarding behaviour shared by every exchange.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Upper bound on attempts per exchange, whatever the host count
    pub max_attempts: usize,
    /// How long an attempt may wait for a pooled connection
    pub queue_timeout: Duration,
    /// Sent when no backend could take the exchange
    pub no_backend_response: Response,
    /// Replace the `Host` header with the backend's address
    pub rewrite_host: bool,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            queue_timeout: Duration::from_secs(10),
            no_backend_response: Response::service_unavailable(),
            rewrite_host: false,
        }
    }
}

/// Where an exchange currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Selecting,
    Connecting,
    SendingRequest,
    AwaitingResponse,
    StreamingResponse,
    Done,
    Failed,
}

/// Per-exchange bookkeeping across attempts.
#[derive(Debug)]
pub struct ExchangeAttempt {
    tried: Vec<String>,
    attempts: usize,
    state: ForwardState,
}

impl ExchangeAttempt {
    fn new() -> Self {
        Self {
            tried: Vec::new(),
            attempts: 0,
            state: ForwardState::Selecting,
        }
    }

    /// Keys of the hosts already tried, in order.
    pub fn tried(&self) -> &[String] {
        &self.tried
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }
}

/// How a forwarded exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The backend response was relayed in full
    Completed { status: StatusCode, attempts: usize },
    /// A proxy-generated error response was sent instead
    Failed { status: StatusCode, attempts: usize },
    /// The client stream was cut off; the client connection must close
    Aborted { attempts: usize },
}

impl ForwardOutcome {
    pub fn attempts(&self) -> usize {
        match self {
            ForwardOutcome::Completed { attempts, .. }
            | ForwardOutcome::Failed { attempts, .. }
            | ForwardOutcome::Aborted { attempts } => *attempts,
        }
    }

    /// Status the client received, if it received a complete response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ForwardOutcome::Completed { status, .. } | ForwardOutcome::Failed { status, .. } => {
                Some(*status)
            }
            ForwardOutcome::Aborted { .. } => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ForwardOutcome::Aborted { .. })
    }
}

/// Drives exchanges through a [`ProxyClient`].
#[derive(Clone)]
pub struct ExchangeForwarder {
    client: Arc<dyn ProxyClient>,
    settings: ForwarderSettings,
}

impl ExchangeForwarder {
    pub fn new(client: Arc<dyn ProxyClient>, settings: ForwarderSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &Arc<dyn ProxyClient> {
        &self.client
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    /// Forwards `request` and writes the outcome to `sink`.
    ///
    /// Never fails: transport and pool errors become an HTTP-level outcome.
    /// Dropping the returned future cancels the exchange; any held
    /// connection is discarded.
    pub async fn forward(
        &self,
        worker: WorkerId,
        request: &mut Request,
        sink: &mut dyn ResponseSink,
    ) -> ForwardOutcome {
        let mut exchange = ExchangeAttempt::new();

        loop {
            exchange.state = ForwardState::Selecting;
            let selection = match self.client.select_host(worker, request, &exchange.tried) {
                Ok(selection) => selection,
                Err(no_hosts) => {
                    return self
                        .fail(&mut exchange, ForwardError::NoHosts(no_hosts), request, sink)
                        .await;
                }
            };

            exchange.attempts += 1;
            exchange.tried.push(selection.host().key().to_string());

            debug!(
                backend = selection.host().display_name(),
                attempt = exchange.attempts,
                affinity = selection.is_affinity(),
                method = ?request.method,
                path = %request.path,
                "Forwarding request to backend"
            );

            let mut result = self
                .attempt(&selection, request, sink, &mut exchange.state)
                .await;
            if let Err(ForwardError::StaleConnection(source)) = &result {
                if request.body.is_replayable() && !sink.is_committed() {
                    let closed = selection.host().close_idle(selection.worker());
                    debug!(
                        backend = selection.host().display_name(),
                        error = %source,
                        closed_idle = closed,
                        "Backend dropped a pooled connection, retrying on a fresh one"
                    );
                    result = self
                        .attempt(&selection, request, sink, &mut exchange.state)
                        .await;
                }
            }

            match result {
                Ok(status) => {
                    exchange.state = ForwardState::Done;
                    self.client
                        .record_outcome(&selection, AttemptOutcome::Success);

                    info!(
                        backend = selection.host().display_name(),
                        status = status.as_u16(),
                        method = ?request.method,
                        path = %request.path,
                        attempt = exchange.attempts,
                        "Request forwarded successfully"
                    );

                    return ForwardOutcome::Completed {
                        status,
                        attempts: exchange.attempts,
                    };
                }
                Err(err) => {
                    if err.counts_against_host() {
                        self.client
                            .record_outcome(&selection, AttemptOutcome::Failure);
                    }

                    let retry = err.is_retryable()
                        && request.body.is_replayable()
                        && !sink.is_committed()
                        && exchange.attempts < self.settings.max_attempts;

                    if !retry {
                        warn!(
                            backend = selection.host().display_name(),
                            error = %err,
                            state = ?exchange.state,
                            method = ?request.method,
                            path = %request.path,
                            attempt = exchange.attempts,
                            "Failed to proxy request to backend"
                        );
                        return self.fail(&mut exchange, err, request, sink).await;
                    }

                    warn!(
                        backend = selection.host().display_name(),
                        error = %err,
                        state = ?exchange.state,
                        method = ?request.method,
                        path = %request.path,
                        attempt = exchange.attempts,
                        "Failed to proxy request to backend, will retry with another"
                    );
                }
            }
        }
    }

    /// One attempt against the selected host. The lease is released or
    /// discarded before this returns.
    async fn attempt(
        &self,
        selection: &Selection,
        request: &mut Request,
        sink: &mut dyn ResponseSink,
        state: &mut ForwardState,
    ) -> Result<StatusCode, ForwardError> {
        *state = ForwardState::Connecting;
        let lease = self
            .client
            .connect(selection, self.settings.queue_timeout)
            .await?;

        *state = ForwardState::SendingRequest;
        let reused = lease.is_reused();
        let head = self.request_head(request, selection);
        let mut upstream = match lease.connection().send_request(&head).await {
            Ok(upstream) => upstream,
            Err(source) => {
                lease.discard();
                return Err(if reused {
                    ForwardError::StaleConnection(source)
                } else {
                    ForwardError::RequestSend {
                        sent: false,
                        source,
                    }
                });
            }
        };

        if let Err(err) = send_body(upstream.as_mut(), &mut request.body).await {
            drop(upstream);
            lease.discard();
            return Err(err);
        }

        *state = ForwardState::AwaitingResponse;
        let mut response_head = match upstream.response_head().await {
            Ok(head) => head,
            Err(source) => {
                let started = upstream.response_started();
                drop(upstream);
                lease.discard();
                return Err(if reused && !started {
                    ForwardError::StaleConnection(source)
                } else {
                    ForwardError::ResponseStream { started, source }
                });
            }
        };

        *state = ForwardState::StreamingResponse;
        response_head.headers.strip_hop_by_hop();
        let status = response_head.status;

        let relayed = match sink.send_head(&response_head).await {
            Ok(()) => relay_body(upstream.as_mut(), sink).await,
            Err(e) => Err(ForwardError::Client(e)),
        };

        let reusable = relayed.is_ok() && upstream.is_reusable();
        drop(upstream);
        if reusable {
            lease.release();
        } else {
            lease.discard();
        }

        relayed.map(|()| status)
    }

    /// Builds the head sent to the backend from the inbound request.
    fn request_head(&self, request: &Request, selection: &Selection) -> RequestHead {
        let mut headers = request.headers.clone();
        headers.strip_hop_by_hop();
        headers.remove("Content-Length");

        if let Some(peer) = request.peer {
            let client_ip = peer.ip().to_string();
            let forwarded_for = match headers.get("X-Forwarded-For") {
                Some(existing) => format!("{}, {}", existing, client_ip),
                None => client_ip,
            };
            headers.insert("X-Forwarded-For", forwarded_for);
        }
        if !headers.contains("X-Forwarded-Host") {
            if let Some(host) = request.header("Host") {
                let host = host.to_string();
                headers.insert("X-Forwarded-Host", host);
            }
        }
        if !headers.contains("X-Forwarded-Proto") {
            headers.insert("X-Forwarded-Proto", "http");
        }
        if self.settings.rewrite_host {
            headers.insert("Host", selection.host().address());
        }

        RequestHead {
            method: request.method.clone(),
            path: request.path.clone(),
            headers,
            body_length: request.body.length(),
        }
    }

    /// Ends the exchange without a relayed response.
    async fn fail(
        &self,
        exchange: &mut ExchangeAttempt,
        err: ForwardError,
        request: &Request,
        sink: &mut dyn ResponseSink,
    ) -> ForwardOutcome {
        exchange.state = ForwardState::Failed;
        let attempts = exchange.attempts;

        if sink.is_committed() || matches!(err, ForwardError::Client(_)) {
            debug!(
                error = %err,
                method = ?request.method,
                path = %request.path,
                "Aborting client stream"
            );
            sink.abort().await;
            return ForwardOutcome::Aborted { attempts };
        }

        let response = match &err {
            ForwardError::NoHosts(_) if attempts == 0 && !self.client.ever_configured() => {
                Response::bad_gateway()
            }
            ForwardError::NoHosts(_) | ForwardError::Acquire(_) => {
                self.settings.no_backend_response.clone()
            }
            _ => Response::bad_gateway(),
        };

        error!(
            status = response.status.as_u16(),
            error = %err,
            method = ?request.method,
            path = %request.path,
            attempts,
            "All backend attempts failed"
        );

        match write_response(sink, &response).await {
            Ok(()) => ForwardOutcome::Failed {
                status: response.status,
                attempts,
            },
            Err(e) => {
                debug!(error = %e, "Failed to write error response to client");
                sink.abort().await;
                ForwardOutcome::Aborted { attempts }
            }
        }
    }
}

async fn send_body(
    upstream: &mut dyn UpstreamExchange,
    body: &mut RequestBody,
) -> Result<(), ForwardError> {
    let sent = |source| ForwardError::RequestSend { sent: true, source };

    match body {
        RequestBody::Empty => {}
        RequestBody::Full(bytes) => {
            for chunk in bytes.chunks(RELAY_BUFFER_SIZE) {
                upstream.write_body(chunk).await.map_err(sent)?;
            }
        }
        RequestBody::Streaming(stream) => {
            while let Some(chunk) = stream.next_chunk().await {
                let chunk = chunk.map_err(ForwardError::Client)?;
                for piece in chunk.chunks(RELAY_BUFFER_SIZE) {
                    upstream.write_body(piece).await.map_err(sent)?;
                }
            }
        }
    }

    upstream.finish_request().await.map_err(sent)
}

async fn relay_body(
    upstream: &mut dyn UpstreamExchange,
    sink: &mut dyn ResponseSink,
) -> Result<(), ForwardError> {
    loop {
        match upstream.read_body().await {
            Ok(Some(chunk)) => sink.send_body(chunk).await.map_err(ForwardError::Client)?,
            Ok(None) => break,
            Err(source) => {
                return Err(ForwardError::ResponseStream {
                    started: true,
                    source,
                });
            }
        }
    }
    sink.finish().await.map_err(ForwardError::Client)
}

async fn write_response(sink: &mut dyn ResponseSink, response: &Response) -> std::io::Result<()> {
    sink.send_head(&response.head()).await?;
    if !response.body.is_empty() {
        sink.send_body(Bytes::from(response.body.clone())).await?;
    }
    sink.finish().await
}
