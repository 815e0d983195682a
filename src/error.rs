//! Error types for the load balancer
//!
//! Pool and transport failures are classified here so the forwarder can
//! decide between retrying on another host and failing the exchange.
//! None of these escape to the front end: the forwarder always turns them
//! into an HTTP-level outcome.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure to obtain a connection lease from a pool.
///
/// `PoolExhausted` and `Shutdown` are the two flavours of "unavailable".
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    TimedOut(Duration),

    #[error("connection pool wait queue is full")]
    PoolExhausted,

    #[error("connection pool is shut down")]
    Shutdown,

    #[error("failed to connect to {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
}

impl AcquireError {
    /// True for the errors that mean the pool refused to queue the caller.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AcquireError::PoolExhausted | AcquireError::Shutdown)
    }
}

/// No registered host qualifies for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no backend host is available")]
pub struct NoHostsAvailable;

/// Rejected host registration or removal.
#[derive(Debug, Error)]
pub enum HostConfigError {
    #[error("invalid backend address {uri:?}: {reason}")]
    InvalidAddress { uri: String, reason: String },

    #[error("routing token {0:?} is already registered")]
    DuplicateRoute(String),

    #[error("backend {0} is already registered")]
    DuplicateHost(String),

    #[error("unknown backend {0}")]
    UnknownHost(String),

    #[error("transport for {0} is not supported by the configured connector")]
    UnsupportedTransport(String),
}

/// Failure of a single forwarding attempt.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    NoHosts(#[from] NoHostsAvailable),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// `sent` is true once any part of the request reached the backend.
    #[error("failed to send request to backend (request sent: {sent})")]
    RequestSend {
        sent: bool,
        #[source]
        source: io::Error,
    },

    /// `started` is true once any response byte arrived from the backend.
    #[error("backend response failed (response started: {started})")]
    ResponseStream {
        started: bool,
        #[source]
        source: io::Error,
    },

    /// A reused keep-alive connection failed before any response byte
    /// arrived; the backend most likely closed it while it sat idle.
    #[error("pooled backend connection was closed while idle")]
    StaleConnection(#[source] io::Error),

    #[error("client connection failed")]
    Client(#[source] io::Error),
}

impl ForwardError {
    /// Whether the failure happened before anything irreversible, so the
    /// same request may be sent to another host.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForwardError::Acquire(_) | ForwardError::StaleConnection(_) => true,
            ForwardError::RequestSend { sent, .. } => !sent,
            ForwardError::ResponseStream { started, .. } => !started,
            ForwardError::NoHosts(_) | ForwardError::Client(_) => false,
        }
    }

    /// Whether the backend host is to blame for the failure. Local pool
    /// saturation, idle connections the backend timed out, and client-side
    /// errors are not.
    pub fn counts_against_host(&self) -> bool {
        match self {
            ForwardError::Acquire(err) => matches!(
                err,
                AcquireError::Connect { .. } | AcquireError::ConnectTimeout { .. }
            ),
            ForwardError::RequestSend { .. } | ForwardError::ResponseStream { .. } => true,
            ForwardError::NoHosts(_)
            | ForwardError::StaleConnection(_)
            | ForwardError::Client(_) => false,
        }
    }
}
