//! Reverse proxy functionality
//!
//! This module implements the load-balancing core: backend hosts and their
//! per-worker connection pools, host selection, and the forwarder that
//! relays exchanges and decides when to retry.

pub mod balancer;
pub mod client;
pub mod forwarder;
pub mod host;
pub mod http1;
pub mod pool;
pub mod route;
pub mod transport;

pub use balancer::LoadBalancingProxyClient;
pub use client::{AttemptOutcome, ProxyClient, Selection, SingleHostProxyClient};
pub use forwarder::{ExchangeForwarder, ForwardOutcome, ForwardState, ForwarderSettings};
pub use host::{HealthPolicy, Host, HostOptions, HostState, WorkerId};
pub use http1::Http1Connector;
pub use pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStats};
pub use route::{RouteExtractor, SessionCookieRoute};
pub use transport::{BackendConnection, Connector, RequestHead, TransportConfig, UpstreamExchange};
