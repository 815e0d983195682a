//! Backend host management
//!
//! A [`Host`] is one backend target. It owns a connection pool per worker,
//! created the first time that worker needs it, and tracks recent failures
//! so a misbehaving backend can be benched for a cooldown period.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::{AcquireError, HostConfigError};
use crate::proxy::pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStats};
use crate::proxy::transport::{Connector, TransportConfig};

/// Identifies the worker (event loop thread) an exchange runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Represents the current state of a backend host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Host is accepting requests
    Up,
    /// Host failed too often recently and is benched until the cooldown ends
    CoolingDown,
    /// Host was removed from the balancer and only drains
    Removed,
}

/// When repeated failures bench a host, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Failures within `error_window` that trigger a cooldown
    pub error_threshold: u32,
    /// Sliding window failures are counted in
    pub error_window: Duration,
    /// How long a benched host stays out of selection
    pub cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            error_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Per-host settings supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Optional host name for logging
    pub name: Option<String>,
    /// Pool limits applied to each worker's pool
    pub pool: PoolConfig,
    /// Multiplexing options; `tls` is derived from the URI scheme
    pub transport: TransportConfig,
}

#[derive(Debug, Default)]
struct HealthRecord {
    failures: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// One backend target with its per-worker connection pools.
pub struct Host {
    uri: Url,
    key: String,
    address: String,
    route: String,
    name: Option<String>,
    transport: TransportConfig,
    pool_config: PoolConfig,
    connector: Arc<dyn Connector>,
    policy: HealthPolicy,
    pools: Mutex<HashMap<WorkerId, ConnectionPool>>,
    removed: AtomicBool,
    health: Mutex<HealthRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Host {
    /// Creates a host from a backend URI such as `http://10.0.0.5:8080`.
    pub fn new(
        uri: &str,
        route: impl Into<String>,
        options: HostOptions,
        policy: HealthPolicy,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, HostConfigError> {
        let invalid = |reason: &str| HostConfigError::InvalidAddress {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        let tls = match parsed.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        let address = format!("{}:{}", host, port);
        let key = format!("{}://{}", parsed.scheme(), address);

        let transport = TransportConfig {
            tls,
            ..options.transport
        };
        if !connector.supports(&transport) {
            return Err(HostConfigError::UnsupportedTransport(key));
        }

        Ok(Self {
            uri: parsed,
            key,
            address,
            route: route.into(),
            name: options.name,
            transport,
            pool_config: options.pool,
            connector,
            policy,
            pools: Mutex::new(HashMap::new()),
            removed: AtomicBool::new(false),
            health: Mutex::new(HealthRecord::default()),
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Normalized identity, `scheme://host:port`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Routing token; empty when the host takes no sticky traffic.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Get a display name for the host (name or key)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    /// The pool serving `worker`, created on first use.
    pub fn pool(&self, worker: WorkerId) -> ConnectionPool {
        let mut pools = lock(&self.pools);
        let pool = pools.entry(worker).or_insert_with(|| {
            tracing::debug!(backend = self.display_name(), %worker, "Creating connection pool");
            ConnectionPool::new(
                self.address.clone(),
                self.transport.clone(),
                Arc::clone(&self.connector),
                self.pool_config.clone(),
            )
        });
        if self.is_removed() {
            pool.shutdown();
        }
        pool.clone()
    }

    fn existing_pool(&self, worker: WorkerId) -> Option<ConnectionPool> {
        lock(&self.pools).get(&worker).cloned()
    }

    /// Acquires a connection from the pool of `worker`.
    pub async fn acquire(
        &self,
        worker: WorkerId,
        wait: Duration,
    ) -> Result<ConnectionLease, AcquireError> {
        if self.is_removed() {
            return Err(AcquireError::Shutdown);
        }
        self.pool(worker).acquire(wait).await
    }

    /// Exchanges in flight on `worker`'s pool.
    pub fn in_flight(&self, worker: WorkerId) -> usize {
        self.existing_pool(worker).map_or(0, |pool| pool.in_flight())
    }

    /// Whether `worker`'s pool would accept another acquire.
    pub fn has_capacity(&self, worker: WorkerId) -> bool {
        self.existing_pool(worker).is_none_or(|pool| pool.has_capacity())
    }

    pub fn pool_stats(&self, worker: WorkerId) -> PoolStats {
        self.existing_pool(worker)
            .map(|pool| pool.stats())
            .unwrap_or_default()
    }

    pub fn state(&self) -> HostState {
        if self.is_removed() {
            return HostState::Removed;
        }
        match lock(&self.health).cooldown_until {
            Some(until) if Instant::now() < until => HostState::CoolingDown,
            _ => HostState::Up,
        }
    }

    /// Check if host is available for new requests
    pub fn is_available(&self) -> bool {
        self.state() == HostState::Up
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Failures recorded inside the current window.
    pub fn recent_failures(&self) -> usize {
        let mut health = lock(&self.health);
        prune(&mut health.failures, self.policy.error_window);
        health.failures.len()
    }

    /// Records a failed attempt against the host.
    pub fn mark_failed(&self) {
        let now = Instant::now();
        let mut health = lock(&self.health);

        if health.cooldown_until.is_some_and(|until| now < until) {
            return;
        }

        prune(&mut health.failures, self.policy.error_window);
        health.failures.push_back(now);

        if health.failures.len() >= self.policy.error_threshold as usize {
            health.cooldown_until = Some(now + self.policy.cooldown);
            health.failures.clear();
            tracing::warn!(
                backend = self.display_name(),
                threshold = self.policy.error_threshold,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "Backend benched after repeated failures"
            );
        }
    }

    /// Records a successful exchange, clearing the failure record.
    pub fn mark_success(&self) {
        let mut health = lock(&self.health);
        health.failures.clear();

        if health.cooldown_until.take().is_some() {
            tracing::info!(backend = self.display_name(), "Backend recovered");
        }
    }

    /// Takes the host out of service. Pools stop accepting work, idle
    /// connections close and in-flight ones close as they finish.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown();
    }

    /// Shuts down every pool of this host.
    pub fn shutdown(&self) {
        let pools: Vec<ConnectionPool> = lock(&self.pools).values().cloned().collect();
        for pool in pools {
            pool.shutdown();
        }
    }

    /// Closes every idle connection in `worker`'s pool.
    pub fn close_idle(&self, worker: WorkerId) -> usize {
        self.existing_pool(worker)
            .map_or(0, |pool| pool.close_idle())
    }

    /// Closes expired idle connections in `worker`'s pool.
    pub fn purge_idle(&self, worker: WorkerId) -> usize {
        self.existing_pool(worker)
            .map_or(0, |pool| pool.purge_expired())
    }
}

fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while failures
        .front()
        .is_some_and(|at| now.duration_since(*at) > window)
    {
        failures.pop_front();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("key", &self.key)
            .field("route", &self.route)
            .field("state", &self.state())
            .finish()
    }
}
