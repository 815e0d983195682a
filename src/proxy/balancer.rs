//! Load-balancing proxy client
//!
//! Hosts live in an immutable snapshot that is swapped atomically when the
//! set changes, so selection reads never take a lock. Selection honours the
//! request's routing token first; otherwise it walks the eligible hosts
//! round-robin and prefers the one with the fewest exchanges in flight on
//! the current worker.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::{HostConfigError, NoHostsAvailable};
use crate::http::request::Request;
use crate::proxy::client::{ProxyClient, Selection};
use crate::proxy::host::{HealthPolicy, Host, HostOptions, WorkerId};
use crate::proxy::pool::PoolConfig;
use crate::proxy::route::{RouteExtractor, SessionCookieRoute};
use crate::proxy::transport::{Connector, TransportConfig};

/// Spreads exchanges over a set of backend hosts.
pub struct LoadBalancingProxyClient {
    hosts: ArcSwap<Vec<Arc<Host>>>,
    /// Serializes registry writers; readers never touch it
    registry: Mutex<()>,
    cursor: AtomicUsize,
    /// Set once the first host is added; never cleared
    configured: AtomicBool,
    connector: Arc<dyn Connector>,
    route_extractor: Arc<dyn RouteExtractor>,
    health_policy: HealthPolicy,
    max_queued: usize,
}

impl LoadBalancingProxyClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(()),
            cursor: AtomicUsize::new(0),
            configured: AtomicBool::new(false),
            connector,
            route_extractor: Arc::new(SessionCookieRoute::default()),
            health_policy: HealthPolicy::default(),
            max_queued: PoolConfig::default().max_queued,
        }
    }

    /// Builds the balancer and registers every configured backend.
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, HostConfigError> {
        let balancer = &config.balancer;
        let client = Self::new(connector)
            .with_route_extractor(SessionCookieRoute::new(balancer.session_cookie.clone()))
            .with_health_policy(HealthPolicy {
                error_threshold: balancer.error_threshold,
                error_window: Duration::from_secs(balancer.error_window_secs),
                cooldown: Duration::from_secs(balancer.cooldown_secs),
            })
            .with_max_queued(balancer.max_queued_waiters);

        for backend in &config.backends {
            let options = HostOptions {
                name: backend.name.clone(),
                pool: PoolConfig {
                    max_connections: backend.max_connections_per_thread,
                    max_queued: client.max_queued,
                    connect_timeout: Duration::from_millis(backend.connect_timeout_ms),
                    idle_timeout: Duration::from_secs(backend.idle_timeout_secs),
                },
                transport: TransportConfig {
                    tls: false,
                    multiplexed: backend.http2,
                    max_concurrent_streams: backend.max_concurrent_streams,
                },
            };
            client.add_host(&backend.url, backend.route.clone(), options)?;
        }

        Ok(client)
    }

    pub fn with_route_extractor(mut self, extractor: impl RouteExtractor + 'static) -> Self {
        self.route_extractor = Arc::new(extractor);
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    /// Queue bound for pools of hosts added after this call.
    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    /// Registers a backend.
    ///
    /// A URI or non-empty routing token that is already registered is
    /// rejected; live pools are never replaced.
    pub fn add_host(
        &self,
        uri: &str,
        route: impl Into<String>,
        mut options: HostOptions,
    ) -> Result<Arc<Host>, HostConfigError> {
        let route = route.into();
        options.pool.max_queued = self.max_queued;
        let host = Arc::new(Host::new(
            uri,
            route,
            options,
            self.health_policy,
            Arc::clone(&self.connector),
        )?);

        let _writer = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.hosts.load_full();

        if current.iter().any(|h| h.key() == host.key()) {
            return Err(HostConfigError::DuplicateHost(host.key().to_string()));
        }
        if !host.route().is_empty() && current.iter().any(|h| h.route() == host.route()) {
            return Err(HostConfigError::DuplicateRoute(host.route().to_string()));
        }

        let mut next = current.as_ref().clone();
        next.push(Arc::clone(&host));
        self.hosts.store(Arc::new(next));
        self.configured.store(true, Ordering::Release);

        info!(
            backend = host.display_name(),
            route = host.route(),
            hosts = self.hosts.load().len(),
            "Backend added"
        );
        Ok(host)
    }

    /// Takes a backend out of selection. Its in-flight exchanges finish
    /// normally; its pools drain.
    pub fn remove_host(&self, uri: &str) -> Result<Arc<Host>, HostConfigError> {
        let _writer = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.hosts.load_full();

        let position = current
            .iter()
            .position(|h| h.key() == uri || h.uri().as_str() == uri)
            .or_else(|| {
                let key = url::Url::parse(uri).ok().and_then(|u| {
                    Some(format!(
                        "{}://{}:{}",
                        u.scheme(),
                        u.host_str()?,
                        u.port_or_known_default()?
                    ))
                })?;
                current.iter().position(|h| h.key() == key)
            })
            .ok_or_else(|| HostConfigError::UnknownHost(uri.to_string()))?;

        let mut next = current.as_ref().clone();
        let host = next.remove(position);
        self.hosts.store(Arc::new(next));
        host.remove();

        info!(backend = host.display_name(), "Backend removed");
        Ok(host)
    }

    /// Whether any host is registered right now.
    pub fn has_hosts(&self) -> bool {
        !self.hosts.load().is_empty()
    }

    /// Current host snapshot.
    pub fn hosts(&self) -> Arc<Vec<Arc<Host>>> {
        self.hosts.load_full()
    }

    /// Looks up a registered host by routing token.
    pub fn host_for_route(&self, route: &str) -> Option<Arc<Host>> {
        if route.is_empty() {
            return None;
        }
        self.hosts
            .load()
            .iter()
            .find(|h| h.route() == route)
            .cloned()
    }

    /// Closes idle connections past their timeout on `worker`'s pools.
    pub fn purge_idle(&self, worker: WorkerId) -> usize {
        self.hosts
            .load()
            .iter()
            .map(|host| host.purge_idle(worker))
            .sum()
    }

    /// Shuts down every pool of every host. Safe from any thread.
    pub fn shutdown(&self) {
        for host in self.hosts.load().iter() {
            host.shutdown();
        }
    }

    fn is_eligible(host: &Host, worker: WorkerId, excluded: &[String]) -> bool {
        host.is_available()
            && !excluded.iter().any(|key| key == host.key())
            && host.has_capacity(worker)
    }
}

#[async_trait]
impl ProxyClient for LoadBalancingProxyClient {
    fn select_host(
        &self,
        worker: WorkerId,
        request: &Request,
        excluded: &[String],
    ) -> Result<Selection, NoHostsAvailable> {
        let hosts = self.hosts.load();

        if let Some(route) = self.route_extractor.extract(request) {
            match hosts.iter().find(|h| !h.route().is_empty() && h.route() == route) {
                Some(host) if Self::is_eligible(host, worker, excluded) => {
                    trace!(backend = host.display_name(), route = %route, "Sticky session hit");
                    return Ok(Selection::new(Arc::clone(host), worker, true));
                }
                Some(host) => {
                    debug!(
                        backend = host.display_name(),
                        route = %route,
                        state = ?host.state(),
                        "Sticky host unavailable, falling back to load balancing"
                    );
                }
                None => trace!(route = %route, "Unknown routing token"),
            }
        }

        let candidates: Vec<&Arc<Host>> = hosts
            .iter()
            .filter(|h| Self::is_eligible(h, worker, excluded))
            .collect();

        if candidates.is_empty() {
            debug!(excluded = excluded.len(), "No eligible backend hosts");
            return Err(NoHostsAvailable);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let mut best: Option<(&Arc<Host>, usize)> = None;
        for offset in 0..candidates.len() {
            let host = candidates[(start + offset) % candidates.len()];
            let load = host.in_flight(worker);
            if best.is_none_or(|(_, best_load)| load < best_load) {
                best = Some((host, load));
            }
        }

        let (host, load) = best.ok_or(NoHostsAvailable)?;
        trace!(backend = host.display_name(), in_flight = load, "Selected backend");
        Ok(Selection::new(Arc::clone(host), worker, false))
    }

    fn ever_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }
}
