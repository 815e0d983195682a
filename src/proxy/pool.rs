//! Connection pooling for one backend host on one worker
//!
//! A pool owns a bounded set of connections to a single host. Callers get a
//! [`ConnectionLease`] which they either `release` (connection is healthy and
//! goes back to the pool) or `discard` (connection is broken). Dropping a
//! lease discards it, so an exchange cancelled mid-flight never leaks a
//! checked-out connection.
//!
//! When every connection is busy, callers queue FIFO. A released connection
//! is handed straight to the oldest waiter while the pool lock is held, so it
//! is never observably idle in between.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::AcquireError;
use crate::proxy::transport::{BackendConnection, Connector, TransportConfig};

/// Limits for a single pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections, including ones being opened
    pub max_connections: usize,
    /// Maximum callers waiting for a connection
    pub max_queued: usize,
    /// Bound on opening one connection
    pub connect_timeout: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_queued: 64,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub opening: usize,
    pub queued: usize,
    pub shutdown: bool,
}

struct Slot {
    conn: Arc<dyn BackendConnection>,
    capacity: usize,
    in_flight: usize,
    idle_since: Instant,
    /// Has been checked out and returned before
    used: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    slots: BTreeMap<u64, Slot>,
    opening: usize,
    waiters: VecDeque<Waiter>,
    next_slot: u64,
    next_waiter: u64,
    shutdown: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.slots.len() + self.opening
    }

    /// Checks out spare capacity on an open connection.
    fn checkout(&mut self) -> Option<Checkout> {
        self.slots
            .retain(|_, slot| slot.in_flight > 0 || slot.conn.is_open());

        let (id, slot) = self
            .slots
            .iter_mut()
            .find(|(_, slot)| slot.in_flight < slot.capacity && slot.conn.is_open())?;
        slot.in_flight += 1;
        Some(Checkout {
            id: *id,
            conn: Arc::clone(&slot.conn),
            reused: slot.used,
        })
    }

    /// Removes every connection with nothing in flight.
    fn take_idle(&mut self) -> Vec<Arc<dyn BackendConnection>> {
        let idle: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.in_flight == 0)
            .map(|(id, _)| *id)
            .collect();
        idle.into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .map(|slot| slot.conn)
            .collect()
    }

    /// Removes idle connections that expired or died.
    fn purge_expired(&mut self, idle_timeout: Duration) -> Vec<Arc<dyn BackendConnection>> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.in_flight == 0
                    && (!slot.conn.is_open()
                        || now.duration_since(slot.idle_since) >= idle_timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .map(|slot| slot.conn)
            .collect()
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// One checked-out share of a connection.
struct Checkout {
    id: u64,
    conn: Arc<dyn BackendConnection>,
    reused: bool,
}

enum GrantKind {
    /// Capacity on an existing connection, already counted as in flight
    Checkout(Checkout),
    /// Permission to open a connection, already counted as opening
    Open,
}

/// What a queued waiter receives. Returns its content to the pool if it is
/// dropped unused, e.g. when the waiter was cancelled after the handoff.
struct Grant {
    shared: Arc<PoolShared>,
    kind: Option<GrantKind>,
}

impl Grant {
    fn new(shared: &Arc<PoolShared>, kind: GrantKind) -> Self {
        Self {
            shared: Arc::clone(shared),
            kind: Some(kind),
        }
    }

    /// Takes the content without running the drop handling. Must be used
    /// whenever the pool lock is already held.
    fn take(mut self) -> Option<GrantKind> {
        self.kind.take()
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        match self.kind.take() {
            Some(GrantKind::Checkout(checkout)) => self.shared.finish_checkout(checkout.id, true),
            Some(GrantKind::Open) => self.shared.abandon_open(),
            None => {}
        }
    }
}

struct PoolShared {
    address: String,
    transport: TransportConfig,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves queued waiters, oldest first, while capacity allows.
    /// Called with the state lock held.
    fn dispatch(self: &Arc<Self>, state: &mut PoolState) {
        loop {
            state.waiters.retain(|w| !w.tx.is_closed());
            if state.waiters.is_empty() {
                return;
            }

            let kind = if let Some(checkout) = state.checkout() {
                GrantKind::Checkout(checkout)
            } else if !state.shutdown && state.total() < self.config.max_connections {
                state.opening += 1;
                GrantKind::Open
            } else {
                return;
            };

            let Some(waiter) = state.waiters.pop_front() else {
                return;
            };

            trace!(backend = %self.address, waiter = waiter.id, "Handing pool capacity to waiter");

            if let Err(grant) = waiter.tx.send(Grant::new(self, kind)) {
                // Waiter vanished after the closed check; undo in place.
                match grant.take() {
                    Some(GrantKind::Checkout(checkout)) => {
                        if let Some(slot) = state.slots.get_mut(&checkout.id) {
                            slot.in_flight -= 1;
                        }
                    }
                    Some(GrantKind::Open) => state.opening -= 1,
                    None => {}
                }
            }
        }
    }

    /// Ends one checkout of connection `id`.
    fn finish_checkout(self: &Arc<Self>, id: u64, reusable: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let remove = match state.slots.get_mut(&id) {
            Some(slot) => {
                debug_assert!(slot.in_flight > 0, "connection {id} was not checked out");
                slot.in_flight = slot.in_flight.saturating_sub(1);
                slot.idle_since = Instant::now();
                slot.used = true;
                !reusable || !slot.conn.is_open() || (state.shutdown && slot.in_flight == 0)
            }
            // Already discarded through another exchange on the same connection
            None => false,
        };

        if remove {
            if let Some(slot) = state.slots.remove(&id) {
                slot.conn.close();
                debug!(
                    backend = %self.address,
                    connection = id,
                    reusable,
                    "Closed backend connection"
                );
            }
        }

        self.dispatch(state);
    }

    fn abandon_open(self: &Arc<Self>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.opening = state.opening.saturating_sub(1);
        self.dispatch(state);
    }
}

enum Next {
    Ready(ConnectionLease),
    Open(Grant),
    Wait(u64, oneshot::Receiver<Grant>),
}

/// Bounded pool of connections to one backend host.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        address: impl Into<String>,
        transport: TransportConfig,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                address: address.into(),
                transport,
                connector,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Backend address this pool connects to.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Obtains a connection lease.
    ///
    /// Reuses an idle connection, opens a new one while under the limit, or
    /// waits in line for up to `wait`. Fails with `PoolExhausted` when the
    /// line is full and `Shutdown` once the pool is shut down.
    pub async fn acquire(&self, wait: Duration) -> Result<ConnectionLease, AcquireError> {
        let shared = &self.shared;

        let next = {
            let mut guard = shared.lock();
            let state = &mut *guard;

            if state.shutdown {
                return Err(AcquireError::Shutdown);
            }

            for conn in state.purge_expired(shared.config.idle_timeout) {
                conn.close();
            }
            state.waiters.retain(|w| !w.tx.is_closed());

            if !state.waiters.is_empty() {
                Self::enqueue(shared, state)?
            } else if let Some(checkout) = state.checkout() {
                trace!(backend = %shared.address, connection = checkout.id, "Reusing pooled connection");
                Next::Ready(ConnectionLease::new(shared, checkout))
            } else if state.total() < shared.config.max_connections {
                state.opening += 1;
                Next::Open(Grant::new(shared, GrantKind::Open))
            } else {
                Self::enqueue(shared, state)?
            }
        };

        match next {
            Next::Ready(lease) => Ok(lease),
            Next::Open(grant) => self.open(grant).await,
            Next::Wait(id, rx) => self.wait(id, rx, wait).await,
        }
    }

    fn enqueue(shared: &PoolShared, state: &mut PoolState) -> Result<Next, AcquireError> {
        if state.waiters.len() >= shared.config.max_queued {
            debug!(
                backend = %shared.address,
                queued = state.waiters.len(),
                "Connection pool wait queue is full"
            );
            return Err(AcquireError::PoolExhausted);
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(Waiter { id, tx });

        trace!(
            backend = %shared.address,
            waiter = id,
            queued = state.waiters.len(),
            "Waiting for a pooled connection"
        );
        Ok(Next::Wait(id, rx))
    }

    async fn wait(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Grant>,
        wait: Duration,
    ) -> Result<ConnectionLease, AcquireError> {
        let grant = match timeout(wait, &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => return Err(AcquireError::Shutdown),
            Err(_) => {
                let removed = self.shared.lock().remove_waiter(id);
                if removed {
                    debug!(backend = %self.shared.address, waiter = id, "Timed out waiting for a pooled connection");
                    return Err(AcquireError::TimedOut(wait));
                }

                // The handoff raced the deadline; take what was handed over.
                match rx.try_recv() {
                    Ok(grant) => grant,
                    Err(TryRecvError::Closed) => return Err(AcquireError::Shutdown),
                    Err(TryRecvError::Empty) => return Err(AcquireError::TimedOut(wait)),
                }
            }
        };

        self.redeem(grant).await
    }

    async fn redeem(&self, mut grant: Grant) -> Result<ConnectionLease, AcquireError> {
        match grant.kind.take() {
            Some(GrantKind::Checkout(checkout)) => Ok(ConnectionLease::new(&self.shared, checkout)),
            Some(GrantKind::Open) => {
                grant.kind = Some(GrantKind::Open);
                self.open(grant).await
            }
            None => Err(AcquireError::Shutdown),
        }
    }

    /// Opens a connection under an `Open` grant. If this future is dropped
    /// mid-connect, the grant gives the slot back.
    async fn open(&self, grant: Grant) -> Result<ConnectionLease, AcquireError> {
        let shared = &self.shared;
        let connect_timeout = shared.config.connect_timeout;

        let conn = match timeout(
            connect_timeout,
            shared.connector.connect(&shared.address, &shared.transport),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                warn!(backend = %shared.address, error = %source, "Failed to open backend connection");
                return Err(AcquireError::Connect {
                    address: shared.address.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(
                    backend = %shared.address,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "Timed out opening backend connection"
                );
                return Err(AcquireError::ConnectTimeout {
                    address: shared.address.clone(),
                    timeout: connect_timeout,
                });
            }
        };

        let mut guard = shared.lock();
        let state = &mut *guard;
        let _ = grant.take();
        state.opening = state.opening.saturating_sub(1);

        if state.shutdown {
            conn.close();
            return Err(AcquireError::Shutdown);
        }

        let id = state.next_slot;
        state.next_slot += 1;
        let capacity = conn
            .max_concurrent_exchanges()
            .min(shared.transport.exchange_capacity())
            .max(1);
        state.slots.insert(
            id,
            Slot {
                conn: Arc::clone(&conn),
                capacity,
                in_flight: 1,
                idle_since: Instant::now(),
                used: false,
            },
        );

        debug!(
            backend = %shared.address,
            connection = id,
            open = state.slots.len(),
            capacity,
            "Opened backend connection"
        );

        // Spare multiplexed capacity can serve queued callers right away
        shared.dispatch(state);

        Ok(ConnectionLease::new(
            shared,
            Checkout {
                id,
                conn,
                reused: false,
            },
        ))
    }

    /// Returns a healthy connection, handing it to the oldest waiter if any.
    ///
    /// # Panics
    ///
    /// If the lease belongs to a different pool.
    pub fn release(&self, lease: ConnectionLease) {
        assert!(
            Arc::ptr_eq(&self.shared, &lease.shared),
            "lease released to a pool that does not own it"
        );
        lease.release();
    }

    /// Drops a broken connection from the pool and lets a waiter open a
    /// replacement.
    ///
    /// # Panics
    ///
    /// If the lease belongs to a different pool.
    pub fn discard(&self, lease: ConnectionLease) {
        assert!(
            Arc::ptr_eq(&self.shared, &lease.shared),
            "lease discarded to a pool that does not own it"
        );
        lease.discard();
    }

    /// Stops the pool. Queued callers fail, idle connections close now and
    /// checked-out ones close when they come back. Safe to call repeatedly
    /// and from any thread.
    pub fn shutdown(&self) {
        let (waiters, closed) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.shutdown {
                return;
            }
            state.shutdown = true;

            let closed = state.take_idle();
            (std::mem::take(&mut state.waiters), closed)
        };

        let failed = waiters.len();
        // Dropping the senders fails every waiter
        drop(waiters);
        for conn in &closed {
            conn.close();
        }

        info!(
            backend = %self.shared.address,
            failed_waiters = failed,
            closed = closed.len(),
            "Connection pool shut down"
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Closes idle connections past the idle timeout. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let closed = self.shared.lock().purge_expired(self.shared.config.idle_timeout);
        for conn in &closed {
            conn.close();
        }
        if !closed.is_empty() {
            debug!(backend = %self.shared.address, closed = closed.len(), "Closed idle backend connections");
        }
        closed.len()
    }

    /// Closes every idle connection, whatever its age.
    pub fn close_idle(&self) -> usize {
        let closed = self.shared.lock().take_idle();
        for conn in &closed {
            conn.close();
        }
        closed.len()
    }

    /// Whether an acquire would be accepted right now (served, opened, or
    /// queued).
    pub fn has_capacity(&self) -> bool {
        let state = self.shared.lock();
        !state.shutdown
            && (state
                .slots
                .values()
                .any(|slot| slot.in_flight < slot.capacity && slot.conn.is_open())
                || state.total() < self.shared.config.max_connections
                || state.waiters.len() < self.shared.config.max_queued)
    }

    /// Exchanges currently holding a lease.
    pub fn in_flight(&self) -> usize {
        self.shared
            .lock()
            .slots
            .values()
            .map(|slot| slot.in_flight)
            .sum()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            open: state.slots.len(),
            idle: state.slots.values().filter(|s| s.in_flight == 0).count(),
            in_flight: state.slots.values().map(|s| s.in_flight).sum(),
            opening: state.opening,
            queued: state.waiters.len(),
            shutdown: state.shutdown,
        }
    }
}

/// Exclusive claim on one pooled connection (or on one exchange slot of a
/// multiplexed connection).
///
/// Not `Clone`; `release` and `discard` consume it. Dropping it without
/// either discards the connection.
pub struct ConnectionLease {
    shared: Arc<PoolShared>,
    id: u64,
    conn: Arc<dyn BackendConnection>,
    reused: bool,
    finished: bool,
}

impl ConnectionLease {
    fn new(shared: &Arc<PoolShared>, checkout: Checkout) -> Self {
        Self {
            shared: Arc::clone(shared),
            id: checkout.id,
            conn: checkout.conn,
            reused: checkout.reused,
            finished: false,
        }
    }

    /// Whether the connection already carried an earlier exchange, so the
    /// backend may have closed it while it sat idle.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Pool-local connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn connection(&self) -> &Arc<dyn BackendConnection> {
        &self.conn
    }

    /// Returns the connection for reuse.
    pub fn release(mut self) {
        self.finished = true;
        self.shared.finish_checkout(self.id, true);
    }

    /// Closes the connection and removes it from the pool.
    pub fn discard(mut self) {
        self.finished = true;
        self.shared.finish_checkout(self.id, false);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.finished {
            trace!(
                backend = %self.shared.address,
                connection = self.id,
                "Connection lease dropped without release, discarding"
            );
            self.shared.finish_checkout(self.id, false);
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("backend", &self.shared.address)
            .field("id", &self.id)
            .finish()
    }
}
