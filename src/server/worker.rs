//! Worker threads
//!
//! Each worker is an OS thread running its own single-threaded runtime.
//! Accepted sockets are handed to a worker and served there to completion,
//! so every backend pool a connection touches belongs to that worker.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::http::connection::Connection;
use crate::proxy::balancer::LoadBalancingProxyClient;
use crate::proxy::forwarder::ExchangeForwarder;
use crate::proxy::host::WorkerId;

struct WorkerHandle {
    id: WorkerId,
    sockets: mpsc::UnboundedSender<std::net::TcpStream>,
    thread: JoinHandle<()>,
}

/// A fixed set of event-loop threads.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Starts `count` workers forwarding through `forwarder`. Each worker
    /// purges its expired idle backend connections every `purge_interval`.
    pub fn start(
        count: usize,
        forwarder: ExchangeForwarder,
        balancer: Arc<LoadBalancingProxyClient>,
        purge_interval: Duration,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);

        for index in 0..count.max(1) {
            let id = WorkerId(index);
            let (tx, rx) = mpsc::unbounded_channel();
            let forwarder = forwarder.clone();
            let balancer = Arc::clone(&balancer);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .with_context(|| format!("Failed to build runtime for {}", id))?;

            let thread = std::thread::Builder::new()
                .name(format!("sentinel-{}", id))
                .spawn(move || {
                    runtime.block_on(run_worker(id, rx, forwarder, balancer, purge_interval));
                    debug!(%id, "Worker stopped");
                })
                .with_context(|| format!("Failed to spawn {}", id))?;

            workers.push(WorkerHandle {
                id,
                sockets: tx,
                thread,
            });
        }

        info!(workers = workers.len(), "Worker threads started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hands an accepted socket to the next worker, round-robin.
    pub fn dispatch(&self, socket: std::net::TcpStream) -> Result<WorkerId> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        worker
            .sockets
            .send(socket)
            .map_err(|_| anyhow::anyhow!("{} is no longer running", worker.id))?;
        Ok(worker.id)
    }

    /// Stops accepting work and waits for every worker thread to exit.
    /// Connections still being served are dropped.
    pub fn shutdown(self) {
        let mut threads = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            drop(worker.sockets);
            threads.push((worker.id, worker.thread));
        }
        for (id, thread) in threads {
            if thread.join().is_err() {
                error!(%id, "Worker thread panicked");
            }
        }
        info!("Worker threads stopped");
    }
}

async fn run_worker(
    id: WorkerId,
    mut sockets: mpsc::UnboundedReceiver<std::net::TcpStream>,
    forwarder: ExchangeForwarder,
    balancer: Arc<LoadBalancingProxyClient>,
    purge_interval: Duration,
) {
    let mut purge = tokio::time::interval(purge_interval);
    purge.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            socket = sockets.recv() => {
                let Some(socket) = socket else {
                    break;
                };
                let stream = match TcpStream::from_std(socket) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(worker = %id, error = %e, "Failed to register client socket");
                        continue;
                    }
                };
                let peer = match stream.peer_addr() {
                    Ok(peer) => peer,
                    Err(e) => {
                        debug!(worker = %id, error = %e, "Client gone before dispatch");
                        continue;
                    }
                };

                let forwarder = forwarder.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(stream, peer, id, forwarder);
                    if let Err(e) = conn.run().await {
                        tracing::error!("Connection error from {}: {}", peer, e);
                    }
                });
            }
            _ = purge.tick() => {
                let closed = balancer.purge_idle(id);
                if closed > 0 {
                    debug!(worker = %id, closed, "Purged idle backend connections");
                }
            }
        }
    }
}
