//! The contract between the forwarder and whatever picks backends
//!
//! Selection and connection are separate steps: `select_host` returns a
//! [`Selection`] the caller may inspect (or rewrite the request against)
//! before redeeming it with `connect`. Dropping the `connect` future cancels
//! the acquisition.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AcquireError, NoHostsAvailable};
use crate::http::request::Request;
use crate::proxy::host::{Host, WorkerId};
use crate::proxy::pool::ConnectionLease;

/// Opaque result of host selection, redeemed by [`ProxyClient::connect`].
#[derive(Debug, Clone)]
pub struct Selection {
    host: Arc<Host>,
    worker: WorkerId,
    affinity: bool,
}

impl Selection {
    pub fn new(host: Arc<Host>, worker: WorkerId, affinity: bool) -> Self {
        Self {
            host,
            worker,
            affinity,
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Whether the host was chosen through the request's routing token.
    pub fn is_affinity(&self) -> bool {
        self.affinity
    }
}

/// How an attempt against a selected host ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Picks backends for the forwarder and hands out connections to them.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Chooses a host for `request` on `worker`, skipping hosts whose key is
    /// in `excluded`.
    fn select_host(
        &self,
        worker: WorkerId,
        request: &Request,
        excluded: &[String],
    ) -> Result<Selection, NoHostsAvailable>;

    /// Acquires a connection to the selected host.
    async fn connect(
        &self,
        selection: &Selection,
        wait: Duration,
    ) -> Result<ConnectionLease, AcquireError> {
        selection.host().acquire(selection.worker(), wait).await
    }

    /// Feeds the result of an attempt into the host's failure accounting.
    fn record_outcome(&self, selection: &Selection, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Success => selection.host().mark_success(),
            AttemptOutcome::Failure => selection.host().mark_failed(),
        }
    }

    /// Whether a host was ever registered, even if all have since been
    /// removed.
    fn ever_configured(&self) -> bool;
}

/// Sends everything to one backend.
#[derive(Debug, Clone)]
pub struct SingleHostProxyClient {
    host: Arc<Host>,
}

impl SingleHostProxyClient {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}

#[async_trait]
impl ProxyClient for SingleHostProxyClient {
    fn select_host(
        &self,
        worker: WorkerId,
        _request: &Request,
        excluded: &[String],
    ) -> Result<Selection, NoHostsAvailable> {
        let host = &self.host;
        if !host.is_available() || excluded.iter().any(|key| key == host.key()) {
            return Err(NoHostsAvailable);
        }
        Ok(Selection::new(Arc::clone(host), worker, false))
    }

    fn ever_configured(&self) -> bool {
        true
    }
}
