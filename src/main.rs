use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sentinel_lb::config::Config;
use sentinel_lb::proxy::{ExchangeForwarder, Http1Connector, LoadBalancingProxyClient};
use sentinel_lb::server::{WorkerPool, listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let balancer = Arc::new(
        LoadBalancingProxyClient::from_config(&cfg, Arc::new(Http1Connector))
            .context("Invalid backend configuration")?,
    );
    if cfg.backends.is_empty() {
        tracing::warn!("No backends configured, every request will fail");
    }

    let forwarder = ExchangeForwarder::new(balancer.clone(), cfg.balancer.forwarder_settings());
    let workers = WorkerPool::start(
        cfg.server.workers,
        forwarder,
        Arc::clone(&balancer),
        Duration::from_secs(cfg.server.purge_interval_secs.max(1)),
    )?;

    tokio::select! {
        res = listener::run(&cfg.server.listen_addr, &workers) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    balancer.shutdown();
    tokio::task::spawn_blocking(move || workers.shutdown())
        .await
        .context("Worker shutdown failed")?;

    Ok(())
}
