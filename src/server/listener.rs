use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::worker::WorkerPool;

pub async fn run(listen_addr: &str, workers: &WorkerPool) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Listening on {}", listen_addr);

    serve(listener, workers).await
}

/// Accepts clients and spreads them over the workers.
pub async fn serve(listener: TcpListener, workers: &WorkerPool) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let socket = socket.into_std()?;
        let worker = workers.dispatch(socket)?;
        tracing::debug!(%peer, %worker, "Accepted connection");
    }
}
