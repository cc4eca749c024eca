//! HTTP serving with a coordinated shutdown.
//!
//! One [`CancellationToken`] fans the shutdown out: the HTTP server stops
//! accepting and starts draining open requests, while the worker pool stops
//! leasing and drains its handlers at the same time. The HTTP drain is bounded;
//! connections still open at the deadline are dropped.

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PerchError, Result};
use crate::jobs::{ShutdownReport, WorkerHandle};

/// How the HTTP server and the worker pool wound down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Every open request finished before the drain deadline
    pub http_drained: bool,
    /// `None` when no worker pool ran in this process
    pub workers: Option<ShutdownReport>,
}

/// Serve `router` until `shutdown` is cancelled, then stop HTTP and workers together.
///
/// If the server exits on its own, `shutdown` is cancelled so the workers stop too.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    workers: Option<WorkerHandle>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<ShutdownSummary> {
    let server = {
        let token = shutdown.clone();
        let signal = {
            let token = token.clone();
            async move { token.cancelled().await }
        };
        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(signal)
            .await;
            token.cancel();
            served
        })
    };

    shutdown.cancelled().await;
    info!(drain_timeout = ?drain_timeout, "Shutting down HTTP server and workers");

    let (http, workers) = tokio::join!(drain_http(server, drain_timeout), stop_workers(workers));
    Ok(ShutdownSummary {
        http_drained: http?,
        workers,
    })
}

/// Wait for open requests up to `limit`; true if they all finished.
async fn drain_http(mut server: JoinHandle<std::io::Result<()>>, limit: Duration) -> Result<bool> {
    match tokio::time::timeout(limit, &mut server).await {
        Ok(Ok(served)) => {
            served?;
            info!("HTTP server drained");
            Ok(true)
        }
        Ok(Err(e)) => Err(PerchError::internal(format!("HTTP server task failed: {}", e))),
        Err(_) => {
            warn!(timeout = ?limit, "HTTP drain deadline reached; dropping open connections");
            server.abort();
            Ok(false)
        }
    }
}

async fn stop_workers(workers: Option<WorkerHandle>) -> Option<ShutdownReport> {
    let handle = workers?;
    let report = handle.shutdown().await;
    info!(drained = report.drained, abandoned = report.abandoned, "Workers stopped");
    Some(report)
}
