//! Perch Server - Main entry point
//!
//! Serves the user and subscription API and, unless disabled, runs the
//! background workers in the same process.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use perch_core::{
    api::{self, AppState},
    config::Config,
    db::Database,
    health::{HealthConfig, HealthService, QueueHealthChecker, StoreHealthChecker},
    jobs::{default_registry, QueueStore, RedisQueueStore, WorkerConfig, WorkerPool},
    middleware::RateLimiter,
    observability, server,
    users::{MockPaymentProvider, SubscriptionService, UserStore},
};

const SERVICE_NAME: &str = "perch-server";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    observability::init(SERVICE_NAME, &config.observability)?;
    let metrics = observability::metrics::install(SERVICE_NAME)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Perch Server"
    );

    // Connect to database
    let db = Database::connect(&config.database).await?;
    db.migrate().await?;
    tracing::info!("Connected to database, migrations applied");

    let queue: Arc<dyn QueueStore> = Arc::new(
        RedisQueueStore::connect(
            &config.redis.url,
            config.redis.key_prefix.clone(),
            config.workers.dead_letter_max,
        )
        .await?,
    );
    tracing::info!(prefix = %config.redis.key_prefix, "Connected to Redis");

    let store: Arc<dyn UserStore> = Arc::new(db.user_store());
    let service = Arc::new(
        SubscriptionService::new(store.clone(), Arc::new(MockPaymentProvider)).with_queue(queue.clone()),
    );

    let health = Arc::new(HealthService::new(
        HealthConfig::from(&config.health),
        Arc::new(StoreHealthChecker::new(store)),
        Arc::new(QueueHealthChecker::new(queue.clone())),
    ));

    let workers = if config.workers.enabled {
        let registry = Arc::new(default_registry(service.clone())?);
        let pool = WorkerPool::new(queue.clone(), registry, WorkerConfig::from(&config.workers));
        let handle = pool.start();
        tracing::info!(executors = handle.executors(), "Background workers started");
        Some(handle)
    } else {
        tracing::info!("Background workers disabled");
        None
    };

    let mut state = AppState::new(service, health).with_metrics(metrics);
    if config.rate_limit.enabled {
        let limiter = RateLimiter::connect(
            &config.redis.url,
            config.redis.key_prefix.clone(),
            config.rate_limit.clone(),
        )
        .await?;
        state = state.with_rate_limiter(Arc::new(limiter));
    }
    let app = api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let summary = server::serve(listener, app, workers, shutdown, config.server.shutdown_timeout).await?;
    tracing::info!(http_drained = summary.http_drained, "HTTP server and workers stopped");

    // Stores go last: nothing is serving or leasing any more.
    if let Err(e) = queue.close().await {
        tracing::warn!(error = %e, "Failed to close queue store");
    }
    db.close().await;

    tracing::info!("Server shutdown complete");
    observability::shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
