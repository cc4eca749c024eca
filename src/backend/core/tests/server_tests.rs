//! Shutdown coordination between the HTTP server and the worker pool.
//!
//! Tests cover:
//! - Workers stop while a slow request is still draining
//! - The HTTP drain gives up at its deadline
//! - An idle server drains at once

use axum::{routing::get, Router};
use perch_core::jobs::{handler_fn, ExecutionPolicy, InMemoryQueueStore, JobRegistry, QueueStore, WorkerConfig, WorkerPool};
use perch_core::server;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn slow_router(entered: Arc<Notify>) -> Router {
    Router::new().route(
        "/slow",
        get(move || {
            let entered = entered.clone();
            async move {
                entered.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                "done"
            }
        }),
    )
}

fn counting_pool(store: Arc<InMemoryQueueStore>, runs: Arc<AtomicUsize>) -> WorkerPool {
    let registry = JobRegistry::builder()
        .register(
            "q",
            handler_fn(move |_ctx| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            ExecutionPolicy::default(),
        )
        .unwrap()
        .build();
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(5),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    WorkerPool::new(store, Arc::new(registry), config)
}

#[tokio::test]
async fn test_workers_stop_while_http_drains() {
    let store = Arc::new(InMemoryQueueStore::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let workers = counting_pool(store.clone(), runs.clone()).start();

    let entered = Arc::new(Notify::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let drain_timeout = Duration::from_millis(300);

    let serving = tokio::spawn(server::serve(
        listener,
        slow_router(entered.clone()),
        Some(workers),
        shutdown.clone(),
        drain_timeout,
    ));

    // Hold one request open inside its handler.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    entered.notified().await;

    let started = Instant::now();
    shutdown.cancel();

    // HTTP is still draining here; the pool must already have stopped leasing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.enqueue("q", json!({})).await.unwrap();

    let summary = serving.await.unwrap().unwrap();
    assert!(!summary.http_drained);
    assert!(summary.workers.unwrap().drained);
    assert!(started.elapsed() < drain_timeout + Duration::from_secs(1));

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(store.stats("q").await.unwrap().pending, 1);
    drop(client);
}

#[tokio::test]
async fn test_idle_server_drains_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let summary = tokio::time::timeout(
        Duration::from_secs(2),
        server::serve(
            listener,
            slow_router(Arc::new(Notify::new())),
            None,
            shutdown,
            Duration::from_secs(5),
        ),
    )
    .await
    .expect("shutdown hung")
    .unwrap();

    assert!(summary.http_drained);
    assert!(summary.workers.is_none());
}
