//! postbus-persister: queue consumer, record store writer and broadcast host
//!
//! Consumes the RabbitMQ queue named by `queue.name`, applies each mutation
//! to the SQLite record store, and broadcasts results to WebSocket
//! listeners on `broadcast.bind`. Also serves the direct mutation API.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use postbus::admission::TokenBucket;
use postbus::broadcast::BroadcastHub;
use postbus::config::Config;
use postbus::http::{self, AppState};
use postbus::mutation::MutationService;
use postbus::persister::Persister;
use postbus::queue::{AmqpQueue, MessageQueue};
use postbus::store::{RecordStore, SqliteRecordStore};
use postbus::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting postbus-persister");

    let queue: Arc<dyn MessageQueue> = Arc::new(
        connect_with_retry("queue", || AmqpQueue::connect(&config.queue)).await?,
    );
    queue.declare(&config.queue.name).await?;

    let sqlite_store = Arc::new(SqliteRecordStore::open(&config.store).await?);
    let store: Arc<dyn RecordStore> = sqlite_store.clone();
    let hub = BroadcastHub::new(&config.broadcast);

    let (stop_tx, stop_rx) = watch::channel(false);

    let persister = Persister::new(store.clone(), hub.clone());
    let mut workers = Vec::new();
    for _ in 0..config.persister.workers.max(1) {
        let consumer = queue.consume(&config.queue.name).await?;
        let persister = persister.clone();
        let stop = stop_rx.clone();
        workers.push(tokio::spawn(async move {
            persister.run_until(consumer, stopped(stop)).await
        }));
    }
    info!(workers = workers.len(), queue = %config.queue.name, "Persister workers started");

    let state = AppState {
        mutations: MutationService::new(
            store,
            hub.clone(),
            Arc::new(TokenBucket::new(&config.rate_limit)),
        ),
        queue: queue.clone(),
        queue_name: config.queue.name.clone(),
        hub: hub.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.broadcast.bind).await?;
    info!(bind = %config.broadcast.bind, "HTTP/WebSocket surface listening");

    {
        let hub = hub.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
            hub.shutdown();
        });
    }

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .await?;

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Persister worker failed");
        }
    }
    sqlite_store.close().await;

    info!("postbus-persister stopped");
    Ok(())
}
