//! postbus-standalone: every role in one process
//!
//! ## Architecture
//! ```text
//! postbus-standalone
//!     │
//!     ├── Publisher ──enqueue──→ SqliteQueue (data/queue.db)
//!     │                              │
//!     │                   consume (prefetch 1, round-robin)
//!     │                              ↓
//!     ├── Persister workers ──→ SqliteRecordStore (data/records.db)
//!     │                              │
//!     │                     ack, then broadcast
//!     │                              ↓
//!     ├── BroadcastHub ──→ WebSocket listeners (/ws)
//!     └── HTTP surface (:4002) ──→ MutationService
//! ```
//!
//! ## Configuration
//! ```yaml
//! queue:
//!   path: data/queue.db
//!   name: posts
//!   max_redeliveries: 5
//! store:
//!   path: data/records.db
//! broadcast:
//!   bind: 0.0.0.0:4002
//! rate_limit:
//!   capacity: 1
//!   interval_ms: 1000
//! publisher:
//!   interval_ms: 3000
//!   target: both
//! persister:
//!   workers: 2
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use postbus::admission::TokenBucket;
use postbus::broadcast::BroadcastHub;
use postbus::config::Config;
use postbus::http::{self, AppState};
use postbus::mutation::MutationService;
use postbus::persister::Persister;
use postbus::publisher::Publisher;
use postbus::queue::{MessageQueue, SqliteQueue};
use postbus::store::{RecordStore, SqliteRecordStore};
use postbus::utils::bootstrap::{init_tracing, shutdown_signal};

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

    info!("Starting postbus-standalone");

    let queue = Arc::new(SqliteQueue::open(&config.queue).await?);
    queue.declare(&config.queue.name).await?;
    let sqlite_store = Arc::new(SqliteRecordStore::open(&config.store).await?);
    let store: Arc<dyn RecordStore> = sqlite_store.clone();
    let hub = BroadcastHub::new(&config.broadcast);
    let limiter = Arc::new(TokenBucket::new(&config.rate_limit));

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

    let publisher = Publisher::new(
        queue.clone(),
        config.queue.name.clone(),
        limiter.clone(),
        config.publisher.target,
    )
    .with_hub(hub.clone());
    let interval = Duration::from_millis(config.publisher.interval_ms.max(1));
    let publisher_task = {
        let stop = stop_rx.clone();
        tokio::spawn(async move { publisher.run(interval, stopped(stop)).await })
    };

    let state = AppState {
        mutations: MutationService::new(store, hub.clone(), limiter),
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
            // Ends every listener stream so WebSocket handlers return.
            hub.shutdown();
        });
    }

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .await?;

    if let Err(e) = publisher_task.await {
        error!(error = %e, "Publisher task failed");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Persister worker failed");
        }
    }

    queue.shutdown().await;
    sqlite_store.close().await;

    info!("postbus-standalone stopped");
    Ok(())
}
