//! postbus-publisher: periodic event producer
//!
//! Publishes a "post created" event every `publisher.interval_ms` to the
//! RabbitMQ queue named by `queue.name`. Runs apart from the persister;
//! broadcast events reach the persister's hub through `publisher.relay_url`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use postbus::admission::TokenBucket;
use postbus::broadcast::{RelayClient, DEFAULT_LISTENER_BUFFER};
use postbus::config::Config;
use postbus::publisher::{PublishTarget, Publisher};
use postbus::queue::{AmqpQueue, MessageQueue};
use postbus::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting postbus-publisher");

    let queue = connect_with_retry("queue", || AmqpQueue::connect(&config.queue)).await?;
    queue.declare(&config.queue.name).await?;

    let mut target = config.publisher.target;
    let relay = match config.publisher.relay_url.as_deref() {
        Some(url) => Some(RelayClient::spawn(url, DEFAULT_LISTENER_BUFFER)),
        None if target != PublishTarget::Queue => {
            warn!(
                target = ?target,
                "No publisher.relay_url configured, events go to the queue only"
            );
            target = PublishTarget::Queue;
            None
        }
        None => None,
    };

    let mut publisher = Publisher::new(
        Arc::new(queue),
        config.queue.name.clone(),
        Arc::new(TokenBucket::new(&config.rate_limit)),
        target,
    );
    if let Some(relay) = relay {
        publisher = publisher.with_relay(relay);
    }

    publisher
        .run(
            Duration::from_millis(config.publisher.interval_ms.max(1)),
            shutdown_signal(),
        )
        .await;

    info!("postbus-publisher stopped");
    Ok(())
}
