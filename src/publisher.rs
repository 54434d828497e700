//! Periodic producer of "post created" events.
//!
//! Each event passes admission control, then goes to the broadcast hub
//! (fire-and-forget) and/or the durable queue (retried with backoff on
//! transient failures), depending on [`PublishTarget`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{Admission, TokenBucket};
use crate::broadcast::{BroadcastHub, RelayClient, POST_CREATED};
use crate::error::ErrorKind;
use crate::model::Event;
use crate::queue::{EnqueueOptions, MessageQueue, QueueError};
use crate::utils::retry::enqueue_backoff;

/// Where produced events go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishTarget {
    #[default]
    Queue,
    Broadcast,
    Both,
}

impl PublishTarget {
    fn queue(&self) -> bool {
        matches!(self, PublishTarget::Queue | PublishTarget::Both)
    }

    fn broadcast(&self) -> bool {
        matches!(self, PublishTarget::Broadcast | PublishTarget::Both)
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Milliseconds between produced events.
    pub interval_ms: u64,
    pub target: PublishTarget,
    /// WebSocket endpoint of a remote hub (`ws://host:port/ws`), for
    /// processes that do not run one.
    pub relay_url: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            target: PublishTarget::Queue,
            relay_url: None,
        }
    }
}

/// Errors from publishing one event.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Enqueue failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::RateLimited { .. } => ErrorKind::RateLimited,
            PublishError::Queue(e) => e.kind(),
            PublishError::Encode(_) => ErrorKind::MalformedPayload,
        }
    }
}

/// A fresh "post created" event: `Post <unix millis>` / `Content <7 random chars>`.
pub fn produce_post() -> Event {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(7).collect();
    Event::new(
        format!("Post {}", Utc::now().timestamp_millis()),
        format!("Content {}", suffix),
    )
}

/// Produces events into the queue and/or the broadcast hub.
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    hub: Option<BroadcastHub>,
    relay: Option<RelayClient>,
    limiter: Arc<TokenBucket>,
    target: PublishTarget,
    backoff: ExponentialBuilder,
}

impl Publisher {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
        limiter: Arc<TokenBucket>,
        target: PublishTarget,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            hub: None,
            relay: None,
            limiter,
            target,
            backoff: enqueue_backoff(),
        }
    }

    /// Also emit events on `hub` when the target includes broadcast.
    pub fn with_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Emit broadcast events through a remote hub. An in-process hub, if
    /// also wired, takes precedence.
    pub fn with_relay(mut self, relay: RelayClient) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Replace the enqueue retry policy.
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Publish one event.
    ///
    /// Admission is checked first; a denial is returned as
    /// `PublishError::RateLimited` and nothing is sent.
    #[tracing::instrument(
        name = "publisher.publish",
        skip_all,
        fields(correlation_id = %event.correlation_id)
    )]
    pub async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        if let Admission::Denied { retry_after } = self.limiter.try_acquire() {
            return Err(PublishError::RateLimited { retry_after });
        }

        if self.target.broadcast() {
            match (&self.hub, &self.relay) {
                (Some(hub), _) => {
                    hub.publish(POST_CREATED, serde_json::to_value(event)?);
                }
                (None, Some(relay)) => {
                    relay.publish(POST_CREATED, serde_json::to_value(event)?);
                }
                (None, None) => debug!("No broadcast hub wired, skipping broadcast"),
            }
        }

        if self.target.queue() {
            let body = serde_json::to_string(event)?;
            (|| async {
                self.queue
                    .enqueue(&self.queue_name, &body, EnqueueOptions { durable: true })
                    .await
            })
            .retry(self.backoff.clone())
            .when(|e: &QueueError| e.kind() == ErrorKind::TransientIo)
            .notify(|e: &QueueError, delay: Duration| {
                warn!(queue = %self.queue_name, error = %e, delay = ?delay, "Enqueue failed, retrying");
            })
            .await?;
        }

        Ok(())
    }

    /// Produce and publish the next event.
    pub async fn publish_next(&self) -> Result<Event, PublishError> {
        let event = produce_post();
        self.publish(&event).await?;
        Ok(event)
    }

    /// Publish every `interval` until `shutdown` resolves.
    ///
    /// Failures are logged and the loop moves on to the next tick.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            queue = %self.queue_name,
            target = ?self.target,
            interval_ms = interval.as_millis() as u64,
            "Publisher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => match self.publish_next().await {
                    Ok(event) => info!(
                        title = %event.title,
                        correlation_id = %event.correlation_id,
                        "Event published"
                    ),
                    Err(PublishError::RateLimited { retry_after }) => debug!(
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Publish rate limited, skipping tick"
                    ),
                    Err(e) => error!(kind = %e.kind(), error = %e, "Publish failed, continuing"),
                },
            }
        }

        info!("Publisher stopped");
    }
}
