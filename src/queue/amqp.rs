//! AMQP (RabbitMQ) queue backend.
//!
//! Messages are published to the default exchange with the queue name as
//! routing key, marked persistent, and confirmed by the broker before
//! `enqueue` returns. Consumers use a prefetch of one so each holds at
//! most one unacked message.
//!
//! RabbitMQ does not count redeliveries on classic queues, so a requeue is
//! a republish carrying an incremented `x-redelivery-count` header followed
//! by an ack of the original. Dead letters go to `{queue}.dead-letter`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Delivery, DeliveryTag, EnqueueOptions, MessageQueue, NackOutcome, QueueConfig,
    QueueConsumer, QueueDepth, QueueError, QueueMessage, Result, Settler,
};

/// Header carrying how many times a message was requeued.
pub const REDELIVERY_HEADER: &str = "x-redelivery-count";

/// Header carrying why a message was dead-lettered.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dead-letter", queue)
}

/// RabbitMQ-backed durable queue.
pub struct AmqpQueue {
    pool: Pool,
    max_redeliveries: u32,
}

impl AmqpQueue {
    /// Connect and verify the broker is reachable.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| QueueError::Connection(format!("Failed to create pool: {}", e)))?;

        let queue = Self {
            pool,
            max_redeliveries: config.max_redeliveries,
        };
        let channel = queue.get_channel().await?;
        declare_with_dead_letter(&channel, &config.name).await?;

        info!(queue = %config.name, "Connected to AMQP");
        Ok(queue)
    }

    /// Fresh channel in confirm mode.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            QueueError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to enable confirms: {}", e)))?;
        Ok(channel)
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<lapin::Queue> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| QueueError::Connection(format!("Failed to declare queue: {}", e)))
}

async fn declare_with_dead_letter(channel: &Channel, queue: &str) -> Result<()> {
    declare_durable(channel, queue).await?;
    declare_durable(channel, &dead_letter_queue(queue)).await?;
    Ok(())
}

/// Publish a persistent message and wait for the broker's confirm.
async fn publish_persistent(
    channel: &Channel,
    queue: &str,
    body: &[u8],
    headers: FieldTable,
) -> Result<()> {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2) // persistent
        .with_headers(headers);

    let confirm = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await
        .map_err(|e| QueueError::Connection(format!("Failed to publish: {}", e)))?;

    confirm
        .await
        .map_err(|e| QueueError::Connection(format!("Publish confirmation failed: {}", e)))?;
    Ok(())
}

fn redelivery_headers(count: u32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(REDELIVERY_HEADER.into(), AMQPValue::LongUInt(count));
    headers
}

/// Requeue count from headers. A broker-flagged redelivery without the
/// header counts as one.
fn redelivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let from_header = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == REDELIVERY_HEADER)
            .and_then(|(_, value)| match value {
                AMQPValue::LongUInt(n) => Some(*n),
                AMQPValue::LongInt(n) => Some((*n).max(0) as u32),
                AMQPValue::LongLongInt(n) => Some((*n).max(0) as u32),
                AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
                AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
                _ => None,
            })
    });

    match from_header {
        Some(count) => count,
        None if redelivered => 1,
        None => 0,
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    async fn declare(&self, queue: &str) -> Result<()> {
        let channel = self.get_channel().await?;
        declare_with_dead_letter(&channel, queue).await
    }

    #[tracing::instrument(name = "queue.enqueue", skip_all, fields(queue = %queue))]
    async fn enqueue(&self, queue: &str, body: &str, options: EnqueueOptions) -> Result<()> {
        let channel = self.get_channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if options.durable { 2 } else { 1 });

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to publish: {}", e)))?;
        confirm
            .await
            .map_err(|e| QueueError::Connection(format!("Publish confirmation failed: {}", e)))?;

        debug!(queue, durable = options.durable, "Message enqueued");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<QueueConsumer> {
        let channel = self.get_channel().await?;
        declare_with_dead_letter(&channel, queue).await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("postbus-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to start consumer: {}", e)))?;

        let settler = Arc::new(AmqpSettler {
            channel: channel.clone(),
            max_redeliveries: self.max_redeliveries,
            inflight: Mutex::new(HashMap::new()),
        });
        let (sender, receiver) = mpsc::channel(1);
        let queue_name = queue.to_string();

        let pump = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "Consumer delivery error");
                        break;
                    }
                };

                let tag = DeliveryTag(delivery.delivery_tag);
                let message = QueueMessage {
                    queue: queue_name.clone(),
                    body: String::from_utf8_lossy(&delivery.data).into_owned(),
                    delivery_tag: tag,
                    redelivery_count: redelivery_count(&delivery.properties, delivery.redelivered),
                };
                settler.hold(tag, delivery.acker);

                let settler_dyn: Arc<dyn Settler> = settler.clone();
                if sender.send(Delivery::new(message, settler_dyn)).await.is_err() {
                    // Receiver gone; the returned delivery is released on drop.
                    break;
                }
            }
            info!(queue = %queue_name, "AMQP consumer stopped");
        });

        let on_close = move || {
            pump.abort();
            let channel = channel.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    // Closing the channel returns unacked messages to the queue.
                    if let Err(e) = channel.close(200, "consumer closed").await {
                        debug!(error = %e, "Channel close failed");
                    }
                });
            }
        };

        info!(queue, consumer_tag = %consumer_tag, "AMQP consumer attached");
        Ok(QueueConsumer::new(queue, receiver, Some(Box::new(on_close))))
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let channel = self.get_channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to inspect queue: {}", e)))?;

        Ok(QueueDepth {
            ready: declared.message_count() as usize,
            unacked: 0,
            consumers: declared.consumer_count() as usize,
        })
    }
}

/// Where a negatively settled message goes: back to its queue with the next
/// count, or to the dead-letter queue once the ceiling is passed or requeue
/// is refused.
fn negative_route(
    message: &QueueMessage,
    max_redeliveries: u32,
    requeue: bool,
    reason: &str,
) -> (String, FieldTable, NackOutcome) {
    let next_count = message.redelivery_count + 1;
    if requeue && next_count <= max_redeliveries {
        return (
            message.queue.clone(),
            redelivery_headers(next_count),
            NackOutcome::Requeued {
                redelivery_count: next_count,
            },
        );
    }

    let mut headers = redelivery_headers(message.redelivery_count);
    headers.insert(
        DEATH_REASON_HEADER.into(),
        AMQPValue::LongString(LongString::from(reason.to_string())),
    );
    (
        dead_letter_queue(&message.queue),
        headers,
        NackOutcome::DeadLettered,
    )
}

/// Why a negative settle did not complete.
enum SettleFailure {
    /// Nothing was republished; the original comes back unsettled.
    Publish(Acker, QueueError),
    /// The copy was published but the original could not be acked.
    Ack(QueueError),
}

/// Republish per `negative_route`, then ack the original.
async fn settle_negative(
    channel: &Channel,
    max_redeliveries: u32,
    acker: Acker,
    message: &QueueMessage,
    requeue: bool,
    reason: &str,
) -> std::result::Result<NackOutcome, SettleFailure> {
    let (target, headers, outcome) = negative_route(message, max_redeliveries, requeue, reason);

    if let Err(e) = publish_persistent(channel, &target, message.body.as_bytes(), headers).await {
        return Err(SettleFailure::Publish(acker, e));
    }

    if let Err(e) = acker.ack(BasicAckOptions::default()).await {
        // Both copies may now exist; the idempotency key absorbs the duplicate.
        return Err(SettleFailure::Ack(QueueError::Connection(format!(
            "Failed to ack original: {}",
            e
        ))));
    }

    match outcome {
        NackOutcome::DeadLettered => error!(
            queue = %message.queue,
            redelivery_count = message.redelivery_count,
            reason,
            body = %message.body,
            "Message dead-lettered"
        ),
        NackOutcome::Requeued { redelivery_count } => {
            debug!(queue = %message.queue, redelivery_count, reason, "Message requeued")
        }
    }
    Ok(outcome)
}

/// Settles deliveries received on one consumer channel.
struct AmqpSettler {
    channel: Channel,
    max_redeliveries: u32,
    inflight: Mutex<HashMap<DeliveryTag, Acker>>,
}

impl AmqpSettler {
    fn lock(&self) -> MutexGuard<'_, HashMap<DeliveryTag, Acker>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hold(&self, tag: DeliveryTag, acker: Acker) {
        self.lock().insert(tag, acker);
    }

    fn take(&self, tag: DeliveryTag) -> Result<Acker> {
        self.lock()
            .remove(&tag)
            .ok_or(QueueError::UnknownDeliveryTag(tag))
    }
}

#[async_trait]
impl Settler for AmqpSettler {
    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let acker = self.take(message.delivery_tag)?;
        acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to ack: {}", e)))
    }

    async fn nack(
        &self,
        message: &QueueMessage,
        requeue: bool,
        reason: &str,
    ) -> Result<NackOutcome> {
        let tag = message.delivery_tag;
        let acker = self.take(tag)?;

        match settle_negative(
            &self.channel,
            self.max_redeliveries,
            acker,
            message,
            requeue,
            reason,
        )
        .await
        {
            Ok(outcome) => Ok(outcome),
            Err(SettleFailure::Publish(acker, e)) => {
                // Keep the original so the caller can retry the settle.
                self.hold(tag, acker);
                Err(e)
            }
            Err(SettleFailure::Ack(e)) => Err(e),
        }
    }

    /// Counts toward the redelivery ceiling like a requeueing nack, so a
    /// message that keeps killing its consumer is eventually dead-lettered.
    fn release(&self, message: &QueueMessage) {
        let Ok(acker) = self.take(message.delivery_tag) else {
            return;
        };
        let tag = message.delivery_tag;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                delivery_tag = %tag,
                "No runtime to release delivery, broker will requeue on channel close"
            );
            return;
        };

        let channel = self.channel.clone();
        let max_redeliveries = self.max_redeliveries;
        let message = message.clone();
        runtime.spawn(async move {
            let released = settle_negative(
                &channel,
                max_redeliveries,
                acker,
                &message,
                true,
                "delivery released unsettled",
            )
            .await;

            match released {
                Ok(_) => {}
                Err(SettleFailure::Publish(acker, e)) => {
                    warn!(delivery_tag = %tag, error = %e, "Failed to republish released delivery, requeueing");
                    let options = BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    };
                    if let Err(e) = acker.nack(options).await {
                        warn!(delivery_tag = %tag, error = %e, "Failed to release delivery");
                    }
                }
                Err(SettleFailure::Ack(e)) => {
                    warn!(delivery_tag = %tag, error = %e, "Released delivery republished but not acked");
                }
            }
        });
    }
}
