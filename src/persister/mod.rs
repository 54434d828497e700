//! Queue consumer that applies record mutations.
//!
//! Per message: decode, mutate the record store under the event's
//! correlation id, ack, then notify live listeners. Every path ends in an
//! ack, a requeue or a dead letter; nothing here can take the worker down.
//!
//! | Result                       | Settlement          |
//! |------------------------------|---------------------|
//! | mutation applied             | ack, then broadcast |
//! | transient (timeout, I/O)     | nack, requeue       |
//! | validation / not found       | nack, dead-letter   |
//! | payload could not be decoded | nack, dead-letter   |
//!
//! The store mutation, the ack and the broadcast are not atomic. A crash
//! after the mutation and before the ack redelivers the message; the
//! idempotency key makes the second application a no-op.

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{self, BroadcastHub};
use crate::error::ErrorKind;
use crate::model::{Operation, Record, RecordId};
use crate::queue::{Delivery, MessageQueue, NackOutcome, QueueConsumer, QueueError};
use crate::store::{apply_mutation, RecordStore};

/// Persister configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    /// Concurrent consumers attached to the queue.
    pub workers: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// How one delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked { record_id: RecordId },
    Requeued { redelivery_count: u32 },
    DeadLettered { kind: ErrorKind },
    /// The broker did not accept the ack or nack. The message will come
    /// back through release or lease expiry.
    SettleFailed,
}

/// Broadcast topic announcing a successful operation.
pub fn topic_for(operation: Operation) -> &'static str {
    match operation {
        Operation::Create => broadcast::RECORD_CREATED,
        Operation::Update => broadcast::RECORD_UPDATED,
        Operation::Delete => broadcast::RECORD_DELETED,
    }
}

/// Applies queued mutations to a record store.
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn RecordStore>,
    hub: BroadcastHub,
}

impl Persister {
    pub fn new(store: Arc<dyn RecordStore>, hub: BroadcastHub) -> Self {
        if !store.supports_idempotency() {
            warn!("Record store has no idempotency support, redeliveries may apply twice");
        }
        Self { store, hub }
    }

    /// Process one delivery to completion.
    #[tracing::instrument(
        name = "persister.on_message",
        skip_all,
        fields(
            queue = %delivery.message().queue,
            delivery_tag = %delivery.delivery_tag(),
            redelivery_count = delivery.message().redelivery_count
        )
    )]
    pub async fn on_message(&self, delivery: Delivery) -> Outcome {
        let event = match delivery.message().payload() {
            Ok(event) => event,
            Err(e) => {
                error!(
                    body = %delivery.message().body,
                    error = %e,
                    "Malformed payload"
                );
                let reason = e.to_string();
                return settle_failure(delivery, ErrorKind::MalformedPayload, &reason).await;
            }
        };

        let key = self
            .store
            .supports_idempotency()
            .then_some(event.correlation_id.as_str());
        let operation = event.mutation.operation();

        match apply_mutation(self.store.as_ref(), &event.mutation, key).await {
            Ok(record) => {
                if let Err(e) = delivery.ack().await {
                    error!(
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Mutation applied but ack failed"
                    );
                    return Outcome::SettleFailed;
                }

                debug!(
                    correlation_id = %event.correlation_id,
                    operation = operation.as_str(),
                    record_id = record.id,
                    "Mutation applied"
                );
                self.notify(operation, &record);
                Outcome::Acked {
                    record_id: record.id,
                }
            }
            Err(e) => {
                let kind = e.kind();
                if kind.is_permanent() {
                    error!(
                        correlation_id = %event.correlation_id,
                        operation = operation.as_str(),
                        kind = %kind,
                        body = %delivery.message().body,
                        error = %e,
                        "Mutation rejected"
                    );
                } else {
                    warn!(
                        correlation_id = %event.correlation_id,
                        kind = %kind,
                        error = %e,
                        "Mutation failed, will retry"
                    );
                }
                let reason = e.to_string();
                settle_failure(delivery, kind, &reason).await
            }
        }
    }

    fn notify(&self, operation: Operation, record: &Record) {
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, record_id = record.id, "Failed to encode notification");
                return;
            }
        };
        self.hub.publish(topic_for(operation), payload);
    }

    /// Process deliveries until the consumer closes.
    pub async fn run(&self, mut consumer: QueueConsumer) {
        info!(queue = consumer.queue(), "Persister worker started");
        while let Some(delivery) = consumer.recv().await {
            self.on_message(delivery).await;
        }
        info!(queue = consumer.queue(), "Persister worker stopped, queue closed");
    }

    /// Process deliveries until `shutdown` resolves.
    ///
    /// A message in progress when shutdown fires is finished first.
    pub async fn run_until(&self, mut consumer: QueueConsumer, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(queue = consumer.queue(), "Persister worker shutting down");
                    return;
                }
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => {
                        self.on_message(delivery).await;
                    }
                    None => {
                        info!(queue = consumer.queue(), "Persister worker stopped, queue closed");
                        return;
                    }
                },
            }
        }
    }

    /// Attach `workers` consumers to `queue_name` and run each on its own task.
    pub async fn spawn_workers(
        &self,
        queue: &dyn MessageQueue,
        queue_name: &str,
        workers: usize,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        queue.declare(queue_name).await?;

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let consumer = queue.consume(queue_name).await?;
            let persister = self.clone();
            handles.push(tokio::spawn(async move { persister.run(consumer).await }));
        }

        info!(queue = queue_name, workers = handles.len(), "Persister workers started");
        Ok(handles)
    }
}

/// Nack according to `kind`: permanent failures dead-letter, the rest
/// requeue until the broker's ceiling.
async fn settle_failure(delivery: Delivery, kind: ErrorKind, reason: &str) -> Outcome {
    let requeue = !kind.is_permanent();
    match delivery.nack(requeue, reason).await {
        Ok(NackOutcome::Requeued { redelivery_count }) => Outcome::Requeued { redelivery_count },
        Ok(NackOutcome::DeadLettered) => Outcome::DeadLettered { kind },
        Err(e) => {
            error!(kind = %kind, error = %e, "Failed to nack delivery");
            Outcome::SettleFailed
        }
    }
}

#[cfg(test)]
mod tests;
