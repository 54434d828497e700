//! Mock queue for testing publishers.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EnqueueOptions, MessageQueue, QueueConsumer, QueueError, Result};

/// Records enqueued bodies. Consuming is not supported.
#[derive(Default)]
pub struct MockQueue {
    enqueued: RwLock<Vec<(String, String)>>,
    declared: RwLock<Vec<String>>,
    fail_on_enqueue: RwLock<bool>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every enqueue until reset.
    pub async fn set_fail_on_enqueue(&self, fail: bool) {
        *self.fail_on_enqueue.write().await = fail;
    }

    /// Fail the next `count` enqueues, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Enqueue calls seen, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn enqueued_count(&self) -> usize {
        self.enqueued.read().await.len()
    }

    /// Bodies enqueued on `queue`, in order.
    pub async fn bodies(&self, queue: &str) -> Vec<String> {
        self.enqueued
            .read()
            .await
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub async fn declared(&self) -> Vec<String> {
        self.declared.read().await.clone()
    }
}

#[async_trait]
impl MessageQueue for MockQueue {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.declared.write().await.push(queue.to_string());
        Ok(())
    }

    async fn enqueue(&self, queue: &str, body: &str, _options: EnqueueOptions) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if *self.fail_on_enqueue.read().await {
            return Err(QueueError::Connection("Mock enqueue failure".to_string()));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Connection("Mock transient failure".to_string()));
        }

        self.enqueued
            .write()
            .await
            .push((queue.to_string(), body.to_string()));
        Ok(())
    }

    async fn consume(&self, _queue: &str) -> Result<QueueConsumer> {
        Err(QueueError::Unsupported("consume on mock queue"))
    }
}
