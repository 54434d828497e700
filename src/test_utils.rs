//! Test utilities and mock implementations.
//!
//! Mocks for the record store and for delivery settlement, so persister and
//! mutation tests run without a broker or database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::model::{
    Event, Mutation, MutationEvent, Record, RecordFields, RecordId, RecordPatch,
};
use crate::queue::{
    Delivery, DeliveryTag, NackOutcome, QueueError, QueueMessage, Result as QueueResult, Settler,
};
use crate::store::{validate_title, RecordFilter, RecordStore, Result as StoreResult, StoreError};

/// Failure to inject into the next store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailure {
    Transient,
    Validation,
}

/// In-memory record store.
pub struct MockRecordStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
    applied: RwLock<BTreeMap<String, Record>>,
    next_id: AtomicU64,
    idempotent: bool,
    fail_with: RwLock<Option<StoreFailure>>,
    mutations: AtomicU64,
}

impl Default for MockRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            applied: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            idempotent: true,
            fail_with: RwLock::new(None),
            mutations: AtomicU64::new(0),
        }
    }

    /// Store that ignores idempotency keys.
    pub fn without_idempotency() -> Self {
        Self {
            idempotent: false,
            ..Self::new()
        }
    }

    pub async fn set_failure(&self, failure: Option<StoreFailure>) {
        *self.fail_with.write().await = failure;
    }

    /// Mutations that actually changed state.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn check_failure(&self) -> StoreResult<()> {
        match *self.fail_with.read().await {
            Some(StoreFailure::Transient) => {
                Err(StoreError::Unavailable("Mock store timeout".to_string()))
            }
            Some(StoreFailure::Validation) => {
                Err(StoreError::Validation("Mock validation failure".to_string()))
            }
            None => Ok(()),
        }
    }

    async fn replay(&self, key: Option<&str>) -> Option<Record> {
        if !self.idempotent {
            return None;
        }
        let key = key?;
        self.applied.read().await.get(key).cloned()
    }

    async fn remember(&self, key: Option<&str>, record: &Record) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        if let (true, Some(key)) = (self.idempotent, key) {
            self.applied
                .write()
                .await
                .insert(key.to_string(), record.clone());
        }
    }
}

#[async_trait]
impl RecordStore for MockRecordStore {
    async fn create(&self, fields: &RecordFields, key: Option<&str>) -> StoreResult<Record> {
        self.check_failure().await?;
        if let Some(record) = self.replay(key).await {
            return Ok(record);
        }
        validate_title(&fields.title, 255)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as RecordId;
        let record = Record {
            id,
            title: fields.title.clone(),
            content: fields.content.clone(),
            created_at: Utc::now(),
        };
        self.records.write().await.insert(id, record.clone());
        self.remember(key, &record).await;
        Ok(record)
    }

    async fn update(
        &self,
        id: RecordId,
        patch: &RecordPatch,
        key: Option<&str>,
    ) -> StoreResult<Record> {
        self.check_failure().await?;
        if let Some(record) = self.replay(key).await {
            return Ok(record);
        }

        let patch = patch.clone().normalized();
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        if let Some(title) = patch.title {
            record.title = title;
        }
        if let Some(content) = patch.content {
            record.content = content;
        }
        let record = record.clone();
        drop(records);

        self.remember(key, &record).await;
        Ok(record)
    }

    async fn delete(&self, id: RecordId, key: Option<&str>) -> StoreResult<Record> {
        self.check_failure().await?;
        if let Some(record) = self.replay(key).await {
            return Ok(record);
        }

        let record = self
            .records
            .write()
            .await
            .remove(&id)
            .ok_or(StoreError::NotFound { id })?;
        self.remember(key, &record).await;
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> StoreResult<Record> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { id })
    }

    async fn list(&self, filter: &RecordFilter) -> StoreResult<Vec<Record>> {
        let needle = filter.title_contains.as_ref().map(|t| t.to_lowercase());
        let records = self.records.read().await;
        let matching = records
            .values()
            .filter(|r| filter.after_id.map_or(true, |after| r.id > after))
            .filter(|r| {
                needle
                    .as_ref()
                    .map_or(true, |n| r.title.to_lowercase().contains(n))
            })
            .take(filter.limit.map_or(usize::MAX, |l| l as usize))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn reset(&self) -> StoreResult<()> {
        self.records.write().await.clear();
        self.applied.write().await.clear();
        self.next_id.store(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_idempotency(&self) -> bool {
        self.idempotent
    }
}

/// How a test delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool, reason: String },
    Released,
}

/// Settler that records settlements instead of talking to a broker.
pub struct RecordingSettler {
    settlements: Mutex<Vec<(DeliveryTag, Settlement)>>,
    next_tag: AtomicU64,
    max_redeliveries: u32,
    fail_ack: bool,
}

impl RecordingSettler {
    pub fn new(max_redeliveries: u32) -> Arc<Self> {
        Arc::new(Self {
            settlements: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            max_redeliveries,
            fail_ack: false,
        })
    }

    /// Settler whose acks fail as if the broker connection dropped.
    pub fn failing_ack() -> Arc<Self> {
        Arc::new(Self {
            settlements: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            max_redeliveries: 5,
            fail_ack: true,
        })
    }

    /// Wrap `body` in a delivery settled through this settler.
    pub fn delivery(self: &Arc<Self>, body: &str, redelivery_count: u32) -> Delivery {
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
        let settler: Arc<dyn Settler> = self.clone();
        Delivery::new(
            QueueMessage {
                queue: "test".to_string(),
                body: body.to_string(),
                delivery_tag: tag,
                redelivery_count,
            },
            settler,
        )
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(DeliveryTag, Settlement)>> {
        self.settlements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Settler for RecordingSettler {
    async fn ack(&self, message: &QueueMessage) -> QueueResult<()> {
        if self.fail_ack {
            return Err(QueueError::Connection("Mock ack failure".to_string()));
        }
        self.lock().push((message.delivery_tag, Settlement::Acked));
        Ok(())
    }

    async fn nack(
        &self,
        message: &QueueMessage,
        requeue: bool,
        reason: &str,
    ) -> QueueResult<NackOutcome> {
        self.lock().push((
            message.delivery_tag,
            Settlement::Nacked {
                requeue,
                reason: reason.to_string(),
            },
        ));
        let next = message.redelivery_count + 1;
        if requeue && next <= self.max_redeliveries {
            Ok(NackOutcome::Requeued {
                redelivery_count: next,
            })
        } else {
            Ok(NackOutcome::DeadLettered)
        }
    }

    fn release(&self, message: &QueueMessage) {
        self.lock().push((message.delivery_tag, Settlement::Released));
    }
}

/// Queue body for a plain "item created" event.
pub fn make_event_body(title: &str, content: &str) -> String {
    serde_json::to_string(&Event::new(title, content)).unwrap_or_default()
}

/// Queue body for an explicit mutation under a fixed correlation id.
pub fn make_mutation_body(mutation: Mutation, correlation_id: &str) -> String {
    let mut event = MutationEvent::new(mutation);
    event.correlation_id = correlation_id.to_string();
    event.encode().unwrap_or_default()
}

/// Fields for a create.
pub fn make_fields(title: &str, content: &str) -> RecordFields {
    RecordFields {
        title: title.to_string(),
        content: content.to_string(),
    }
}
