//! Direct record mutations, bypassing the queue.
//!
//! Same gate and fan-out as the queued path: admission first, then the
//! record store, then a broadcast of the resulting record. There is no
//! redelivery here, so no idempotency key is passed to the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::admission::{Admission, TokenBucket};
use crate::broadcast::{BroadcastHub, PublishReport, ALL_TOPICS};
use crate::error::ErrorKind;
use crate::model::{MalformedPayload, Mutation, MutationRequest, Record, RecordId};
use crate::persister::topic_for;
use crate::store::{apply_mutation, RecordFilter, RecordStore, StoreError};

/// Errors from the mutation service.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MutationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MutationError::RateLimited { .. } => ErrorKind::RateLimited,
            MutationError::Malformed(_) => ErrorKind::MalformedPayload,
            MutationError::Store(e) => e.kind(),
        }
    }
}

/// Admission-controlled access to the record store.
#[derive(Clone)]
pub struct MutationService {
    store: Arc<dyn RecordStore>,
    hub: BroadcastHub,
    limiter: Arc<TokenBucket>,
}

impl MutationService {
    pub fn new(store: Arc<dyn RecordStore>, hub: BroadcastHub, limiter: Arc<TokenBucket>) -> Self {
        Self {
            store,
            hub,
            limiter,
        }
    }

    fn admit(&self) -> Result<(), MutationError> {
        match self.limiter.try_acquire() {
            Admission::Granted => Ok(()),
            Admission::Denied { retry_after } => Err(MutationError::RateLimited { retry_after }),
        }
    }

    /// Validate, admit and apply one mutation request.
    ///
    /// Structurally invalid requests are rejected before admission so they
    /// do not consume a token.
    #[tracing::instrument(name = "mutation.execute", skip_all, fields(operation = request.operation.as_str()))]
    pub async fn execute(&self, request: MutationRequest) -> Result<Record, MutationError> {
        let mutation = Mutation::try_from(request)?;
        self.admit()?;

        let record = apply_mutation(self.store.as_ref(), &mutation, None).await?;
        debug!(record_id = record.id, "Direct mutation applied");

        match serde_json::to_value(&record) {
            Ok(payload) => {
                self.hub.publish(topic_for(mutation.operation()), payload);
            }
            Err(e) => debug!(error = %e, "Failed to encode notification"),
        }

        Ok(record)
    }

    pub async fn get(&self, id: RecordId) -> Result<Record, MutationError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>, MutationError> {
        Ok(self.store.list(filter).await?)
    }

    /// Publish a client-supplied notification on the hub.
    ///
    /// Counts against the same admission budget as mutations. The wildcard
    /// topic is for subscribing only.
    pub fn relay(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<PublishReport, MutationError> {
        if topic.trim().is_empty() || topic == ALL_TOPICS {
            return Err(MalformedPayload::new(format!("cannot publish on topic '{}'", topic)).into());
        }
        self.admit()?;
        Ok(self.hub.publish(topic, payload))
    }

    /// Remove every record. Admission-controlled like any other mutation.
    pub async fn reset(&self) -> Result<(), MutationError> {
        self.admit()?;
        self.store.reset().await?;
        info!("Record store reset");
        Ok(())
    }
}
