//! Domain types carried through the relay.
//!
//! - `Event`: what a publisher produces ("a post was created")
//! - `MutationRequest`: wire shape of the record mutation API
//! - `Mutation`: structurally validated create/update/delete
//! - `MutationEvent`: decoded queue body (correlation id + mutation)
//! - `Record`: a row owned by the record store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned record identity.
pub type RecordId = i64;

/// An "item created" event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl Event {
    /// Create an event stamped now with a fresh correlation id.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            created_at: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

/// A persisted row. The `id` is the only stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Mutation operation discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Record mutation request as it appears on the wire:
/// `{ operation, id?, title?, content? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Fields for a new record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFields {
    pub title: String,
    pub content: String,
}

/// Partial update. Absent or empty fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl RecordPatch {
    /// Drop empty strings so they do not overwrite stored values.
    pub fn normalized(self) -> Self {
        Self {
            title: self.title.filter(|t| !t.is_empty()),
            content: self.content.filter(|c| !c.is_empty()),
        }
    }
}

/// A structurally valid mutation against the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(RecordFields),
    Update { id: RecordId, patch: RecordPatch },
    Delete { id: RecordId },
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Create(_) => Operation::Create,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }

    /// Back to wire shape.
    pub fn to_request(&self) -> MutationRequest {
        match self {
            Mutation::Create(fields) => MutationRequest {
                operation: Operation::Create,
                id: None,
                title: Some(fields.title.clone()),
                content: Some(fields.content.clone()),
            },
            Mutation::Update { id, patch } => MutationRequest {
                operation: Operation::Update,
                id: Some(*id),
                title: patch.title.clone(),
                content: patch.content.clone(),
            },
            Mutation::Delete { id } => MutationRequest {
                operation: Operation::Delete,
                id: Some(*id),
                title: None,
                content: None,
            },
        }
    }
}

/// Payload could not be turned into a mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed payload: {reason}")]
pub struct MalformedPayload {
    pub reason: String,
}

impl MalformedPayload {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl TryFrom<MutationRequest> for Mutation {
    type Error = MalformedPayload;

    fn try_from(request: MutationRequest) -> Result<Self, Self::Error> {
        match request.operation {
            Operation::Create => {
                let title = request
                    .title
                    .ok_or_else(|| MalformedPayload::new("create requires 'title'"))?;
                let content = request
                    .content
                    .ok_or_else(|| MalformedPayload::new("create requires 'content'"))?;
                Ok(Mutation::Create(RecordFields { title, content }))
            }
            Operation::Update => {
                let id = request
                    .id
                    .ok_or_else(|| MalformedPayload::new("update requires 'id'"))?;
                Ok(Mutation::Update {
                    id,
                    patch: RecordPatch {
                        title: request.title,
                        content: request.content,
                    },
                })
            }
            Operation::Delete => {
                let id = request
                    .id
                    .ok_or_else(|| MalformedPayload::new("delete requires 'id'"))?;
                Ok(Mutation::Delete { id })
            }
        }
    }
}

/// Queue body carrying an explicit mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationEnvelope {
    correlation_id: String,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    request: MutationRequest,
}

/// A decoded queue body: which mutation to apply, and under which
/// correlation id (the idempotency key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub mutation: Mutation,
}

impl MutationEvent {
    /// Wrap a mutation with a fresh correlation id.
    pub fn new(mutation: Mutation) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            mutation,
        }
    }

    /// Decode a queue body.
    ///
    /// Bodies with an `operation` field are mutation envelopes; anything else
    /// is read as a plain `Event` and becomes a create.
    pub fn decode(body: &str) -> Result<Self, MalformedPayload> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| MalformedPayload::new(e.to_string()))?;

        if !value.is_object() {
            return Err(MalformedPayload::new("body is not a JSON object"));
        }

        if value.get("operation").is_some() {
            let envelope: MutationEnvelope =
                serde_json::from_value(value).map_err(|e| MalformedPayload::new(e.to_string()))?;
            let mutation = Mutation::try_from(envelope.request)?;
            Ok(Self {
                correlation_id: envelope.correlation_id,
                created_at: envelope.created_at,
                mutation,
            })
        } else {
            let event: Event =
                serde_json::from_value(value).map_err(|e| MalformedPayload::new(e.to_string()))?;
            Ok(Self::from(event))
        }
    }

    /// Encode as a mutation envelope.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&MutationEnvelope {
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            request: self.mutation.to_request(),
        })
    }
}

impl From<Event> for MutationEvent {
    fn from(event: Event) -> Self {
        Self {
            correlation_id: event.correlation_id,
            created_at: event.created_at,
            mutation: Mutation::Create(RecordFields {
                title: event.title,
                content: event.content,
            }),
        }
    }
}
