//! Record store gateway.
//!
//! The persister and the direct mutation API reach the system of record
//! only through [`RecordStore`]. Mutations carry an optional idempotency
//! key; a store that supports keys applies each key at most once and
//! answers repeats with the original result.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ErrorKind;
use crate::model::{Mutation, Record, RecordFields, RecordId, RecordPatch};

mod schema;
pub mod sqlite;

pub use sqlite::SqliteRecordStore;

/// Default maximum title length, in characters.
pub const DEFAULT_MAX_TITLE_LEN: usize = 255;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Record {id} not found")]
    NotFound { id: RecordId },

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Unavailable(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if !matches!(db.kind(), sqlx::error::ErrorKind::Other) => {
                StoreError::Validation(db.message().to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Filter for `list`. All fields are optional; results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordFilter {
    /// Case-insensitive substring match on title.
    pub title_contains: Option<String>,
    /// Only records with a larger id.
    pub after_id: Option<RecordId>,
    pub limit: Option<u64>,
}

/// Record store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path.
    pub path: String,
    pub max_title_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "data/records.db".to_string(),
            max_title_len: DEFAULT_MAX_TITLE_LEN,
        }
    }
}

/// Interface to the system of record.
///
/// Every operation touches a single row identified by its integer id.
/// `key` is an idempotency key; stores that do not support keys ignore it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, fields: &RecordFields, key: Option<&str>) -> Result<Record>;

    /// Apply a partial update. Absent or empty fields are left as stored.
    async fn update(&self, id: RecordId, patch: &RecordPatch, key: Option<&str>)
        -> Result<Record>;

    /// Remove a record and return it as it was.
    async fn delete(&self, id: RecordId, key: Option<&str>) -> Result<Record>;

    async fn get(&self, id: RecordId) -> Result<Record>;

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Remove every record and restart id allocation.
    async fn reset(&self) -> Result<()>;

    /// Whether repeated keys are collapsed.
    fn supports_idempotency(&self) -> bool {
        false
    }
}

/// Apply a mutation to a store under an idempotency key.
pub async fn apply_mutation(
    store: &dyn RecordStore,
    mutation: &Mutation,
    key: Option<&str>,
) -> Result<Record> {
    match mutation {
        Mutation::Create(fields) => store.create(fields, key).await,
        Mutation::Update { id, patch } => store.update(*id, patch, key).await,
        Mutation::Delete { id } => store.delete(*id, key).await,
    }
}

/// Structural checks shared by store implementations.
pub fn validate_title(title: &str, max_len: usize) -> Result<()> {
    if title.trim().is_empty() {
        return Err(StoreError::Validation("title must not be empty".to_string()));
    }
    let len = title.chars().count();
    if len > max_len {
        return Err(StoreError::Validation(format!(
            "title is {} characters, maximum is {}",
            len, max_len
        )));
    }
    Ok(())
}
