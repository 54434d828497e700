//! SQLite record store.
//!
//! Keyed mutations run inside one transaction together with the
//! `applied_mutations` lookup and insert, so a key is either applied with
//! its effect or not at all.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, LikeExpr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::schema::{self, AppliedMutations, Records};
use super::{validate_title, RecordFilter, RecordStore, Result, StoreConfig, StoreError};
use crate::model::{Operation, Record, RecordFields, RecordId, RecordPatch};

/// Record store persisted in SQLite.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    max_title_len: usize,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `config.path`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let store = Self::start(options, config).await?;
        info!(path = %config.path, "SQLite record store opened");
        Ok(store)
    }

    /// Store over a private in-memory database.
    pub async fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::start(options, config).await
    }

    async fn start(options: SqliteConnectOptions, config: &StoreConfig) -> Result<Self> {
        // One connection: writers never race on lock upgrades.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in schema::create_statements() {
            sqlx::query(&statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            max_title_len: config.max_title_len,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_columns() -> [Records; 4] {
    [
        Records::Id,
        Records::Title,
        Records::Content,
        Records::CreatedAt,
    ]
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("Corrupt timestamp '{}': {}", value, e)))
}

/// Escape LIKE wildcards so the filter matches them literally. Pairs with
/// `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Record {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

async fn fetch(conn: &mut SqliteConnection, id: RecordId) -> Result<Option<Record>> {
    let select = Query::select()
        .columns(record_columns())
        .from(Records::Table)
        .and_where(Expr::col(Records::Id).eq(id))
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&select).fetch_optional(&mut *conn).await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Result recorded for `key`, if it was already applied.
async fn applied(conn: &mut SqliteConnection, key: &str) -> Result<Option<Record>> {
    let select = Query::select()
        .columns([AppliedMutations::Operation, AppliedMutations::RecordData])
        .from(AppliedMutations::Table)
        .and_where(Expr::col(AppliedMutations::IdempotencyKey).eq(key))
        .to_string(SqliteQueryBuilder);

    let Some(row) = sqlx::query(&select).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };

    let operation: String = row.try_get("operation")?;
    let data: String = row.try_get("record_data")?;
    let record: Record = serde_json::from_str(&data)
        .map_err(|e| StoreError::Unavailable(format!("Corrupt applied mutation '{}': {}", key, e)))?;

    debug!(key, operation = %operation, record_id = record.id, "Idempotency key already applied");
    Ok(Some(record))
}

async fn remember(
    conn: &mut SqliteConnection,
    key: &str,
    operation: Operation,
    record: &Record,
) -> Result<()> {
    let data = serde_json::to_string(record)
        .map_err(|e| StoreError::Unavailable(format!("Failed to encode record: {}", e)))?;

    let insert = Query::insert()
        .into_table(AppliedMutations::Table)
        .columns([
            AppliedMutations::IdempotencyKey,
            AppliedMutations::Operation,
            AppliedMutations::RecordData,
            AppliedMutations::AppliedAt,
        ])
        .values_panic([
            key.into(),
            operation.as_str().into(),
            data.into(),
            Utc::now().to_rfc3339().into(),
        ])
        .to_string(SqliteQueryBuilder);

    sqlx::query(&insert).execute(&mut *conn).await?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, fields: &RecordFields, key: Option<&str>) -> Result<Record> {
        validate_title(&fields.title, self.max_title_len)?;

        let mut tx = self.pool.begin().await?;
        if let Some(key) = key {
            if let Some(record) = applied(&mut tx, key).await? {
                return Ok(record);
            }
        }

        let created_at = Utc::now();
        let insert = Query::insert()
            .into_table(Records::Table)
            .columns([Records::Title, Records::Content, Records::CreatedAt])
            .values_panic([
                fields.title.as_str().into(),
                fields.content.as_str().into(),
                created_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        let id = sqlx::query(&insert)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let record = Record {
            id,
            title: fields.title.clone(),
            content: fields.content.clone(),
            created_at,
        };

        if let Some(key) = key {
            remember(&mut tx, key, Operation::Create, &record).await?;
        }
        tx.commit().await?;

        debug!(record_id = id, "Record created");
        Ok(record)
    }

    async fn update(
        &self,
        id: RecordId,
        patch: &RecordPatch,
        key: Option<&str>,
    ) -> Result<Record> {
        let patch = patch.clone().normalized();
        if let Some(title) = &patch.title {
            validate_title(title, self.max_title_len)?;
        }

        let mut tx = self.pool.begin().await?;
        if let Some(key) = key {
            if let Some(record) = applied(&mut tx, key).await? {
                return Ok(record);
            }
        }

        let mut record = fetch(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound { id })?;

        let mut update = Query::update();
        update
            .table(Records::Table)
            .and_where(Expr::col(Records::Id).eq(id));
        let mut changed = false;
        if let Some(title) = patch.title {
            update.value(Records::Title, title.as_str());
            record.title = title;
            changed = true;
        }
        if let Some(content) = patch.content {
            update.value(Records::Content, content.as_str());
            record.content = content;
            changed = true;
        }

        if changed {
            sqlx::query(&update.to_string(SqliteQueryBuilder))
                .execute(&mut *tx)
                .await?;
        }
        if let Some(key) = key {
            remember(&mut tx, key, Operation::Update, &record).await?;
        }
        tx.commit().await?;

        debug!(record_id = id, changed, "Record updated");
        Ok(record)
    }

    async fn delete(&self, id: RecordId, key: Option<&str>) -> Result<Record> {
        let mut tx = self.pool.begin().await?;
        if let Some(key) = key {
            if let Some(record) = applied(&mut tx, key).await? {
                return Ok(record);
            }
        }

        let record = fetch(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound { id })?;

        let delete = Query::delete()
            .from_table(Records::Table)
            .and_where(Expr::col(Records::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete).execute(&mut *tx).await?;

        if let Some(key) = key {
            remember(&mut tx, key, Operation::Delete, &record).await?;
        }
        tx.commit().await?;

        debug!(record_id = id, "Record deleted");
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound { id })
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut select = Query::select();
        select
            .columns(record_columns())
            .from(Records::Table)
            .order_by(Records::Id, Order::Asc);

        if let Some(text) = filter.title_contains.as_deref().filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", escape_like(text));
            select.and_where(Expr::col(Records::Title).like(LikeExpr::new(pattern).escape('\\')));
        }
        if let Some(after) = filter.after_id {
            select.and_where(Expr::col(Records::Id).gt(after));
        }
        if let Some(limit) = filter.limit {
            select.limit(limit);
        }

        let rows = sqlx::query(&select.to_string(SqliteQueryBuilder))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let statements = [
            Query::delete()
                .from_table(Records::Table)
                .to_string(SqliteQueryBuilder),
            Query::delete()
                .from_table(AppliedMutations::Table)
                .to_string(SqliteQueryBuilder),
            Query::delete()
                .from_table(Alias::new("sqlite_sequence"))
                .and_where(Expr::col(Alias::new("name")).eq("records"))
                .to_string(SqliteQueryBuilder),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        warn!("Record store reset, all records removed");
        Ok(())
    }

    fn supports_idempotency(&self) -> bool {
        true
    }
}
