//! SQLite tables backing the embedded broker.

use sea_query::{ColumnDef, Iden, Index, SqliteQueryBuilder, Table};

#[derive(Iden)]
pub(super) enum QueueMessages {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "queue"]
    Queue,
    #[iden = "body"]
    Body,
    #[iden = "redelivery_count"]
    RedeliveryCount,
    /// Dispatch order. Requeued messages get a fresh, larger value.
    #[iden = "seq"]
    Seq,
    #[iden = "enqueued_at"]
    EnqueuedAt,
}

#[derive(Iden)]
pub(super) enum DeadLetters {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "queue"]
    Queue,
    #[iden = "body"]
    Body,
    #[iden = "reason"]
    Reason,
    #[iden = "redelivery_count"]
    RedeliveryCount,
    #[iden = "dead_lettered_at"]
    DeadLetteredAt,
}

/// DDL statements, in execution order.
pub(super) fn create_statements() -> Vec<String> {
    vec![
        Table::create()
            .table(QueueMessages::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(QueueMessages::Id)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(QueueMessages::Queue).text().not_null())
            .col(ColumnDef::new(QueueMessages::Body).text().not_null())
            .col(
                ColumnDef::new(QueueMessages::RedeliveryCount)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(QueueMessages::Seq).big_integer().not_null())
            .col(ColumnDef::new(QueueMessages::EnqueuedAt).text().not_null())
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_queue_messages_queue_seq")
            .table(QueueMessages::Table)
            .col(QueueMessages::Queue)
            .col(QueueMessages::Seq)
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(DeadLetters::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(DeadLetters::Id)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(DeadLetters::Queue).text().not_null())
            .col(ColumnDef::new(DeadLetters::Body).text().not_null())
            .col(ColumnDef::new(DeadLetters::Reason).text().not_null())
            .col(
                ColumnDef::new(DeadLetters::RedeliveryCount)
                    .integer()
                    .not_null(),
            )
            .col(ColumnDef::new(DeadLetters::DeadLetteredAt).text().not_null())
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_dead_letters_queue")
            .table(DeadLetters::Table)
            .col(DeadLetters::Queue)
            .to_string(SqliteQueryBuilder),
    ]
}
