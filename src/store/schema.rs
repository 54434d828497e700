//! SQLite tables backing the record store.

use sea_query::{ColumnDef, Expr, Iden, SqliteQueryBuilder, Table};

#[derive(Iden)]
pub(super) enum Records {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "title"]
    Title,
    #[iden = "content"]
    Content,
    #[iden = "created_at"]
    CreatedAt,
}

/// One row per idempotency key that has been applied.
#[derive(Iden)]
pub(super) enum AppliedMutations {
    Table,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "operation"]
    Operation,
    /// JSON of the record returned when the key was first applied.
    #[iden = "record_data"]
    RecordData,
    #[iden = "applied_at"]
    AppliedAt,
}

pub(super) fn create_statements() -> Vec<String> {
    vec![
        Table::create()
            .table(Records::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(Records::Id)
                    .integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(Records::Title).text().not_null())
            .col(ColumnDef::new(Records::Content).text().not_null())
            .col(ColumnDef::new(Records::CreatedAt).text().not_null())
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(AppliedMutations::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(AppliedMutations::IdempotencyKey)
                    .text()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(AppliedMutations::Operation).text().not_null())
            .col(ColumnDef::new(AppliedMutations::RecordData).text().not_null())
            .col(
                ColumnDef::new(AppliedMutations::AppliedAt)
                    .text()
                    .not_null()
                    .default(Expr::cust("(datetime('now'))")),
            )
            .to_string(SqliteQueryBuilder),
    ]
}
