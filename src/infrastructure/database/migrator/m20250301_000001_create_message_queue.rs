//! Create message_queue table
//!
//! Persisted outbound transactional messages awaiting CSMS acknowledgement.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MessageQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MessageQueue::UniqueId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MessageQueue::Action).string().not_null())
                    .col(ColumnDef::new(MessageQueue::Payload).text().not_null())
                    .col(ColumnDef::new(MessageQueue::TransactionId).string())
                    .col(
                        ColumnDef::new(MessageQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(MessageQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_message_queue_created")
                    .table(MessageQueue::Table)
                    .col(MessageQueue::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_message_queue_transaction")
                    .table(MessageQueue::Table)
                    .col(MessageQueue::TransactionId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MessageQueue::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum MessageQueue {
    Table,
    UniqueId,
    Action,
    Payload,
    TransactionId,
    Attempts,
    CreatedAt,
}
