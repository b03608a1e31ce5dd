//! Create transactions table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Transactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Transactions::TransactionId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Transactions::EvseId).integer().not_null())
                    .col(
                        ColumnDef::new(Transactions::ConnectorId)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::IdToken).string().not_null())
                    .col(ColumnDef::new(Transactions::GroupIdToken).string())
                    .col(ColumnDef::new(Transactions::ReservationId).integer())
                    .col(ColumnDef::new(Transactions::RemoteStartId).integer())
                    .col(
                        ColumnDef::new(Transactions::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::StartMeterWh)
                            .double()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::SeqNo)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Transactions::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Transactions::StopTime).timestamp_with_time_zone())
                    .col(ColumnDef::new(Transactions::StopMeterWh).double())
                    .col(ColumnDef::new(Transactions::StopReason).string())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_active")
                    .table(Transactions::Table)
                    .col(Transactions::Active)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_evse")
                    .table(Transactions::Table)
                    .col(Transactions::EvseId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Transactions {
    Table,
    TransactionId,
    EvseId,
    ConnectorId,
    IdToken,
    GroupIdToken,
    ReservationId,
    RemoteStartId,
    StartTime,
    StartMeterWh,
    SeqNo,
    Active,
    StopTime,
    StopMeterWh,
    StopReason,
}
