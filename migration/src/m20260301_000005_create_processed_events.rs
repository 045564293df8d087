use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(ProcessedEvents::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(ProcessedEvents::EventId)
              .string()
              .not_null()
              .primary_key(),
          )
          .col(ColumnDef::new(ProcessedEvents::EventType).string().not_null())
          .col(
            ColumnDef::new(ProcessedEvents::ProcessedAt).date_time().not_null(),
          )
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .drop_table(Table::drop().table(ProcessedEvents::Table).to_owned())
      .await
  }
}

#[derive(DeriveIden)]
pub enum ProcessedEvents {
  Table,
  EventId,
  EventType,
  ProcessedAt,
}
