use sea_orm_migration::prelude::*;

use super::m20260301_000002_create_licenses::Licenses;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(UsageLogs::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(UsageLogs::Id)
              .integer()
              .not_null()
              .auto_increment()
              .primary_key(),
          )
          .col(ColumnDef::new(UsageLogs::LicenseId).integer().not_null())
          .col(ColumnDef::new(UsageLogs::MachineId).string().null())
          .col(ColumnDef::new(UsageLogs::Action).string().not_null())
          .col(ColumnDef::new(UsageLogs::Metadata).json().null())
          .col(ColumnDef::new(UsageLogs::CreatedAt).date_time().not_null())
          .foreign_key(
            ForeignKey::create()
              .name("fk_usage_logs_license")
              .from(UsageLogs::Table, UsageLogs::LicenseId)
              .to(Licenses::Table, Licenses::Id)
              .on_delete(ForeignKeyAction::Cascade),
          )
          .to_owned(),
      )
      .await?;

    manager
      .create_index(
        Index::create()
          .name("idx_usage_logs_license_created")
          .table(UsageLogs::Table)
          .col(UsageLogs::LicenseId)
          .col(UsageLogs::CreatedAt)
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager.drop_table(Table::drop().table(UsageLogs::Table).to_owned()).await
  }
}

#[derive(DeriveIden)]
pub enum UsageLogs {
  Table,
  Id,
  LicenseId,
  MachineId,
  Action,
  Metadata,
  CreatedAt,
}
