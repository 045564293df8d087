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
          .table(Machines::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(Machines::Id)
              .integer()
              .not_null()
              .auto_increment()
              .primary_key(),
          )
          .col(ColumnDef::new(Machines::LicenseId).integer().not_null())
          .col(ColumnDef::new(Machines::MachineId).string().not_null())
          .col(
            ColumnDef::new(Machines::FingerprintType)
              .string()
              .not_null()
              .default("machine"),
          )
          .col(ColumnDef::new(Machines::Name).string().null())
          .col(ColumnDef::new(Machines::CiProvider).string().null())
          .col(ColumnDef::new(Machines::Metadata).json().null())
          .col(
            ColumnDef::new(Machines::IsActive).boolean().not_null().default(true),
          )
          .col(ColumnDef::new(Machines::FirstSeenAt).date_time().not_null())
          .col(ColumnDef::new(Machines::LastSeenAt).date_time().null())
          .col(ColumnDef::new(Machines::ResetAt).date_time().null())
          .foreign_key(
            ForeignKey::create()
              .name("fk_machines_license")
              .from(Machines::Table, Machines::LicenseId)
              .to(Licenses::Table, Licenses::Id)
              .on_delete(ForeignKeyAction::Cascade),
          )
          .to_owned(),
      )
      .await?;

    // One binding row per (license, machine); racing inserts rely on it.
    manager
      .create_index(
        Index::create()
          .name("idx_machines_license_machine")
          .table(Machines::Table)
          .col(Machines::LicenseId)
          .col(Machines::MachineId)
          .unique()
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager.drop_table(Table::drop().table(Machines::Table).to_owned()).await
  }
}

#[derive(DeriveIden)]
pub enum Machines {
  Table,
  Id,
  LicenseId,
  MachineId,
  FingerprintType,
  Name,
  CiProvider,
  Metadata,
  IsActive,
  FirstSeenAt,
  LastSeenAt,
  ResetAt,
}
