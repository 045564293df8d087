pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_users;
mod m20260301_000002_create_licenses;
mod m20260301_000003_create_machines;
mod m20260301_000004_create_usage_logs;
mod m20260301_000005_create_processed_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
  fn migrations() -> Vec<Box<dyn MigrationTrait>> {
    vec![
      Box::new(m20260301_000001_create_users::Migration),
      Box::new(m20260301_000002_create_licenses::Migration),
      Box::new(m20260301_000003_create_machines::Migration),
      Box::new(m20260301_000004_create_usage_logs::Migration),
      Box::new(m20260301_000005_create_processed_events::Migration),
    ]
  }
}
