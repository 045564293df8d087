use json::Value;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  PartialEq,
  Eq,
  EnumIter,
  DeriveActiveEnum,
  Serialize,
  Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum FingerprintType {
  #[default]
  #[sea_orm(string_value = "machine")]
  Machine,
  #[sea_orm(string_value = "ci")]
  Ci,
  #[sea_orm(string_value = "container")]
  Container,
}

/// Binding of a machine fingerprint to a license. Rows are soft-deactivated
/// on deactivation and reactivated in place. A plan downgrade sets
/// `reset_at`, which keeps the device history but makes the next call bind
/// it like a new machine.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machines")]
pub struct Model {
  #[sea_orm(primary_key)]
  pub id: i32,
  pub license_id: i32,
  /// SHA-256 hex of the client fingerprint
  pub machine_id: String,
  pub fingerprint_type: FingerprintType,
  pub name: Option<String>,
  pub ci_provider: Option<String>,
  pub metadata: Option<Value>,
  pub is_active: bool,
  pub first_seen_at: DateTime,
  pub last_seen_at: Option<DateTime>,
  pub reset_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(
    belongs_to = "super::license::Entity",
    from = "Column::LicenseId",
    to = "super::license::Column::Id"
  )]
  License,
}

impl Related<super::license::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::License.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
