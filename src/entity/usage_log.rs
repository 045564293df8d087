use json::Value;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// `Activate` and `Reactivate` entries double as the monthly machine-change
/// ledger.
#[derive(
  Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum UsageAction {
  #[sea_orm(string_value = "validate")]
  Validate,
  #[sea_orm(string_value = "activate")]
  Activate,
  #[sea_orm(string_value = "reactivate")]
  Reactivate,
  #[sea_orm(string_value = "deactivate")]
  Deactivate,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "usage_logs")]
pub struct Model {
  #[sea_orm(primary_key)]
  pub id: i32,
  pub license_id: i32,
  pub machine_id: Option<String>,
  pub action: UsageAction,
  pub metadata: Option<Value>,
  pub created_at: DateTime,
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
