use std::{fmt, str::FromStr};

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Plan tier. Declaration order is rank order.
#[derive(
  Clone,
  Copy,
  Debug,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  EnumIter,
  DeriveActiveEnum,
  Serialize,
  Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
  #[sea_orm(string_value = "free")]
  Free,
  #[sea_orm(string_value = "pro")]
  Pro,
  #[sea_orm(string_value = "team")]
  Team,
  #[sea_orm(string_value = "enterprise")]
  Enterprise,
}

impl Plan {
  pub fn rank(self) -> u8 {
    self as u8
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Plan::Free => "free",
      Plan::Pro => "pro",
      Plan::Team => "team",
      Plan::Enterprise => "enterprise",
    }
  }
}

impl fmt::Display for Plan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Plan {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "free" => Ok(Plan::Free),
      "pro" => Ok(Plan::Pro),
      "team" => Ok(Plan::Team),
      "enterprise" => Ok(Plan::Enterprise),
      other => Err(format!("unknown plan `{other}`")),
    }
  }
}

#[derive(
  Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum BillingType {
  #[sea_orm(string_value = "monthly")]
  Monthly,
  #[sea_orm(string_value = "annual")]
  Annual,
  #[sea_orm(string_value = "lifetime")]
  Lifetime,
}

#[derive(
  Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
  #[sea_orm(string_value = "active")]
  Active,
  #[sea_orm(string_value = "canceled")]
  Canceled,
  #[sea_orm(string_value = "past_due")]
  PastDue,
  #[sea_orm(string_value = "expired")]
  Expired,
  #[sea_orm(string_value = "revoked")]
  Revoked,
}

impl LicenseStatus {
  /// Status after a billing-driven transition. Revocation is an admin
  /// decision and is never undone by billing events.
  pub fn transition(self, next: LicenseStatus) -> LicenseStatus {
    if self == LicenseStatus::Revoked { self } else { next }
  }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "licenses")]
pub struct Model {
  #[sea_orm(primary_key)]
  pub id: i32,
  #[sea_orm(unique)]
  pub key: String,
  pub user_id: i32,
  pub plan: Plan,
  pub billing_type: BillingType,
  pub status: LicenseStatus,
  pub period_start: DateTime,
  /// Lifetime licenses carry [`crate::utils::lifetime_end`].
  pub period_end: DateTime,
  /// Idempotency anchor for subscription billing.
  #[sea_orm(unique)]
  pub subscription_id: Option<String>,
  /// Idempotency anchor for one-time (lifetime) purchases.
  #[sea_orm(unique)]
  pub session_id: Option<String>,
  pub revoked_reason: Option<String>,
  pub created_at: DateTime,
  pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(
    belongs_to = "super::user::Entity",
    from = "Column::UserId",
    to = "super::user::Column::Id"
  )]
  User,
  #[sea_orm(has_many = "super::machine::Entity")]
  Machine,
}

impl Related<super::user::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::User.def()
  }
}

impl Related<super::machine::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::Machine.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
