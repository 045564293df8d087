use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Idempotency ledger of applied billing events.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_events")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub event_id: String,
  pub event_type: String,
  pub processed_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
