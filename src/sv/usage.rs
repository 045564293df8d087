use json::Value;

use crate::{
  entity::{UsageAction, usage_log},
  prelude::*,
};

/// Append-only usage ledger. Entries are never updated.
pub struct Usage<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<'a, C: ConnectionTrait> Usage<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn record(
    &self,
    license_id: i32,
    machine_id: Option<&str>,
    action: UsageAction,
    metadata: Option<Value>,
    now: DateTime,
  ) -> Result<()> {
    usage_log::ActiveModel {
      license_id: Set(license_id),
      machine_id: Set(machine_id.map(str::to_string)),
      action: Set(action),
      metadata: Set(metadata),
      created_at: Set(now),
      ..Default::default()
    }
    .insert(self.db)
    .await?;
    Ok(())
  }

  pub async fn count_since(
    &self,
    license_id: i32,
    actions: &[UsageAction],
    since: DateTime,
  ) -> Result<u64> {
    let count = usage_log::Entity::find()
      .filter(usage_log::Column::LicenseId.eq(license_id))
      .filter(usage_log::Column::Action.is_in(actions.iter().copied()))
      .filter(usage_log::Column::CreatedAt.gte(since))
      .count(self.db)
      .await?;
    Ok(count)
  }

  /// Binding creations and reactivations in the current UTC month.
  pub async fn monthly_changes(
    &self,
    license_id: i32,
    now: DateTime,
  ) -> Result<u64> {
    self
      .count_since(
        license_id,
        &[UsageAction::Activate, UsageAction::Reactivate],
        utils::month_start(now),
      )
      .await
  }

  pub async fn monthly_scans(
    &self,
    license_id: i32,
    now: DateTime,
  ) -> Result<u64> {
    self
      .count_since(license_id, &[UsageAction::Validate], utils::month_start(now))
      .await
  }

  pub async fn prune(&self, before: DateTime) -> Result<u64> {
    let result = usage_log::Entity::delete_many()
      .filter(usage_log::Column::CreatedAt.lt(before))
      .exec(self.db)
      .await?;
    Ok(result.rows_affected)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    entity::{LicenseStatus, Plan},
    sv::testing,
  };

  #[tokio::test]
  async fn monthly_counters_split_by_action() {
    let db = testing::db().await;
    let now = utils::now();
    let license = testing::license(
      &db,
      Plan::Pro,
      LicenseStatus::Active,
      now + TimeDelta::days(30),
    )
    .await;
    let sv = Usage::new(&db);
    let last_month = utils::month_start(now) - TimeDelta::hours(1);

    for action in [
      UsageAction::Activate,
      UsageAction::Reactivate,
      UsageAction::Deactivate,
      UsageAction::Validate,
      UsageAction::Validate,
    ] {
      sv.record(license.id, Some("m"), action, None, now).await.unwrap();
    }
    sv.record(license.id, None, UsageAction::Activate, None, last_month)
      .await
      .unwrap();

    assert_eq!(sv.monthly_changes(license.id, now).await.unwrap(), 2);
    assert_eq!(sv.monthly_scans(license.id, now).await.unwrap(), 2);

    assert_eq!(sv.prune(utils::month_start(now)).await.unwrap(), 1);
  }
}
