use crate::{entity::processed_event, prelude::*};

/// Idempotency ledger of applied billing events.
pub struct Events<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<'a, C: ConnectionTrait> Events<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn is_processed(&self, event_id: &str) -> Result<bool> {
    let found = processed_event::Entity::find_by_id(event_id)
      .one(self.db)
      .await?;
    Ok(found.is_some())
  }

  /// Records `event_id` and reports whether this call did. `false` means an
  /// earlier or concurrent delivery already holds the event. Run it inside
  /// the transaction that applies the event so both commit together.
  pub async fn claim(
    &self,
    event_id: &str,
    event_type: &str,
    now: DateTime,
  ) -> Result<bool> {
    let row = processed_event::ActiveModel {
      event_id: Set(event_id.to_string()),
      event_type: Set(event_type.to_string()),
      processed_at: Set(now),
    };

    match row.insert(self.db).await {
      Ok(_) => Ok(true),
      Err(err) if utils::is_unique_violation(&err) => Ok(false),
      Err(err) => Err(err.into()),
    }
  }

  pub async fn prune(&self, before: DateTime) -> Result<u64> {
    let result = processed_event::Entity::delete_many()
      .filter(processed_event::Column::ProcessedAt.lt(before))
      .exec(self.db)
      .await?;
    Ok(result.rows_affected)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sv::testing;

  #[tokio::test]
  async fn claim_is_granted_once() {
    let db = testing::db().await;
    let sv = Events::new(&db);
    let now = utils::now();

    assert!(!sv.is_processed("evt_1").await.unwrap());
    assert!(sv.claim("evt_1", "invoice.paid", now).await.unwrap());
    assert!(!sv.claim("evt_1", "invoice.paid", now).await.unwrap());
    assert!(sv.is_processed("evt_1").await.unwrap());

    let old = now - TimeDelta::days(40);
    assert!(sv.claim("evt_0", "invoice.paid", old).await.unwrap());
    assert_eq!(sv.prune(now - TimeDelta::days(30)).await.unwrap(), 1);
    assert!(sv.is_processed("evt_1").await.unwrap());
  }

  #[tokio::test]
  async fn rolled_back_claim_is_released() {
    let db = testing::db().await;
    let now = utils::now();

    let txn = db.begin().await.unwrap();
    assert!(Events::new(&txn).claim("evt_1", "invoice.paid", now).await.unwrap());
    txn.rollback().await.unwrap();

    assert!(!Events::new(&db).is_processed("evt_1").await.unwrap());
  }
}
