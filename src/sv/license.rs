use crate::{
  entity::{BillingType, LicenseStatus, Plan, license},
  keys,
  prelude::*,
};

/// Outcome of the status/grace check for a license that may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
  /// Inside the paid period (a canceled license keeps this until period end).
  Paid,
  /// Period ended, still accepted until `until`.
  Grace { until: DateTime },
  /// Lapsed. The stored status must become `expired`.
  Lapsed,
}

/// Pure status/grace evaluation. Hard rejections come back as errors.
pub fn standing(
  license: &license::Model,
  now: DateTime,
  grace: TimeDelta,
) -> Result<Standing> {
  let period_end = license.period_end;

  match license.status {
    LicenseStatus::Expired => Err(Error::LicenseExpired { period_end }),
    LicenseStatus::Revoked => {
      Err(Error::LicenseRevoked { reason: license.revoked_reason.clone() })
    }
    LicenseStatus::PastDue => Err(Error::LicensePastDue),
    LicenseStatus::Canceled if now < period_end => Ok(Standing::Paid),
    LicenseStatus::Canceled => Ok(Standing::Lapsed),
    LicenseStatus::Active if now <= period_end => Ok(Standing::Paid),
    LicenseStatus::Active if now - period_end <= grace => {
      Ok(Standing::Grace { until: period_end + grace })
    }
    LicenseStatus::Active => Ok(Standing::Lapsed),
  }
}

/// Idempotency anchor of a license: exactly one per billing model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
  Subscription(String),
  Session(String),
}

#[derive(Debug, Clone)]
pub struct NewLicense {
  pub user_id: i32,
  pub plan: Plan,
  pub billing_type: BillingType,
  pub status: LicenseStatus,
  pub period_start: DateTime,
  pub period_end: DateTime,
  pub anchor: Anchor,
}

/// Partial update applied by the reconciler.
#[derive(Debug, Clone, Default)]
pub struct Change {
  pub plan: Option<Plan>,
  pub billing_type: Option<BillingType>,
  pub status: Option<LicenseStatus>,
  pub period: Option<(DateTime, DateTime)>,
}

pub struct License<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<'a, C: ConnectionTrait> License<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn by_key(&self, key: &str) -> Result<Option<license::Model>> {
    let license = license::Entity::find()
      .filter(license::Column::Key.eq(key))
      .one(self.db)
      .await?;
    Ok(license)
  }

  pub async fn by_anchor(
    &self,
    anchor: &Anchor,
  ) -> Result<Option<license::Model>> {
    let filter = match anchor {
      Anchor::Subscription(id) => license::Column::SubscriptionId.eq(id),
      Anchor::Session(id) => license::Column::SessionId.eq(id),
    };
    Ok(license::Entity::find().filter(filter).one(self.db).await?)
  }

  pub async fn by_subscription(
    &self,
    subscription_id: &str,
  ) -> Result<Option<license::Model>> {
    self.by_anchor(&Anchor::Subscription(subscription_id.to_string())).await
  }

  pub async fn active_for_user(
    &self,
    user_id: i32,
  ) -> Result<Vec<license::Model>> {
    let licenses = license::Entity::find()
      .filter(license::Column::UserId.eq(user_id))
      .filter(license::Column::Status.eq(LicenseStatus::Active))
      .all(self.db)
      .await?;
    Ok(licenses)
  }

  /// Creates the license for `new.anchor` unless one exists. Returns the row
  /// and whether this call created it. Two racing deliveries both reaching
  /// the insert resolve through the anchor's unique index.
  pub async fn create(
    &self,
    new: NewLicense,
  ) -> Result<(license::Model, bool)> {
    if let Some(existing) = self.by_anchor(&new.anchor).await? {
      return Ok((existing, false));
    }

    let now = utils::now();
    let (subscription_id, session_id) = match &new.anchor {
      Anchor::Subscription(id) => (Some(id.clone()), None),
      Anchor::Session(id) => (None, Some(id.clone())),
    };

    let license = license::ActiveModel {
      key: Set(keys::generate_license_key()),
      user_id: Set(new.user_id),
      plan: Set(new.plan),
      billing_type: Set(new.billing_type),
      status: Set(new.status),
      period_start: Set(new.period_start),
      period_end: Set(new.period_end),
      subscription_id: Set(subscription_id),
      session_id: Set(session_id),
      revoked_reason: Set(None),
      created_at: Set(now),
      updated_at: Set(now),
      ..Default::default()
    };

    match license.insert(self.db).await {
      Ok(license) => {
        info!(
          key = %utils::truncate_id(&license.key),
          plan = %license.plan,
          "License created"
        );
        Ok((license, true))
      }
      Err(err) if utils::is_unique_violation(&err) => {
        let existing = self.by_anchor(&new.anchor).await?.ok_or_else(|| {
          Error::Internal(format!("license insert conflict: {err}"))
        })?;
        debug!("License insert raced, using existing row");
        Ok((existing, false))
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Applies `change`. Status goes through [`LicenseStatus::transition`], so
  /// a revoked license stays revoked.
  pub async fn apply(
    &self,
    license: license::Model,
    change: Change,
  ) -> Result<license::Model> {
    let status = change.status.map(|next| license.status.transition(next));
    let mut model: license::ActiveModel = license.into();

    if let Some(plan) = change.plan {
      model.plan = Set(plan);
    }
    if let Some(billing_type) = change.billing_type {
      model.billing_type = Set(billing_type);
    }
    if let Some(status) = status {
      model.status = Set(status);
    }
    if let Some((start, end)) = change.period {
      model.period_start = Set(start);
      model.period_end = Set(end);
    }
    model.updated_at = Set(utils::now());

    Ok(model.update(self.db).await?)
  }

  pub async fn set_status(
    &self,
    license: license::Model,
    status: LicenseStatus,
  ) -> Result<license::Model> {
    self.apply(license, Change { status: Some(status), ..Default::default() })
      .await
  }

  /// Status/grace gate shared by validate and activate. A lapsed license is
  /// persisted as expired before being rejected.
  pub async fn check(
    &self,
    license: &license::Model,
    grace: TimeDelta,
    now: DateTime,
  ) -> Result<Standing> {
    match standing(license, now, grace)? {
      Standing::Lapsed => {
        let period_end = license.period_end;
        self.set_status(license.clone(), LicenseStatus::Expired).await?;
        info!(
          key = %utils::truncate_id(&license.key),
          "License lapsed and marked expired"
        );
        Err(Error::LicenseExpired { period_end })
      }
      standing => Ok(standing),
    }
  }
}
