//! Machine binding state machine
//!
//! A (license, machine) pair is in one of three states at request time:
//!
//! ```text
//!   Unknown ──create──▶ Active ◀──reactivate── Deactivated
//!                        │  ▲                      ▲
//!                        │  └── refresh (no cost)  │
//!                        └────── deactivate ───────┘
//! ```
//!
//! Creation and reactivation each cost one monthly change. Refreshes and
//! deactivations are free. Rows released by a plan downgrade keep their
//! history but bind again through the Unknown path.

use json::Value;
use sea_orm::{Condition, sea_query::Expr};

use crate::{
  config::{self, PlanLimits},
  entity::{FingerprintType, UsageAction, license, machine},
  limits::{DeviceCounts, UsageThrottle},
  prelude::*,
  sv,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
  Active(machine::Model),
  Deactivated(machine::Model),
  /// Forced out by a downgrade. Treated as unknown, but the row is reused.
  Released(machine::Model),
  Unknown,
}

impl From<Option<machine::Model>> for Binding {
  fn from(row: Option<machine::Model>) -> Self {
    match row {
      Some(row) if row.reset_at.is_some() => Binding::Released(row),
      Some(row) if row.is_active => Binding::Active(row),
      Some(row) => Binding::Deactivated(row),
      None => Binding::Unknown,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  /// Already active. `touch` says whether `last_seen_at` is due a refresh.
  Refreshed { touch: bool },
  Reactivated,
  Created,
}

/// Client-reported identity of the device being bound.
#[derive(Debug, Clone, Default)]
pub struct Device {
  pub machine_id: String,
  pub kind: FingerprintType,
  pub name: Option<String>,
  pub ci_provider: Option<String>,
  pub metadata: Option<Value>,
}

/// Limits in force for one binding decision.
pub struct Rules<'c> {
  pub limits: &'c PlanLimits,
  pub change_cap: u32,
  pub ci_window: TimeDelta,
  pub throttle: UsageThrottle,
}

pub struct Machine<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<'a, C: ConnectionTrait> Machine<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn binding(
    &self,
    license_id: i32,
    machine_id: &str,
  ) -> Result<Binding> {
    let row = machine::Entity::find()
      .filter(machine::Column::LicenseId.eq(license_id))
      .filter(machine::Column::MachineId.eq(machine_id))
      .one(self.db)
      .await?;
    Ok(row.into())
  }

  /// Active bindings that count against the plan's machine limit.
  pub async fn active(&self, license_id: i32) -> Result<Vec<machine::Model>> {
    let rows = machine::Entity::find()
      .filter(machine::Column::LicenseId.eq(license_id))
      .filter(machine::Column::IsActive.eq(true))
      .filter(machine::Column::FingerprintType.ne(FingerprintType::Ci))
      .order_by_asc(machine::Column::FirstSeenAt)
      .all(self.db)
      .await?;
    Ok(rows)
  }

  pub async fn all(&self, license_id: i32) -> Result<Vec<machine::Model>> {
    let rows = machine::Entity::find()
      .filter(machine::Column::LicenseId.eq(license_id))
      .order_by_asc(machine::Column::FirstSeenAt)
      .all(self.db)
      .await?;
    Ok(rows)
  }

  pub async fn active_count(&self, license_id: i32) -> Result<u64> {
    let count = machine::Entity::find()
      .filter(machine::Column::LicenseId.eq(license_id))
      .filter(machine::Column::IsActive.eq(true))
      .filter(machine::Column::FingerprintType.ne(FingerprintType::Ci))
      .count(self.db)
      .await?;
    Ok(count)
  }

  /// Distinct active CI bindings seen since `since`.
  pub async fn ci_seen(&self, license_id: i32, since: DateTime) -> Result<u64> {
    let count = machine::Entity::find()
      .filter(machine::Column::LicenseId.eq(license_id))
      .filter(machine::Column::IsActive.eq(true))
      .filter(machine::Column::FingerprintType.eq(FingerprintType::Ci))
      .filter(seen_since(since))
      .count(self.db)
      .await?;
    Ok(count)
  }

  /// Non-CI device activity fed to the abuse detector, as it would stand
  /// once `device` is seen at this request. Counted before any binding is
  /// written so a rejection leaves no trace.
  pub async fn device_counts(
    &self,
    license_id: i32,
    device: &Device,
    active_since: DateTime,
    new_since: DateTime,
  ) -> Result<DeviceCounts> {
    let others = || {
      machine::Entity::find()
        .filter(machine::Column::LicenseId.eq(license_id))
        .filter(machine::Column::FingerprintType.ne(FingerprintType::Ci))
        .filter(machine::Column::MachineId.ne(device.machine_id.as_str()))
    };

    let mut counts = DeviceCounts {
      active: others().filter(seen_since(active_since)).count(self.db).await?,
      new: others()
        .filter(machine::Column::FirstSeenAt.gte(new_since))
        .count(self.db)
        .await?,
    };

    if device.kind != FingerprintType::Ci {
      let known = self.binding(license_id, &device.machine_id).await?;
      let first_seen = match known {
        Binding::Active(row)
        | Binding::Deactivated(row)
        | Binding::Released(row) => Some(row.first_seen_at),
        Binding::Unknown => None,
      };
      counts.active += 1;
      if first_seen.is_none_or(|at| at >= new_since) {
        counts.new += 1;
      }
    }

    Ok(counts)
  }

  /// Resolves the pair and applies the matching transition. Every failure
  /// leaves the stored state untouched.
  pub async fn bind(
    &self,
    license: &license::Model,
    device: &Device,
    rules: &Rules<'_>,
    now: DateTime,
  ) -> Result<(machine::Model, Transition)> {
    match self.binding(license.id, &device.machine_id).await? {
      Binding::Active(row) => {
        let touch = rules.throttle.should_write(row.last_seen_at, now);
        Ok((row, Transition::Refreshed { touch }))
      }
      Binding::Deactivated(row) => {
        self.ensure_changes(license.id, rules, now).await?;
        self.ensure_capacity(license.id, row.fingerprint_type, rules, now).await?;

        let row = machine::ActiveModel {
          is_active: Set(true),
          last_seen_at: Set(Some(now)),
          ..row.into()
        }
        .update(self.db)
        .await?;

        self.record_change(&row, UsageAction::Reactivate, now).await;
        info!(
          machine = %utils::truncate_id(&row.machine_id),
          license_id = license.id,
          "Machine reactivated"
        );
        Ok((row, Transition::Reactivated))
      }
      Binding::Released(row) => {
        self.ensure_capacity(license.id, device.kind, rules, now).await?;
        self.ensure_changes(license.id, rules, now).await?;
        self.rebind(row, device, now).await
      }
      Binding::Unknown => {
        self.ensure_capacity(license.id, device.kind, rules, now).await?;
        self.ensure_changes(license.id, rules, now).await?;
        self.create(license.id, device, now).await
      }
    }
  }

  async fn rebind(
    &self,
    row: machine::Model,
    device: &Device,
    now: DateTime,
  ) -> Result<(machine::Model, Transition)> {
    let result = machine::Entity::update_many()
      .set(machine::ActiveModel {
        fingerprint_type: Set(device.kind),
        is_active: Set(true),
        last_seen_at: Set(Some(now)),
        reset_at: Set(None),
        ..Default::default()
      })
      .filter(machine::Column::Id.eq(row.id))
      .filter(machine::Column::ResetAt.is_not_null())
      .exec(self.db)
      .await?;

    let fresh = machine::Entity::find_by_id(row.id)
      .one(self.db)
      .await?
      .ok_or_else(|| Error::Internal(format!("machine {} vanished", row.id)))?;

    // a concurrent request rebound it first
    if result.rows_affected == 0 {
      return Ok((fresh, Transition::Refreshed { touch: false }));
    }

    self.record_change(&fresh, UsageAction::Activate, now).await;
    info!(
      machine = %utils::truncate_id(&fresh.machine_id),
      license_id = fresh.license_id,
      "Machine bound again after reset"
    );
    Ok((fresh, Transition::Created))
  }

  async fn create(
    &self,
    license_id: i32,
    device: &Device,
    now: DateTime,
  ) -> Result<(machine::Model, Transition)> {
    let row = machine::ActiveModel {
      license_id: Set(license_id),
      machine_id: Set(device.machine_id.clone()),
      fingerprint_type: Set(device.kind),
      name: Set(device.name.clone()),
      ci_provider: Set(device.ci_provider.clone()),
      metadata: Set(device.metadata.clone()),
      is_active: Set(true),
      first_seen_at: Set(now),
      last_seen_at: Set(Some(now)),
      reset_at: Set(None),
      ..Default::default()
    };

    match row.insert(self.db).await {
      Ok(row) => {
        self.record_change(&row, UsageAction::Activate, now).await;
        info!(
          machine = %utils::truncate_id(&row.machine_id),
          license_id,
          kind = ?row.fingerprint_type,
          "Machine bound"
        );
        Ok((row, Transition::Created))
      }
      // a concurrent request bound the same machine first
      Err(err) if utils::is_unique_violation(&err) => {
        match self.binding(license_id, &device.machine_id).await? {
          Binding::Active(row)
          | Binding::Deactivated(row)
          | Binding::Released(row) => {
            debug!("Machine insert raced, using existing row");
            Ok((row, Transition::Refreshed { touch: false }))
          }
          Binding::Unknown => Err(err.into()),
        }
      }
      Err(err) => Err(err.into()),
    }
  }

  async fn ensure_changes(
    &self,
    license_id: i32,
    rules: &Rules<'_>,
    now: DateTime,
  ) -> Result<()> {
    let changes =
      sv::Usage::new(self.db).monthly_changes(license_id, now).await?;

    if changes >= rules.change_cap as u64 {
      return Err(Error::ChangeLimit {
        limit: rules.change_cap,
        resets_at: utils::next_month_start(now),
      });
    }
    Ok(())
  }

  async fn ensure_capacity(
    &self,
    license_id: i32,
    kind: FingerprintType,
    rules: &Rules<'_>,
    now: DateTime,
  ) -> Result<()> {
    if kind == FingerprintType::Ci {
      let seen = self.ci_seen(license_id, now - rules.ci_window).await?;
      if !config::within(rules.limits.ci_machines, seen) {
        return Err(Error::CiLimit { limit: rules.limits.ci_machines });
      }
      return Ok(());
    }

    let active = self.active(license_id).await?;
    if !config::within(rules.limits.machines, active.len() as u64) {
      return Err(Error::MachineLimit {
        limit: rules.limits.machines,
        active: active
          .iter()
          .map(|row| utils::truncate_id(&row.machine_id))
          .collect(),
      });
    }
    Ok(())
  }

  /// Change entries feed the monthly cap, so they are written in line. A
  /// failed write is logged and does not undo the transition.
  async fn record_change(
    &self,
    row: &machine::Model,
    action: UsageAction,
    now: DateTime,
  ) {
    if let Err(err) = sv::Usage::new(self.db)
      .record(row.license_id, Some(&row.machine_id), action, None, now)
      .await
    {
      warn!(license_id = row.license_id, "Change entry not recorded: {err}");
    }
  }

  /// Soft-deactivates the binding (no-op when inactive or unknown) and
  /// returns the remaining active count.
  pub async fn deactivate(
    &self,
    license_id: i32,
    machine_id: &str,
  ) -> Result<u64> {
    if let Binding::Active(row) = self.binding(license_id, machine_id).await? {
      machine::ActiveModel { is_active: Set(false), ..row.into() }
        .update(self.db)
        .await?;
      info!(
        machine = %utils::truncate_id(machine_id),
        license_id,
        "Machine deactivated"
      );
    }

    self.active_count(license_id).await
  }

  /// Force-deactivates every binding of the license so each machine goes
  /// through a fresh activation under the current plan's limit. First-seen
  /// times survive, so the abuse detector still knows these devices.
  pub async fn reset_all(&self, license_id: i32, now: DateTime) -> Result<u64> {
    let result = machine::Entity::update_many()
      .set(machine::ActiveModel {
        is_active: Set(false),
        reset_at: Set(Some(now)),
        ..Default::default()
      })
      .filter(machine::Column::LicenseId.eq(license_id))
      .exec(self.db)
      .await?;
    Ok(result.rows_affected)
  }

  pub async fn touch(&self, id: i32, now: DateTime) -> Result<()> {
    machine::Entity::update_many()
      .col_expr(machine::Column::LastSeenAt, Expr::value(Some(now)))
      .filter(machine::Column::Id.eq(id))
      .exec(self.db)
      .await?;
    Ok(())
  }
}

/// `last_seen_at` (or `first_seen_at` when never refreshed) at or after
/// `since`.
fn seen_since(since: DateTime) -> Condition {
  Condition::any().add(machine::Column::LastSeenAt.gte(since)).add(
    Condition::all()
      .add(machine::Column::LastSeenAt.is_null())
      .add(machine::Column::FirstSeenAt.gte(since)),
  )
}
