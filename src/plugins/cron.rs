//! Periodic housekeeping: KV expiry sweep and ledger retention

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time;

use crate::{plugins::Plugin, prelude::*, state::AppState};

const SWEEP_EVERY: Duration = Duration::from_secs(60);
/// Retention pruning runs once per this many sweeps.
const PRUNE_EVERY: u32 = 60;

pub struct Housekeeping;

impl Housekeeping {
  pub async fn prune(app: &AppState, now: DateTime) -> Result<(u64, u64)> {
    let sv = app.sv();
    let events = sv.events.prune(now - app.config.event_retention).await?;
    let usage = sv.usage.prune(now - app.config.usage_retention).await?;
    Ok((events, usage))
  }
}

#[async_trait]
impl Plugin for Housekeeping {
  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()> {
    let mut interval = time::interval(SWEEP_EVERY);
    let mut ticks = 0u32;

    loop {
      interval.tick().await;

      let swept = app.kv.sweep();
      if swept > 0 {
        debug!(swept, "Expired rate-limit windows dropped");
      }

      if ticks % PRUNE_EVERY == 0 {
        match Self::prune(&app, utils::now()).await {
          Ok((events, usage)) => {
            info!(events, usage, "Retention pruning finished")
          }
          Err(err) => error!("Retention pruning failed: {err}"),
        }
      }
      ticks = ticks.wrapping_add(1);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    entity::{LicenseStatus, Plan, UsageAction},
    state::testing,
    sv,
  };

  #[tokio::test]
  async fn prune_respects_retention() {
    let app = testing::app().await;
    let now = utils::now();
    let sv = app.sv();

    for (id, age) in [("evt_old", 31), ("evt_new", 1)] {
      let at = now - TimeDelta::days(age);
      sv.events.claim(id, "invoice.paid", at).await.unwrap();
    }

    let license = sv::testing::license(
      &app.db,
      Plan::Pro,
      LicenseStatus::Active,
      now + TimeDelta::days(30),
    )
    .await;
    for age in [200, 10] {
      sv.usage
        .record(
          license.id,
          None,
          UsageAction::Validate,
          None,
          now - TimeDelta::days(age),
        )
        .await
        .unwrap();
    }

    assert_eq!(Housekeeping::prune(&app, now).await.unwrap(), (1, 1));
    assert!(sv.events.is_processed("evt_new").await.unwrap());
    assert!(!sv.events.is_processed("evt_old").await.unwrap());
  }
}
