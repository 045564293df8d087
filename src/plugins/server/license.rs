//! Validate / activate / deactivate
//!
//! Request path: rate limit, machine signature, license lookup, status and
//! grace check, abuse check (validate only), binding transition, throttled
//! writes, artifact issuance. The abuse check counts the calling device
//! ahead of the transition so a rejection writes nothing.

use std::sync::Arc;

use axum::extract::State;
use json::{Value, json};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::extract::{ClientAddr, Json};
use crate::{
  entity::{FingerprintType, LicenseStatus, Plan, UsageAction, license},
  keys,
  limits::{Endpoint, RateLimitHeaders},
  prelude::*,
  state::AppState,
  sv::{self, Device, Standing, Transition},
};

#[derive(Debug, Deserialize)]
pub struct ValidateReq {
  pub license_key: String,
  pub machine_id: String,
  pub cli_version: Option<String>,
  pub machine_signature: Option<String>,
  pub timestamp: Option<i64>,
  #[serde(default)]
  pub fingerprint_type: FingerprintType,
  pub ci_provider: Option<String>,
  pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct UsageView {
  pub scans_this_month: u64,
  pub scans_limit: i32,
  pub machines_used: u64,
  pub machines_limit: i32,
}

#[derive(Debug, Serialize)]
pub struct ValidateRes {
  pub valid: bool,
  pub plan: Plan,
  pub status: LicenseStatus,
  pub features: Vec<String>,
  pub usage: UsageView,
  /// `None` for lifetime licenses.
  pub expires_at: Option<String>,
  pub cache_until: String,
  pub license_blob: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lease_token: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateReq {
  pub license_key: String,
  pub machine_fingerprint: String,
  pub machine_name: Option<String>,
  pub machine_signature: Option<String>,
  pub timestamp: Option<i64>,
  #[serde(default)]
  pub fingerprint_type: FingerprintType,
  pub ci_provider: Option<String>,
  pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ActivateRes {
  pub activated: bool,
  pub license_blob: String,
  pub plan: Plan,
  pub status: LicenseStatus,
  pub machines_used: u64,
  pub machines_limit: i32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lease_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeactivateReq {
  pub license_key: String,
  pub machine_fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct DeactivateRes {
  pub deactivated: bool,
  pub machines_remaining: u64,
}

/// Unknown keys answer after a random delay to blunt enumeration by timing.
async fn find(app: &AppState, key: &str) -> Result<license::Model> {
  if let Some(license) = app.sv().license.by_key(key).await? {
    return Ok(license);
  }

  let delay = rand::thread_rng().gen_range(app.config.not_found_delay.clone());
  tokio::time::sleep(Duration::from_millis(delay)).await;
  debug!(key = %utils::truncate_id(key), "Unknown license key");
  Err(Error::LicenseNotFound)
}

struct Authorized {
  license: license::Model,
  machine_id: String,
  standing: Standing,
}

async fn authorize(
  app: &AppState,
  license_key: &str,
  machine_id: &str,
  signature: Option<&str>,
  timestamp: Option<i64>,
  now: DateTime,
) -> Result<Authorized> {
  let key = keys::normalize_license_key(license_key)?;
  let machine_id = keys::normalize_machine_id(machine_id)?;

  if let Some(check) = &app.machine_signature {
    check.check(&machine_id, signature, timestamp, now)?;
  }

  let license = find(app, &key).await?;
  let standing =
    app.sv().license.check(&license, app.config.grace_period, now).await?;

  Ok(Authorized { license, machine_id, standing })
}

fn log_usage(
  app: &AppState,
  license_id: i32,
  machine_id: &str,
  action: UsageAction,
  metadata: Option<Value>,
  now: DateTime,
) {
  let db = app.db.clone();
  let machine_id = machine_id.to_string();
  utils::detach("usage log", async move {
    sv::Usage::new(&db)
      .record(license_id, Some(&machine_id), action, metadata, now)
      .await
  });
}

fn touch_if_due(app: &AppState, transition: Transition, id: i32, now: DateTime) {
  if transition == (Transition::Refreshed { touch: true }) {
    let db = app.db.clone();
    utils::detach("last seen", async move {
      sv::Machine::new(&db).touch(id, now).await
    });
  }
}

fn sign_blob(
  app: &AppState,
  license: &license::Model,
  machine_id: &str,
  now: DateTime,
) -> Result<String> {
  let limits = app.config.plans.limits(license.plan);
  app.signer.sign(&app.signer.payload(license, machine_id, limits, now))
}

fn lease_token(
  app: &AppState,
  license: &license::Model,
  machine_id: &str,
  now: DateTime,
) -> Option<String> {
  app.lease.as_ref()?.try_mint(license, machine_id, now)
}

pub async fn validate(
  State(app): State<Arc<AppState>>,
  ClientAddr(client): ClientAddr,
  Json(req): Json<ValidateReq>,
) -> Result<(RateLimitHeaders, Json<ValidateRes>)> {
  let now = utils::now();
  let limits =
    app.limiter().allow(Endpoint::Validate, &client, utils::unix(now)).await?;

  let Authorized { license, machine_id, standing } = authorize(
    &app,
    &req.license_key,
    &req.machine_id,
    req.machine_signature.as_deref(),
    req.timestamp,
    now,
  )
  .await?;

  let sv = app.sv();
  let device = Device {
    machine_id,
    kind: req.fingerprint_type,
    name: None,
    ci_provider: req.ci_provider,
    metadata: req.metadata,
  };
  let abuse = &app.config.abuse;
  let counts = sv
    .machine
    .device_counts(
      license.id,
      &device,
      now - abuse.active_window,
      now - abuse.new_window,
    )
    .await?;
  let key = utils::truncate_id(&license.key);
  let warning = app.abuse().assess(counts).into_warning().inspect_err(
    |err| warn!(%key, ?counts, "Device activity rejected: {err}"),
  )?;
  if let Some(warning) = &warning {
    warn!(%key, ?counts, "{warning}");
  }

  let (binding, transition) =
    sv.machine.bind(&license, &device, &app.rules(license.plan), now).await?;

  touch_if_due(&app, transition, binding.id, now);
  let scans = sv.usage.monthly_scans(license.id, now).await? + 1;
  log_usage(
    &app,
    license.id,
    &device.machine_id,
    UsageAction::Validate,
    req.cli_version.map(|version| json!({ "cli_version": version })),
    now,
  );

  let plan_limits = app.config.plans.limits(license.plan);
  let cache_until = match standing {
    Standing::Grace { until } => until.min(now + app.config.cache_ttl),
    _ => now + app.config.cache_ttl,
  };

  let response = ValidateRes {
    valid: true,
    plan: license.plan,
    status: license.status,
    features: plan_limits.features.clone(),
    usage: UsageView {
      scans_this_month: scans,
      scans_limit: plan_limits.monthly_scans,
      machines_used: sv.machine.active_count(license.id).await?,
      machines_limit: plan_limits.machines,
    },
    expires_at: (!utils::is_lifetime(license.period_end))
      .then(|| utils::rfc3339(license.period_end)),
    cache_until: utils::rfc3339(cache_until),
    license_blob: sign_blob(&app, &license, &device.machine_id, now)?,
    lease_token: lease_token(&app, &license, &device.machine_id, now),
    warning,
  };

  Ok((limits, Json(response)))
}

pub async fn activate(
  State(app): State<Arc<AppState>>,
  ClientAddr(client): ClientAddr,
  Json(req): Json<ActivateReq>,
) -> Result<(RateLimitHeaders, Json<ActivateRes>)> {
  let now = utils::now();
  let limits =
    app.limiter().allow(Endpoint::Activate, &client, utils::unix(now)).await?;

  let Authorized { license, machine_id, .. } = authorize(
    &app,
    &req.license_key,
    &req.machine_fingerprint,
    req.machine_signature.as_deref(),
    req.timestamp,
    now,
  )
  .await?;

  let sv = app.sv();
  let device = Device {
    machine_id,
    kind: req.fingerprint_type,
    name: req.machine_name,
    ci_provider: req.ci_provider,
    metadata: req.metadata,
  };
  let (binding, transition) =
    sv.machine.bind(&license, &device, &app.rules(license.plan), now).await?;
  touch_if_due(&app, transition, binding.id, now);

  let plan_limits = app.config.plans.limits(license.plan);
  let response = ActivateRes {
    activated: true,
    license_blob: sign_blob(&app, &license, &device.machine_id, now)?,
    plan: license.plan,
    status: license.status,
    machines_used: sv.machine.active_count(license.id).await?,
    machines_limit: plan_limits.machines,
    lease_token: lease_token(&app, &license, &device.machine_id, now),
  };

  Ok((limits, Json(response)))
}

pub async fn deactivate(
  State(app): State<Arc<AppState>>,
  ClientAddr(client): ClientAddr,
  Json(req): Json<DeactivateReq>,
) -> Result<(RateLimitHeaders, Json<DeactivateRes>)> {
  let now = utils::now();
  let limits = app
    .limiter()
    .allow(Endpoint::Deactivate, &client, utils::unix(now))
    .await?;

  let key = keys::normalize_license_key(&req.license_key)?;
  let machine_id = keys::normalize_machine_id(&req.machine_fingerprint)?;
  let license = find(&app, &key).await?;

  let remaining = app.sv().machine.deactivate(license.id, &machine_id).await?;
  log_usage(&app, license.id, &machine_id, UsageAction::Deactivate, None, now);

  Ok((limits, Json(DeactivateRes {
    deactivated: true,
    machines_remaining: remaining,
  })))
}
