use std::sync::Arc;

use axum::extract::{Path, State};
use json::{Value, json};

use super::extract::{Admin, Json};
use crate::{keys, prelude::*, state::AppState};

pub async fn health() -> &'static str {
  "OK"
}

pub async fn license(
  State(app): State<Arc<AppState>>,
  _: Admin,
  Path(key): Path<String>,
) -> Result<Json<Value>> {
  let key = keys::normalize_license_key(&key)?;
  let sv = app.sv();
  let license = sv.license.by_key(&key).await?.ok_or(Error::LicenseNotFound)?;

  let now = utils::now();
  let machines: Vec<Value> = sv
    .machine
    .all(license.id)
    .await?
    .into_iter()
    .map(|row| {
      json!({
        "machine": utils::truncate_id(&row.machine_id),
        "fingerprint_type": row.fingerprint_type,
        "name": row.name,
        "ci_provider": row.ci_provider,
        "active": row.is_active,
        "first_seen_at": utils::rfc3339(row.first_seen_at),
        "last_seen_at": row.last_seen_at.map(utils::rfc3339),
      })
    })
    .collect();

  Ok(Json(json!({
    "license_key": license.key,
    "plan": license.plan,
    "billing_type": license.billing_type,
    "status": license.status,
    "period_start": utils::rfc3339(license.period_start),
    "period_end": utils::rfc3339(license.period_end),
    "revoked_reason": license.revoked_reason,
    "machines": machines,
    "changes_this_month": sv.usage.monthly_changes(license.id, now).await?,
    "changes_limit": app.config.monthly_change_cap,
  })))
}
