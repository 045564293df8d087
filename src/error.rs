//! Error taxonomy of the license server and its HTTP rendering

use axum::{
  Json,
  http::{HeaderMap, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
};
use json::{Value, json};
use thiserror::Error;

use crate::{limits::RateLimitHeaders, prelude::*};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Webhook {
  #[error("invalid webhook signature")]
  Signature,
  /// Expected ordering race (e.g. the customer record has not landed yet).
  /// Surfaces as a 5xx so the provider re-delivers the event later.
  #[error("event must be retried: {0}")]
  Retry(String),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] sea_orm::DbErr),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("invalid license key format")]
  InvalidLicenseKey,

  #[error("invalid machine id format")]
  InvalidMachineId,

  #[error("license not found")]
  LicenseNotFound,

  #[error("license expired")]
  LicenseExpired { period_end: DateTime },

  #[error("license revoked")]
  LicenseRevoked { reason: Option<String> },

  #[error("license payment is past due")]
  LicensePastDue,

  #[error("machine limit reached ({limit})")]
  MachineLimit { limit: i32, active: Vec<String> },

  #[error("monthly machine change limit reached ({limit})")]
  ChangeLimit { limit: u32, resets_at: DateTime },

  #[error("{0}")]
  Abuse(String),

  #[error("CI device limit reached ({limit})")]
  CiLimit { limit: i32 },

  #[error("rate limit exceeded")]
  RateLimited { headers: RateLimitHeaders, retry_after: u64 },

  #[error(transparent)]
  Webhook(#[from] Webhook),

  #[error("invalid machine signature: {0}")]
  MachineSignature(&'static str),

  #[error("unauthorized")]
  Unauthorized,

  #[error("internal error: {0}")]
  Internal(String),
}

impl Error {
  pub fn code(&self) -> &'static str {
    match self {
      Error::Database(_) | Error::Internal(_) => "INTERNAL_ERROR",
      Error::InvalidRequest(_) => "INVALID_REQUEST",
      Error::InvalidLicenseKey => "INVALID_LICENSE_KEY",
      Error::InvalidMachineId => "INVALID_MACHINE_ID",
      Error::LicenseNotFound => "LICENSE_NOT_FOUND",
      Error::LicenseExpired { .. } => "LICENSE_EXPIRED",
      Error::LicenseRevoked { .. } => "LICENSE_REVOKED",
      Error::LicensePastDue => "LICENSE_PAST_DUE",
      Error::MachineLimit { .. } => "MACHINE_LIMIT_EXCEEDED",
      Error::ChangeLimit { .. } => "MONTHLY_CHANGE_LIMIT_EXCEEDED",
      Error::Abuse(_) => "ABUSE_DETECTED",
      Error::CiLimit { .. } => "CI_DEVICE_LIMIT",
      Error::RateLimited { .. } => "RATE_LIMITED",
      Error::Webhook(Webhook::Signature) => "WEBHOOK_SIGNATURE_INVALID",
      Error::Webhook(Webhook::Retry(_)) => "WEBHOOK_RETRY",
      Error::MachineSignature(_) => "MACHINE_SIGNATURE_INVALID",
      Error::Unauthorized => "UNAUTHORIZED",
    }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      Error::InvalidRequest(_)
      | Error::InvalidLicenseKey
      | Error::InvalidMachineId => StatusCode::BAD_REQUEST,
      Error::LicenseNotFound => StatusCode::NOT_FOUND,
      Error::LicensePastDue => StatusCode::PAYMENT_REQUIRED,
      Error::LicenseExpired { .. }
      | Error::LicenseRevoked { .. }
      | Error::MachineLimit { .. }
      | Error::ChangeLimit { .. }
      | Error::Abuse(_)
      | Error::CiLimit { .. } => StatusCode::FORBIDDEN,
      Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
      Error::Webhook(Webhook::Signature)
      | Error::MachineSignature(_)
      | Error::Unauthorized => StatusCode::UNAUTHORIZED,
      Error::Webhook(Webhook::Retry(_))
      | Error::Database(_)
      | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn details(&self) -> Option<Value> {
    match self {
      Error::LicenseExpired { period_end } => Some(json!({
        "status": "expired",
        "period_end": utils::rfc3339(*period_end),
      })),
      Error::LicenseRevoked { reason } => Some(json!({
        "status": "revoked",
        "reason": reason,
      })),
      Error::LicensePastDue => Some(json!({
        "status": "past_due",
        "hint": "update the payment method to restore access",
      })),
      Error::MachineLimit { limit, active } => Some(json!({
        "machines_limit": limit,
        "active_machines": active,
        "hint": "deactivate a machine before activating a new one",
      })),
      Error::ChangeLimit { limit, resets_at } => Some(json!({
        "changes_limit": limit,
        "resets_at": utils::rfc3339(*resets_at),
      })),
      Error::Abuse(_) | Error::CiLimit { .. } => Some(json!({
        "hint": format!(
          "set {} to a stable value to pin this machine's identity",
          crate::limits::MACHINE_ID_ENV
        ),
      })),
      Error::RateLimited { retry_after, .. } => {
        Some(json!({ "retry_after": retry_after }))
      }
      _ => None,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    let code = self.code();

    let (message, details) = if status == StatusCode::INTERNAL_SERVER_ERROR {
      let support_id = uuid::Uuid::new_v4();
      match &self {
        Error::Webhook(Webhook::Retry(reason)) => {
          info!(%support_id, "Webhook deferred for redelivery: {reason}");
        }
        _ => error!(%support_id, "Request failed: {self}"),
      }
      let message = match &self {
        Error::Webhook(Webhook::Retry(_)) => {
          "Event not yet processable, retry later"
        }
        _ => "Internal server error",
      };
      (message.to_string(), Some(json!({ "support_id": support_id })))
    } else {
      (self.to_string(), self.details())
    };

    let mut body = json!({ "error_code": code, "message": message });
    if let Some(details) = details {
      body["details"] = details;
    }

    let mut headers = HeaderMap::new();
    if let Error::RateLimited { headers: limits, retry_after } = &self {
      limits.write(&mut headers);
      headers.insert("retry-after", HeaderValue::from(*retry_after));
    }

    (status, headers, Json(body)).into_response()
  }
}
