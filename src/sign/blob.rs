//! Offline license blobs
//!
//! ```text
//! base64url(json payload) . base64url(ed25519 signature over payload bytes)
//! ```
//!
//! The private key never leaves the server. Clients ship the public key and
//! check the signature plus the `nbf`/`exp` window.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  config::PlanLimits,
  entity::{LicenseStatus, Plan, license},
  prelude::*,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobError {
  #[error("malformed blob: {0}")]
  Format(&'static str),
  #[error("signature mismatch")]
  Signature,
  #[error("blob not yet valid")]
  NotYetValid,
  #[error("blob expired")]
  Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLimits {
  pub machines: i32,
  pub ci_machines: i32,
  pub monthly_scans: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPayload {
  pub license_key: String,
  pub plan: Plan,
  pub status: LicenseStatus,
  /// Truncated machine id the blob was issued to.
  pub machine: String,
  pub features: Vec<String>,
  pub limits: BlobLimits,
  pub iat: i64,
  pub nbf: i64,
  pub exp: i64,
}

pub struct BlobSigner {
  key: SigningKey,
  ttl: TimeDelta,
  skew: TimeDelta,
}

impl BlobSigner {
  pub fn new(key: SigningKey, ttl: TimeDelta, skew: TimeDelta) -> Self {
    Self { key, ttl, skew }
  }

  pub fn verifying_key(&self) -> VerifyingKey {
    self.key.verifying_key()
  }

  pub fn payload(
    &self,
    license: &license::Model,
    machine_id: &str,
    limits: &PlanLimits,
    now: DateTime,
  ) -> BlobPayload {
    BlobPayload {
      license_key: license.key.clone(),
      plan: license.plan,
      status: license.status,
      machine: utils::truncate_id(machine_id),
      features: limits.features.clone(),
      limits: BlobLimits {
        machines: limits.machines,
        ci_machines: limits.ci_machines,
        monthly_scans: limits.monthly_scans,
      },
      iat: utils::unix(now),
      nbf: utils::unix(now - self.skew),
      exp: utils::unix(now + self.ttl),
    }
  }

  pub fn sign(&self, payload: &BlobPayload) -> Result<String> {
    let bytes = json::to_vec(payload)
      .map_err(|e| Error::Internal(format!("blob payload: {e}")))?;
    let signature = self.key.sign(&bytes);

    Ok(format!(
      "{}.{}",
      URL_SAFE_NO_PAD.encode(&bytes),
      URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
  }
}

/// Reference verification, identical to what clients run.
pub fn verify(
  blob: &str,
  key: &VerifyingKey,
  now: i64,
) -> Result<BlobPayload, BlobError> {
  let (payload, signature) =
    blob.split_once('.').ok_or(BlobError::Format("missing separator"))?;

  let payload = URL_SAFE_NO_PAD
    .decode(payload)
    .map_err(|_| BlobError::Format("payload encoding"))?;
  let signature: [u8; 64] = URL_SAFE_NO_PAD
    .decode(signature)
    .map_err(|_| BlobError::Format("signature encoding"))?
    .try_into()
    .map_err(|_| BlobError::Format("signature length"))?;

  key
    .verify(&payload, &Signature::from_bytes(&signature))
    .map_err(|_| BlobError::Signature)?;

  let payload: BlobPayload = json::from_slice(&payload)
    .map_err(|_| BlobError::Format("payload json"))?;

  if now < payload.nbf {
    return Err(BlobError::NotYetValid);
  }
  if now > payload.exp {
    return Err(BlobError::Expired);
  }

  Ok(payload)
}
