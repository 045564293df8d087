//! Short-lived lease tokens for client-side caching of validation results
//!
//! HS256 JWTs under a secret separate from the blob key. They carry only
//! truncated identifiers. Minting is best-effort: callers drop the token
//! on failure and still answer the request.

use jsonwebtoken::{
  Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};

use crate::{
  entity::{LicenseStatus, Plan, license},
  prelude::*,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseClaims {
  /// Truncated license key.
  pub sub: String,
  /// Truncated machine id.
  pub mid: String,
  pub plan: Plan,
  pub status: LicenseStatus,
  pub iat: i64,
  pub nbf: i64,
  pub exp: i64,
}

pub struct LeaseIssuer {
  encoding: EncodingKey,
  decoding: DecodingKey,
  ttl: TimeDelta,
}

impl LeaseIssuer {
  pub fn new(secret: &str, ttl: TimeDelta) -> Self {
    Self {
      encoding: EncodingKey::from_secret(secret.as_bytes()),
      decoding: DecodingKey::from_secret(secret.as_bytes()),
      ttl,
    }
  }

  pub fn mint(
    &self,
    license: &license::Model,
    machine_id: &str,
    now: DateTime,
  ) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = LeaseClaims {
      sub: utils::truncate_id(&license.key),
      mid: utils::truncate_id(machine_id),
      plan: license.plan,
      status: license.status,
      iat: utils::unix(now),
      nbf: utils::unix(now),
      exp: utils::unix(now + self.ttl),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
  }

  pub fn verify(
    &self,
    token: &str,
  ) -> Result<LeaseClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    validation.leeway = 0;
    validation.required_spec_claims =
      ["exp", "nbf"].into_iter().map(String::from).collect();

    decode::<LeaseClaims>(token, &self.decoding, &validation)
      .map(|data| data.claims)
  }

  /// Mints a token, logging and discarding any failure.
  pub fn try_mint(
    &self,
    license: &license::Model,
    machine_id: &str,
    now: DateTime,
  ) -> Option<String> {
    self
      .mint(license, machine_id, now)
      .inspect_err(|err| warn!("Lease token not issued: {err}"))
      .ok()
  }
}
