//! Billing-provider webhook signatures
//!
//! Header format: `t=<unix>,v1=<hex hmac>[,v1=...]`, where the HMAC-SHA256
//! is computed over `"{t}.{raw body}"` with the shared endpoint secret.

use super::{fresh, verify_hmac_hex};
use crate::prelude::*;

pub struct WebhookVerifier {
  secret: String,
  tolerance: TimeDelta,
}

impl WebhookVerifier {
  pub fn new(secret: impl Into<String>, tolerance: TimeDelta) -> Self {
    Self { secret: secret.into(), tolerance }
  }

  /// Must pass before the body is parsed at all.
  pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
      match part.trim().split_once('=') {
        Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
        Some(("v1", value)) => signatures.push(value),
        _ => {}
      }
    }

    let Some(timestamp) = timestamp else {
      debug!("Webhook signature header without timestamp");
      return Err(Webhook::Signature.into());
    };

    if !fresh(timestamp, now, self.tolerance) {
      warn!(timestamp, now, "Webhook timestamp outside tolerance");
      return Err(Webhook::Signature.into());
    }

    let mut signed = Vec::with_capacity(payload.len() + 16);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    if signatures
      .iter()
      .any(|tag| verify_hmac_hex(&self.secret, &signed, tag))
    {
      Ok(())
    } else {
      warn!("Webhook signature mismatch");
      Err(Webhook::Signature.into())
    }
  }
}

#[cfg(test)]
pub(crate) fn sign_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
  let mut signed = format!("{timestamp}.").into_bytes();
  signed.extend_from_slice(payload);
  format!("t={timestamp},v1={}", super::hmac_hex(secret, &signed))
}

#[cfg(test)]
mod tests {
  use super::*;

  const SECRET: &str = "whsec_test123secret456";
  const BODY: &[u8] = br#"{"id":"evt_1","type":"invoice.paid"}"#;

  fn verifier() -> WebhookVerifier {
    WebhookVerifier::new(SECRET, TimeDelta::minutes(5))
  }

  fn rejected(result: Result<()>) -> bool {
    matches!(result, Err(Error::Webhook(Webhook::Signature)))
  }

  #[test]
  fn valid_signature_passes() {
    let now = 1_700_000_000;
    let header = sign_header(SECRET, BODY, now);
    assert!(verifier().verify(BODY, &header, now + 10).is_ok());
  }

  #[test]
  fn any_of_several_signatures_may_match() {
    let now = 1_700_000_000;
    let header = format!("{},v1=deadbeef", sign_header(SECRET, BODY, now));
    assert!(verifier().verify(BODY, &header, now).is_ok());
  }

  #[test]
  fn tampering_and_wrong_secret_fail() {
    let now = 1_700_000_000;
    let header = sign_header(SECRET, BODY, now);
    assert!(rejected(verifier().verify(b"{\"id\":\"evt_2\"}", &header, now)));

    let header = sign_header("wrong_secret", BODY, now);
    assert!(rejected(verifier().verify(BODY, &header, now)));
  }

  #[test]
  fn stale_or_missing_timestamp_fails() {
    let now = 1_700_000_000;
    let header = sign_header(SECRET, BODY, now - 600);
    assert!(rejected(verifier().verify(BODY, &header, now)));

    assert!(rejected(verifier().verify(BODY, "v1=abcdef", now)));
    assert!(rejected(verifier().verify(BODY, "t=1700000000", now)));
    assert!(rejected(verifier().verify(BODY, "garbage", now)));
  }

  #[test]
  fn extreme_timestamps_are_rejected() {
    let now = 1_700_000_000;
    for header in [
      "t=-9223372036854775808,v1=00",
      "t=9223372036854775807,v1=00",
    ] {
      assert!(rejected(verifier().verify(b"{}", header, now)));
    }
    assert!(rejected(verifier().verify(b"{}", "t=1,v1=00", i64::MAX)));
  }
}
