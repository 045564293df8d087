//! Signed artifacts and request signatures

pub mod blob;
pub mod lease;
pub mod machine;
pub mod webhook;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::prelude::*;

pub use blob::BlobSigner;
pub use lease::LeaseIssuer;
pub use machine::MachineSignature;
pub use webhook::WebhookVerifier;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str, message: &[u8]) -> HmacSha256 {
  let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
    .expect("HMAC can take key of any size");
  mac.update(message);
  mac
}

pub fn hmac_hex(secret: &str, message: &[u8]) -> String {
  hex::encode(mac(secret, message).finalize().into_bytes())
}

/// Constant-time check of a hex-encoded HMAC-SHA256 tag.
pub fn verify_hmac_hex(secret: &str, message: &[u8], tag: &str) -> bool {
  let Ok(tag) = hex::decode(tag.trim()) else {
    return false;
  };
  mac(secret, message).verify_slice(&tag).is_ok()
}

/// Whether a client-supplied unix `timestamp` lies within `tolerance` of
/// `now`. Any `i64` is accepted.
pub fn fresh(timestamp: i64, now: i64, tolerance: TimeDelta) -> bool {
  now.abs_diff(timestamp) <= tolerance.num_seconds().unsigned_abs()
}
