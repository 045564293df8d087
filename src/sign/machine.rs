//! Machine-id signatures (replay protection for validate/activate)
//!
//! Clients sign `"{machine_id}:{timestamp}"` with a shared secret. While the
//! compatibility window is open, unsigned requests are let through with a
//! warning so older clients keep working; once it closes they are rejected.

use super::{fresh, verify_hmac_hex};
use crate::prelude::*;

pub struct MachineSignature {
  secret: String,
  tolerance: TimeDelta,
  /// `None` keeps the compatibility window open indefinitely.
  grace_until: Option<DateTime>,
}

impl MachineSignature {
  pub fn new(
    secret: impl Into<String>,
    tolerance: TimeDelta,
    grace_until: Option<DateTime>,
  ) -> Self {
    Self { secret: secret.into(), tolerance, grace_until }
  }

  pub fn check(
    &self,
    machine_id: &str,
    signature: Option<&str>,
    timestamp: Option<i64>,
    now: DateTime,
  ) -> Result<()> {
    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
      return match self.grace_until {
        Some(until) if now >= until => {
          Err(Error::MachineSignature("signature required"))
        }
        _ => {
          warn!(
            machine = %utils::truncate_id(machine_id),
            "Unsigned machine id accepted during compatibility window"
          );
          Ok(())
        }
      };
    };

    if !fresh(timestamp, utils::unix(now), self.tolerance) {
      return Err(Error::MachineSignature("timestamp outside tolerance"));
    }

    let message = format!("{machine_id}:{timestamp}");
    if verify_hmac_hex(&self.secret, message.as_bytes(), signature) {
      Ok(())
    } else {
      Err(Error::MachineSignature("signature mismatch"))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sign::hmac_hex;

  fn sign(machine_id: &str, timestamp: i64) -> String {
    hmac_hex("machine-secret", format!("{machine_id}:{timestamp}").as_bytes())
  }

  #[test]
  fn signed_requests_are_verified() {
    let now = utils::now();
    let ts = utils::unix(now);
    let check = MachineSignature::new("machine-secret", TimeDelta::minutes(5), None);

    assert!(check.check("m1", Some(&sign("m1", ts)), Some(ts), now).is_ok());
    assert!(matches!(
      check.check("m2", Some(&sign("m1", ts)), Some(ts), now),
      Err(Error::MachineSignature("signature mismatch"))
    ));
  }

  #[test]
  fn replayed_signature_is_stale() {
    let now = utils::now();
    let old = utils::unix(now) - 3600;
    let check = MachineSignature::new("machine-secret", TimeDelta::minutes(5), None);

    assert!(matches!(
      check.check("m1", Some(&sign("m1", old)), Some(old), now),
      Err(Error::MachineSignature("timestamp outside tolerance"))
    ));

    for extreme in [i64::MIN, i64::MAX] {
      assert!(matches!(
        check.check("m1", Some("00"), Some(extreme), now),
        Err(Error::MachineSignature("timestamp outside tolerance"))
      ));
    }
  }

  #[test]
  fn unsigned_allowed_only_inside_window() {
    let now = utils::now();
    let open = MachineSignature::new(
      "machine-secret",
      TimeDelta::minutes(5),
      Some(now + TimeDelta::days(1)),
    );
    assert!(open.check("m1", None, None, now).is_ok());

    let closed = MachineSignature::new(
      "machine-secret",
      TimeDelta::minutes(5),
      Some(now - TimeDelta::days(1)),
    );
    assert!(closed.check("m1", None, None, now).is_err());
  }
}
