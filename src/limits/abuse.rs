//! Sharing and CI-abuse heuristics over device-count queries

use crate::{config::AbuseThresholds, prelude::*};

/// Environment variable clients read to pin a stable machine identity.
pub const MACHINE_ID_ENV: &str = "LICENSE_MACHINE_ID";

/// Non-CI device activity for one license.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounts {
  /// Distinct active devices seen inside the sharing window.
  pub active: u64,
  /// Devices first seen inside the burst window.
  pub new: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  Clean,
  /// Elevated but tolerated; surfaced to the client as a warning.
  Elevated(String),
  Abuse(String),
}

impl Verdict {
  /// Rejects on abuse, otherwise yields the optional warning.
  pub fn into_warning(self) -> Result<Option<String>> {
    match self {
      Verdict::Clean => Ok(None),
      Verdict::Elevated(warning) => Ok(Some(warning)),
      Verdict::Abuse(message) => Err(Error::Abuse(message)),
    }
  }
}

pub struct AbuseDetector<'a> {
  thresholds: &'a AbuseThresholds,
}

impl<'a> AbuseDetector<'a> {
  pub fn new(thresholds: &'a AbuseThresholds) -> Self {
    Self { thresholds }
  }

  pub fn assess(&self, counts: DeviceCounts) -> Verdict {
    let t = self.thresholds;
    let active_days = t.active_window.num_days();
    let new_hours = t.new_window.num_hours();

    if counts.active > t.sharing {
      return Verdict::Abuse(format!(
        "This license was used on {} devices in the last {active_days} days. \
         If these are ephemeral environments of one machine (containers, \
         VMs), set {MACHINE_ID_ENV} to a stable value.",
        counts.active
      ));
    }

    if counts.new > t.burst {
      return Verdict::Abuse(format!(
        "{} new devices used this license in the last {new_hours} hours. \
         If your environment regenerates its fingerprint, set \
         {MACHINE_ID_ENV} to a stable value.",
        counts.new
      ));
    }

    if counts.active >= t.warn_active || counts.new >= t.warn_new {
      return Verdict::Elevated(format!(
        "High device activity: {} active in {active_days} days, {} new in \
         {new_hours} hours. Licenses are for a single user.",
        counts.active, counts.new
      ));
    }

    Verdict::Clean
  }
}
