//! Immutable runtime configuration
//!
//! Built once at startup from defaults and environment overrides, then
//! shared read-only through [`crate::state::AppState`].

use std::{env, ops::RangeInclusive, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::SigningKey;

use crate::{entity::Plan, prelude::*};

/// `-1` means unlimited for every numeric limit.
pub const UNLIMITED: i32 = -1;

pub fn within(limit: i32, used: u64) -> bool {
  limit == UNLIMITED || used < limit.max(0) as u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanLimits {
  pub machines: i32,
  pub ci_machines: i32,
  pub monthly_scans: i32,
  pub features: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Plans(HashMap<Plan, PlanLimits>);

impl Plans {
  pub fn limits(&self, plan: Plan) -> &PlanLimits {
    // every tier is populated in `Default`
    &self.0[&plan]
  }
}

impl Default for Plans {
  fn default() -> Self {
    let features = |list: &[&str]| list.iter().map(|f| f.to_string()).collect();

    let plans = HashMap::from([
      (Plan::Free, PlanLimits {
        machines: 1,
        ci_machines: 0,
        monthly_scans: 100,
        features: features(&["scan"]),
      }),
      (Plan::Pro, PlanLimits {
        machines: 3,
        ci_machines: 5,
        monthly_scans: UNLIMITED,
        features: features(&["scan", "export", "offline"]),
      }),
      (Plan::Team, PlanLimits {
        machines: 10,
        ci_machines: UNLIMITED,
        monthly_scans: UNLIMITED,
        features: features(&["scan", "export", "offline", "ci", "sso"]),
      }),
      (Plan::Enterprise, PlanLimits {
        machines: UNLIMITED,
        ci_machines: UNLIMITED,
        monthly_scans: UNLIMITED,
        features: features(&["scan", "export", "offline", "ci", "sso", "audit"]),
      }),
    ]);

    Self(plans)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
  pub requests: u32,
  pub window: Duration,
}

impl Budget {
  pub const fn per_minute(requests: u32) -> Self {
    Self { requests, window: Duration::from_secs(60) }
  }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
  pub validate: Budget,
  pub activate: Budget,
  pub deactivate: Budget,
  pub webhook: Budget,
  /// Extra TTL on window counters so a counter never vanishes mid-window.
  pub ttl_buffer: Duration,
}

impl Default for RateLimits {
  fn default() -> Self {
    Self {
      validate: Budget::per_minute(60),
      activate: Budget::per_minute(10),
      deactivate: Budget::per_minute(10),
      webhook: Budget::per_minute(300),
      ttl_buffer: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone)]
pub struct AbuseThresholds {
  /// Distinct active non-CI devices in `active_window` that count as sharing.
  pub sharing: u64,
  /// Newly first-seen non-CI devices in `new_window` that count as a burst.
  pub burst: u64,
  pub warn_active: u64,
  pub warn_new: u64,
  pub active_window: TimeDelta,
  pub new_window: TimeDelta,
  pub ci_window: TimeDelta,
}

impl Default for AbuseThresholds {
  fn default() -> Self {
    Self {
      sharing: 10,
      burst: 5,
      warn_active: 6,
      warn_new: 3,
      active_window: TimeDelta::days(7),
      new_window: TimeDelta::hours(24),
      ci_window: TimeDelta::days(30),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub plans: Plans,
  pub rate_limits: RateLimits,
  pub abuse: AbuseThresholds,
  pub monthly_change_cap: u32,
  pub grace_period: TimeDelta,
  pub clock_skew: TimeDelta,
  pub blob_ttl: TimeDelta,
  pub lease_ttl: TimeDelta,
  pub cache_ttl: TimeDelta,
  pub last_seen_interval: TimeDelta,
  pub signature_tolerance: TimeDelta,
  /// Jitter applied to `LicenseNotFound` responses, in milliseconds.
  pub not_found_delay: RangeInclusive<u64>,
  pub event_retention: TimeDelta,
  pub usage_retention: TimeDelta,
  /// Billing price id -> plan tier.
  pub price_plans: HashMap<String, Plan>,
  /// Take the client address from `X-Forwarded-For`. Only safe behind a
  /// proxy that overwrites the header.
  pub trust_proxy: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      plans: Plans::default(),
      rate_limits: RateLimits::default(),
      abuse: AbuseThresholds::default(),
      monthly_change_cap: 10,
      grace_period: TimeDelta::days(7),
      clock_skew: TimeDelta::minutes(5),
      blob_ttl: TimeDelta::hours(24),
      lease_ttl: TimeDelta::hours(24),
      cache_ttl: TimeDelta::hours(24),
      last_seen_interval: TimeDelta::hours(1),
      signature_tolerance: TimeDelta::minutes(5),
      not_found_delay: 50..=150,
      event_retention: TimeDelta::days(30),
      usage_retention: TimeDelta::days(180),
      price_plans: HashMap::new(),
      trust_proxy: false,
    }
  }
}

fn duration_var(name: &str) -> anyhow::Result<Option<TimeDelta>> {
  let Ok(raw) = env::var(name) else {
    return Ok(None);
  };
  let duration = humantime::parse_duration(raw.trim())
    .with_context(|| format!("{name} is not a duration: `{raw}`"))?;
  Ok(Some(TimeDelta::from_std(duration)?))
}

fn flag_var(name: &str) -> anyhow::Result<Option<bool>> {
  let Ok(raw) = env::var(name) else {
    return Ok(None);
  };
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" => Ok(Some(true)),
    "0" | "false" | "no" | "" => Ok(Some(false)),
    _ => anyhow::bail!("{name} is not a boolean: `{raw}`"),
  }
}

/// Parses `price_123:pro,price_456:team`.
pub fn parse_price_plans(raw: &str) -> anyhow::Result<HashMap<String, Plan>> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|pair| !pair.is_empty())
    .map(|pair| -> anyhow::Result<(String, Plan)> {
      let (price, plan) = pair
        .split_once(':')
        .with_context(|| format!("expected `price:plan`, got `{pair}`"))?;
      let plan = Plan::from_str(plan).map_err(anyhow::Error::msg)?;
      Ok((price.trim().to_string(), plan))
    })
    .collect()
}

impl Config {
  pub fn from_env() -> anyhow::Result<Self> {
    let mut config = Self::default();

    if let Some(ttl) = duration_var("BLOB_TTL")? {
      config.blob_ttl = ttl;
    }
    if let Some(ttl) = duration_var("LEASE_TTL")? {
      config.lease_ttl = ttl;
    }
    if let Some(ttl) = duration_var("CACHE_TTL")? {
      config.cache_ttl = ttl;
    }
    if let Some(interval) = duration_var("LAST_SEEN_INTERVAL")? {
      config.last_seen_interval = interval;
    }
    if let Ok(raw) = env::var("PRICE_PLANS") {
      config.price_plans = parse_price_plans(&raw)?;
    }
    if let Some(trust) = flag_var("TRUST_PROXY")? {
      config.trust_proxy = trust;
    }

    Ok(config)
  }
}

/// Key material. Kept apart from [`Config`] so it never ends up in logs.
#[derive(Clone)]
pub struct Secrets {
  pub signing_key: SigningKey,
  pub webhook_secret: String,
  pub machine_secret: Option<String>,
  /// End of the window in which unsigned machine ids are still accepted.
  pub machine_grace_until: Option<DateTime>,
  pub lease_secret: Option<String>,
  pub admin_key: Option<String>,
}

fn optional_var(name: &str) -> Option<String> {
  env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Secrets {
  pub fn from_env() -> anyhow::Result<Self> {
    let seed = env::var("LICENSE_SIGNING_KEY")
      .context("LICENSE_SIGNING_KEY not set")?;
    let seed: [u8; 32] = STANDARD
      .decode(seed.trim())
      .context("LICENSE_SIGNING_KEY is not base64")?
      .try_into()
      .map_err(|_| anyhow::anyhow!("LICENSE_SIGNING_KEY must be 32 bytes"))?;

    let machine_grace_until = optional_var("MACHINE_SIGNATURE_GRACE_UNTIL")
      .map(|raw| {
        chrono::DateTime::parse_from_rfc3339(raw.trim())
          .map(|date| date.naive_utc())
          .context("MACHINE_SIGNATURE_GRACE_UNTIL is not RFC 3339")
      })
      .transpose()?;

    Ok(Self {
      signing_key: SigningKey::from_bytes(&seed),
      webhook_secret: env::var("WEBHOOK_SECRET")
        .context("WEBHOOK_SECRET not set")?,
      machine_secret: optional_var("MACHINE_SIGNING_SECRET"),
      machine_grace_until,
      lease_secret: optional_var("LEASE_SECRET"),
      admin_key: optional_var("ADMIN_API_KEY"),
    })
  }
}
