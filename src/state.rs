use base64::{Engine, engine::general_purpose::STANDARD};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;

use crate::{
  billing::Reconciler,
  config::{Config, Secrets},
  limits::{AbuseDetector, MemoryKv, RateLimiter, UsageThrottle},
  prelude::*,
  sign::{BlobSigner, LeaseIssuer, MachineSignature, WebhookVerifier},
  sv,
};

pub struct Services<'a> {
  pub license: sv::License<'a>,
  pub machine: sv::Machine<'a>,
  pub usage: sv::Usage<'a>,
  pub events: sv::Events<'a>,
}

pub struct AppState {
  pub db: DatabaseConnection,
  pub kv: MemoryKv,
  pub config: Config,
  pub signer: BlobSigner,
  pub lease: Option<LeaseIssuer>,
  pub webhook: WebhookVerifier,
  /// `None` when no machine signing secret is configured.
  pub machine_signature: Option<MachineSignature>,
  pub admin_key: Option<String>,
}

impl AppState {
  pub async fn new(
    db_url: &str,
    config: Config,
    secrets: Secrets,
  ) -> anyhow::Result<Self> {
    info!("Connecting to database...");
    let db = Database::connect(db_url)
      .await
      .context("Failed to connect to database")?;

    info!("Running migrations...");
    Migrator::up(&db, None).await.context("Failed to run migrations")?;

    Ok(Self::with_db(db, config, secrets))
  }

  pub fn with_db(
    db: DatabaseConnection,
    config: Config,
    secrets: Secrets,
  ) -> Self {
    let signer = BlobSigner::new(
      secrets.signing_key,
      config.blob_ttl,
      config.clock_skew,
    );
    let lease = secrets
      .lease_secret
      .map(|secret| LeaseIssuer::new(&secret, config.lease_ttl));
    let webhook =
      WebhookVerifier::new(secrets.webhook_secret, config.signature_tolerance);
    let machine_signature = secrets.machine_secret.map(|secret| {
      MachineSignature::new(
        secret,
        config.signature_tolerance,
        secrets.machine_grace_until,
      )
    });

    info!(
      "Blob verifying key: {}",
      STANDARD.encode(signer.verifying_key().as_bytes())
    );
    if lease.is_none() {
      warn!("LEASE_SECRET not set, lease tokens disabled");
    }
    if machine_signature.is_none() {
      warn!("MACHINE_SIGNING_SECRET not set, machine ids are not verified");
    }

    Self {
      db,
      kv: MemoryKv::new(),
      config,
      signer,
      lease,
      webhook,
      machine_signature,
      admin_key: secrets.admin_key,
    }
  }

  pub fn sv(&self) -> Services<'_> {
    Services {
      license: sv::License::new(&self.db),
      machine: sv::Machine::new(&self.db),
      usage: sv::Usage::new(&self.db),
      events: sv::Events::new(&self.db),
    }
  }

  pub fn limiter(&self) -> RateLimiter<'_> {
    RateLimiter::new(&self.kv, &self.config.rate_limits)
  }

  pub fn abuse(&self) -> AbuseDetector<'_> {
    AbuseDetector::new(&self.config.abuse)
  }

  pub fn throttle(&self) -> UsageThrottle {
    UsageThrottle::new(self.config.last_seen_interval)
  }

  pub fn reconciler(&self) -> Reconciler<'_> {
    Reconciler::new(&self.db, &self.config)
  }

  pub fn rules(&self, plan: crate::entity::Plan) -> sv::Rules<'_> {
    sv::Rules {
      limits: self.config.plans.limits(plan),
      change_cap: self.config.monthly_change_cap,
      ci_window: self.config.abuse.ci_window,
      throttle: self.throttle(),
    }
  }
}
