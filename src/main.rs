//! License server: machine binding, signed offline artifacts and billing
//! reconciliation behind a small JSON API.

mod billing;
mod config;
mod entity;
mod error;
mod keys;
mod limits;
mod plugins;
mod prelude;
mod sign;
mod state;
mod sv;
mod utils;

use tracing_subscriber::{
  EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
  config::{Config, Secrets},
  plugins::{App, cron, server},
  prelude::*,
  state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
      "license_engine=debug,tower_http=debug,sea_orm=warn".into()
    }))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let db_url = std::env::var("DATABASE_URL")
    .unwrap_or_else(|_| "sqlite:licenses.db?mode=rwc".into());
  let config = Config::from_env()?;
  let secrets = Secrets::from_env()?;

  info!("Starting License Server v{}", env!("CARGO_PKG_VERSION"));

  let app = Arc::new(AppState::new(&db_url, config, secrets).await?);

  App::new()
    .register(server::Plugin)
    .register(cron::Housekeeping)
    .run(app)
    .await;

  tokio::signal::ctrl_c().await.context("Failed to listen for shutdown")?;
  info!("Shutting down");
  Ok(())
}
