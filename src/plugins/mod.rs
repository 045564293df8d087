pub mod cron;
pub mod server;

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::state::AppState;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Long-running component supervised by [`App`].
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
  fn name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }

  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct App {
  plugins: Vec<Arc<dyn Plugin>>,
}

impl App {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<P: Plugin + 'static>(mut self, plugin: P) -> Self {
    self.plugins.push(Arc::new(plugin));
    self
  }

  /// Spawns every plugin under a restart loop. A plugin that returns or
  /// crashes is started again after [`RESTART_DELAY`].
  pub async fn run(self, app: Arc<AppState>) {
    for plugin in self.plugins {
      let app = app.clone();

      tokio::spawn(async move {
        let name = plugin.name();
        info!("SYSTEM: Plugin `{name}` initialized");

        loop {
          let app = app.clone();
          let plugin = plugin.clone();

          let handle = tokio::spawn(async move { plugin.start(app).await });

          match handle.await {
            Ok(Ok(())) => warn!("Plugin `{name}` stopped unexpectedly"),
            Ok(Err(err)) => error!("Plugin `{name}` crashed: {err:#}"),
            Err(join_err) if join_err.is_cancelled() => {
              info!("Plugin `{name}` shut down");
              break;
            }
            Err(_) => error!("Plugin `{name}` PANICKED!"),
          }

          sleep(RESTART_DELAY).await;
          info!("SYSTEM: Restarting plugin `{name}`...");
        }
      });
    }
  }
}
