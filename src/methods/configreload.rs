// ConfigReload (spec.md §4.6, §4.8): each tick re-fetches the configured
// config source and calls `CheckForConfigUpdates`; a byte-level change
// asks the Supervisor to restart with the new config. Byte-equality is
// the idempotence basis, so there's no git target to diff against either.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ConfigLoader, ConfigReloadConfig, ConfigSource};
use crate::executor::{ExecCtx, MethodKind, PeriodicJob};

#[derive(Debug)]
pub struct ConfigReloadExecutor {
    config: ConfigReloadConfig,
    loader: ConfigLoader,
    source: std::sync::Arc<dyn ConfigSource>,
    restart_tx: mpsc::Sender<()>,
}

impl ConfigReloadExecutor {
    pub fn new(
        config: ConfigReloadConfig,
        loader: ConfigLoader,
        source: std::sync::Arc<dyn ConfigSource>,
        restart_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            config,
            loader,
            source,
            restart_tx,
        }
    }
}

#[async_trait]
impl PeriodicJob for ConfigReloadExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::ConfigReload
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.schedule, self.config.skew)
    }

    async fn tick(&self, _ctx: &ExecCtx) -> anyhow::Result<()> {
        let candidate = self.source.fetch().await?;
        let exists_already = tokio::fs::try_exists(&self.loader.default_path).await.unwrap_or(false);
        let changed = self
            .loader
            .check_for_config_updates(&candidate, exists_already, false)
            .await?;
        if changed {
            log::info!("config changed at source, requesting restart");
            // A full channel means a restart is already pending; dropping
            // this notification is correct, not a lost update.
            let _ = self.restart_tx.try_send(());
        }
        Ok(())
    }
}
