// PodmanAutoUpdate (spec.md §6 `podmanAutoUpdate: { ... }`): a root-level,
// target-less pseudo-method enabling Podman's own `podman-auto-update`
// timer/service on its own schedule, for hosts that want auto-update on
// every container regardless of which fetchit target created it. Distinct
// from the per-target Systemd `autoUpdateAll` flag (methods/systemd.rs),
// which scopes the same idea to one target's units.

use async_trait::async_trait;

use crate::config::PodmanAutoUpdateConfig;
use crate::executor::{ExecCtx, MethodKind, PeriodicJob};

#[derive(Debug)]
pub struct PodmanAutoUpdateExecutor {
    config: PodmanAutoUpdateConfig,
}

impl PodmanAutoUpdateExecutor {
    pub fn new(config: PodmanAutoUpdateConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeriodicJob for PodmanAutoUpdateExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::PodmanAutoUpdate
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.schedule, self.config.skew)
    }

    async fn tick(&self, ctx: &ExecCtx) -> anyhow::Result<()> {
        ctx.systemd.enable_unit("podman-auto-update.timer").await?;
        ctx.systemd.start_unit("podman-auto-update.timer").await?;
        ctx.systemd.enable_unit("podman-auto-update.service").await?;
        Ok(())
    }
}
