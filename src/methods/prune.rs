// Prune (spec.md §4.8): calls Podman system-prune with the configured
// flags every tick. Inherently idempotent, no git target involved.

use async_trait::async_trait;

use crate::config::PruneConfig;
use crate::executor::{ExecCtx, MethodKind, PeriodicJob};

#[derive(Debug)]
pub struct PruneExecutor {
    config: PruneConfig,
}

impl PruneExecutor {
    pub fn new(config: PruneConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeriodicJob for PruneExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Prune
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.schedule, self.config.skew)
    }

    async fn tick(&self, ctx: &ExecCtx) -> anyhow::Result<()> {
        ctx.podman.system_prune(self.config.volumes, self.config.all).await
    }
}
