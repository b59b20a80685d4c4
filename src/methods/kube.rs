// Kube (spec.md §4.8): multi-doc Kubernetes YAML. For each `Pod` document,
// stop matching pods before replaying the spec so a create never races a
// a leftover container from the same pod name; the delete sentinel just
// stops and removes without playing anything back.

use std::path::Path;

use async_trait::async_trait;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::config::KubeMethodConfig;
use crate::executor::{Executor, ExecCtx, MethodKind};

#[derive(Debug)]
pub struct KubeExecutor {
    config: KubeMethodConfig,
}

impl KubeExecutor {
    pub fn new(config: KubeMethodConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for KubeExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Kube
    }

    fn name(&self) -> &str {
        &self.config.common.name
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.common.schedule, self.config.common.skew)
    }

    fn change_filter(&self, base_dir: &Path) -> anyhow::Result<Option<ChangeFilter>> {
        Ok(Some(super::change_filter(&self.config.common, base_dir)?))
    }

    // Pods declared by distinct YAML files don't share names by
    // convention, so fanning out is safe (spec.md §4.4).
    fn parallel_safe(&self) -> bool {
        true
    }

    async fn apply_one(&self, ctx: &ExecCtx, _change: &Change, action: &ChangeAction) -> anyhow::Result<()> {
        match action {
            ChangeAction::Apply(path) => {
                ctx.podman.kube_down(path).await?;
                ctx.podman.kube_play(path).await
            }
            ChangeAction::Delete(path) => ctx.podman.kube_down(path).await,
        }
    }
}
