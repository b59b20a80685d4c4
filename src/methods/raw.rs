// Raw (spec.md §4.8): `*.json`/`*.yaml` files each describing one
// container. Idempotence basis is name uniqueness plus unconditional
// re-create: every apply stops+removes whatever currently holds that name,
// then (re)creates it, so a tick is safe to repeat with no drift.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::config::RawMethodConfig;
use crate::executor::{Executor, ExecCtx, MethodKind};
use crate::podman::ContainerSpec;

/// The container declaration a Raw file contains. Field names mirror
/// `podman run`'s own vocabulary rather than introducing fetchit-specific
/// ones, since that's what a human hand-writing one of these files expects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContainerFile {
    name: String,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    binds: Vec<String>,
    #[serde(default)]
    privileged: bool,
}

impl RawContainerFile {
    fn into_spec(self) -> ContainerSpec {
        ContainerSpec {
            name: self.name,
            image: self.image,
            command: self.command,
            binds: self
                .binds
                .into_iter()
                .filter_map(|b| b.split_once(':').map(|(h, c)| (h.to_owned(), c.to_owned())))
                .collect(),
            privileged: self.privileged,
        }
    }
}

#[derive(Debug)]
pub struct RawExecutor {
    config: RawMethodConfig,
}

impl RawExecutor {
    pub fn new(config: RawMethodConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for RawExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Raw
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

    // Distinct container names never collide on the Podman side, so
    // concurrent ApplyOne calls are safe (spec.md §4.4).
    fn parallel_safe(&self) -> bool {
        true
    }

    async fn apply_one(&self, ctx: &ExecCtx, _change: &Change, action: &ChangeAction) -> anyhow::Result<()> {
        match action {
            ChangeAction::Apply(path) => {
                let bytes = tokio::fs::read(path).await.context(format!("reading raw container file {path:?}"))?;
                let file: RawContainerFile =
                    serde_yaml::from_slice(&bytes).context(format!("parsing raw container file {path:?}"))?;
                let spec = file.into_spec();
                ctx.podman.stop_and_remove(&spec.name).await?;
                ctx.podman.pull_image(&spec.image, !self.config.pull_image).await?;
                ctx.podman.create_and_start(&spec).await
            }
            ChangeAction::Delete(path) => {
                // The file is already gone, so its declared `name:` field
                // can't be read back; the file's own basename is the name
                // a container created from it would have used.
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context(format!("resolving container name for deleted file {path:?}"))?;
                ctx.podman.stop_and_remove(name).await
            }
        }
    }
}
