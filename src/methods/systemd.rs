// Systemd (spec.md §4.8): `*.service` unit files placed directly into
// systemd's search path. File overwrite plus idempotent systemctl actions
// are the idempotence basis; the special `autoUpdateAll` mode ignores
// from/to entirely and just makes sure `podman-auto-update.{timer,service}`
// are enabled every tick.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::config::{systemd_unit_dir, SystemdMethodConfig};
use crate::executor::{Executor, ExecCtx, MethodKind};

#[derive(Debug)]
pub struct SystemdExecutor {
    config: SystemdMethodConfig,
}

impl SystemdExecutor {
    pub fn new(config: SystemdMethodConfig) -> Self {
        Self { config }
    }

    fn unit_dest(&self, file_name: &std::ffi::OsStr) -> std::path::PathBuf {
        systemd_unit_dir(self.config.root).join(file_name)
    }
}

#[async_trait]
impl Executor for SystemdExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Systemd
    }

    fn name(&self) -> &str {
        &self.config.common.name
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.common.schedule, self.config.common.skew)
    }

    fn change_filter(&self, base_dir: &Path) -> anyhow::Result<Option<ChangeFilter>> {
        if self.config.auto_update_all {
            return Ok(None);
        }
        Ok(Some(super::change_filter(&self.config.common, base_dir)?))
    }

    // Distinct unit file names don't collide (spec.md §4.4).
    fn parallel_safe(&self) -> bool {
        true
    }

    async fn apply_one(&self, ctx: &ExecCtx, _change: &Change, action: &ChangeAction) -> anyhow::Result<()> {
        match action {
            ChangeAction::Apply(path) => {
                let file_name = path.file_name().context(format!("unit file {path:?} has no file name"))?;
                let dest = self.unit_dest(file_name);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await.context("creating unit directory")?;
                }
                tokio::fs::copy(path, &dest)
                    .await
                    .context(format!("copying unit file to {dest:?}"))?;
                ctx.systemd.daemon_reload().await?;
                let unit = dest.file_name().unwrap().to_string_lossy().into_owned();
                if self.config.enable {
                    ctx.systemd.enable_unit(&unit).await?;
                }
                if self.config.restart {
                    ctx.systemd.restart_unit(&unit).await
                } else {
                    ctx.systemd.start_unit(&unit).await
                }
            }
            ChangeAction::Delete(path) => {
                let file_name = path.file_name().context(format!("unit file {path:?} has no file name"))?;
                let dest = self.unit_dest(file_name);
                let unit = dest.file_name().unwrap().to_string_lossy().into_owned();
                ctx.systemd.stop_unit(&unit).await?;
                tokio::fs::remove_file(&dest).await.ok();
                ctx.systemd.daemon_reload().await
            }
        }
    }

    async fn apply_unconditional(&self, ctx: &ExecCtx) -> anyhow::Result<()> {
        if !self.config.auto_update_all {
            return Ok(());
        }
        ctx.systemd.enable_unit("podman-auto-update.timer").await?;
        ctx.systemd.start_unit("podman-auto-update.timer").await?;
        ctx.systemd.enable_unit("podman-auto-update.service").await?;
        Ok(())
    }
}
