// Quadlet (spec.md §4.8): `.container`/`.volume`/`.network`/`.kube` files
// copied into Podman's Quadlet input directory, where the systemd unit
// generator turns each into a `<name>.service` unit. `daemon-reload` is
// the commit point: every file in a tick's batch is placed first, then
// `daemon-reload` runs exactly once (not once per file), then each file's
// generated unit is driven individually — that ordering is why placement
// happens in `apply_one` but the systemd actions happen in `after_apply`.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::change::{Change, ChangeAction, ChangeFilter, ChangeKind};
use crate::config::{quadlet_input_dir, QuadletMethodConfig};
use crate::executor::{Executor, ExecCtx, MethodKind};

#[derive(Debug)]
pub struct QuadletExecutor {
    config: QuadletMethodConfig,
}

impl QuadletExecutor {
    pub fn new(config: QuadletMethodConfig) -> Self {
        Self { config }
    }

    fn input_dest(&self, file_name: &std::ffi::OsStr) -> std::path::PathBuf {
        quadlet_input_dir(self.config.root).join(file_name)
    }

    /// The unit name systemd's Quadlet generator produces for a given
    /// input file (spec.md §4 "Service-name derivation for Quadlet", §8
    /// property 7). Pure function of the file name alone; directory
    /// components are stripped first. Unrecognised extensions fall back
    /// to the bare `<stem>.service` form, same as `.container`/`.kube`.
    fn generated_unit_name(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let suffix = match path.extension().and_then(|e| e.to_str()) {
            Some("volume") => "-volume",
            Some("network") => "-network",
            Some("pod") => "-pod",
            _ => "",
        };
        Some(format!("{stem}{suffix}.service"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_unit_name_matches_spec_table() {
        let cases = [
            ("myapp.container", "myapp.service"),
            ("data.volume", "data-volume.service"),
            ("app-net.network", "app-net-network.service"),
            ("webapp.kube", "webapp.service"),
            ("mypod.pod", "mypod-pod.service"),
            ("other.xyz", "other.service"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                QuadletExecutor::generated_unit_name(Path::new(input)),
                Some(expected.to_owned()),
                "input: {input}"
            );
        }
    }

    #[test]
    fn test_generated_unit_name_strips_directory_components() {
        assert_eq!(
            QuadletExecutor::generated_unit_name(Path::new("/clone/containers/myapp.container")),
            Some("myapp.service".to_owned())
        );
    }
}

#[async_trait]
impl Executor for QuadletExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Quadlet
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

    // Distinct Quadlet file names generate distinct units, so placement
    // can fan out; the reload/enable/start ordering that must stay serial
    // happens in `after_apply` instead (spec.md §4.4).
    fn parallel_safe(&self) -> bool {
        true
    }

    async fn apply_one(&self, _ctx: &ExecCtx, _change: &Change, action: &ChangeAction) -> anyhow::Result<()> {
        match action {
            ChangeAction::Apply(path) => {
                let file_name = path.file_name().context(format!("quadlet file {path:?} has no file name"))?;
                let dest = self.input_dest(file_name);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await.context("creating quadlet input directory")?;
                }
                tokio::fs::copy(path, &dest)
                    .await
                    .context(format!("copying quadlet file to {dest:?}"))?;
                Ok(())
            }
            ChangeAction::Delete(path) => {
                let file_name = path.file_name().context(format!("quadlet file {path:?} has no file name"))?;
                let dest = self.input_dest(file_name);
                tokio::fs::remove_file(&dest).await.ok();
                Ok(())
            }
        }
    }

    async fn after_apply(&self, ctx: &ExecCtx, changes: &[(Change, ChangeAction)]) -> anyhow::Result<()> {
        ctx.systemd.daemon_reload().await?;

        for (change, action) in changes {
            let path = match action {
                ChangeAction::Apply(p) | ChangeAction::Delete(p) => p,
            };
            let Some(unit) = Self::generated_unit_name(path) else {
                continue;
            };

            match change.kind {
                ChangeKind::Delete => {
                    ctx.systemd.stop_unit(&unit).await?;
                }
                ChangeKind::Create => {
                    if !ctx.systemd.unit_exists(&unit).await? {
                        anyhow::bail!("quadlet generator did not produce unit {unit:?} for {path:?}");
                    }
                    ctx.systemd.enable_unit(&unit).await?;
                    ctx.systemd.start_unit(&unit).await?;
                }
                ChangeKind::Update | ChangeKind::Rename => {
                    if self.config.restart {
                        ctx.systemd.restart_unit(&unit).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
