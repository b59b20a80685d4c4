// FileTransfer (spec.md §4.8): copies arbitrary files into
// `destinationDirectory` via a throwaway container that bind-mounts it,
// rather than writing through the fetchit process's own filesystem view —
// `destinationDirectory` is host-side and may only be reachable through
// Podman's mount namespace (e.g. inside another container's volume).
// Idempotence basis is plain overwrite.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::config::FileTransferMethodConfig;
use crate::executor::{Executor, ExecCtx, MethodKind};
use crate::podman::ContainerSpec;

/// Minimal helper image used for the bind-mount copy/remove (spec.md §1
/// treats exact image provenance as an external-collaborator detail, same
/// as Podman REST bodies); any image with a POSIX shell works.
const HELPER_IMAGE: &str = "docker.io/library/busybox:latest";

#[derive(Debug)]
pub struct FileTransferExecutor {
    config: FileTransferMethodConfig,
}

impl FileTransferExecutor {
    pub fn new(config: FileTransferMethodConfig) -> Self {
        Self { config }
    }

    fn helper_name(&self, file_name: &str) -> String {
        format!("fetchit-filetransfer-{}-{file_name}", self.config.common.name)
    }
}

#[async_trait]
impl Executor for FileTransferExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::FileTransfer
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

    async fn apply_one(&self, ctx: &ExecCtx, _change: &Change, action: &ChangeAction) -> anyhow::Result<()> {
        match action {
            ChangeAction::Apply(path) => {
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context(format!("file {path:?} has no file name"))?
                    .to_owned();
                let spec = ContainerSpec {
                    name: self.helper_name(&file_name),
                    image: HELPER_IMAGE.to_owned(),
                    command: vec![
                        "cp".to_owned(),
                        format!("/fetchit-src/{file_name}"),
                        format!("/fetchit-dest/{file_name}"),
                    ],
                    binds: vec![
                        (path.display().to_string(), format!("/fetchit-src/{file_name}")),
                        (self.config.destination_directory.clone(), "/fetchit-dest".to_owned()),
                    ],
                    privileged: false,
                };
                let code = ctx.podman.run_to_completion(&spec).await?;
                anyhow::ensure!(code == 0, "file transfer helper container exited with code {code}");
                Ok(())
            }
            ChangeAction::Delete(path) => {
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context(format!("file {path:?} has no file name"))?
                    .to_owned();
                let spec = ContainerSpec {
                    name: self.helper_name(&file_name),
                    image: HELPER_IMAGE.to_owned(),
                    command: vec!["rm".to_owned(), "-f".to_owned(), format!("/fetchit-dest/{file_name}")],
                    binds: vec![(self.config.destination_directory.clone(), "/fetchit-dest".to_owned())],
                    privileged: false,
                };
                let code = ctx.podman.run_to_completion(&spec).await?;
                anyhow::ensure!(code == 0, "file transfer removal helper exited with code {code}");
                Ok(())
            }
        }
    }
}
