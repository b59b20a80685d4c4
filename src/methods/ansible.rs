// Ansible (spec.md §4.8): launches a helper container with SSH keys
// bind-mounted that runs `ansible-playbook` against the changed playbook.
// Idempotence is the playbook author's responsibility, not this
// executor's; a delete sentinel has nothing host-side to undo, so it's a
// no-op here.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::config::AnsibleMethodConfig;
use crate::executor::{Executor, ExecCtx, MethodKind};
use crate::podman::ContainerSpec;

const HELPER_IMAGE: &str = "docker.io/willhallonline/ansible:latest";

#[derive(Debug)]
pub struct AnsibleExecutor {
    config: AnsibleMethodConfig,
}

impl AnsibleExecutor {
    pub fn new(config: AnsibleMethodConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for AnsibleExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Ansible
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
        let ChangeAction::Apply(path) = action else {
            return Ok(());
        };
        let playbook_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context(format!("playbook {path:?} has no file name"))?
            .to_owned();

        let mut binds = vec![(path.display().to_string(), format!("/playbooks/{playbook_name}"))];
        let mut command = vec!["ansible-playbook".to_owned(), format!("/playbooks/{playbook_name}")];

        if let Some(ssh_dir) = &self.config.ssh_directory {
            binds.push((ssh_dir.clone(), "/root/.ssh".to_owned()));
        }
        if let Some(inventory) = &self.config.inventory {
            binds.push((inventory.clone(), "/playbooks/inventory".to_owned()));
            command.push("-i".to_owned());
            command.push("/playbooks/inventory".to_owned());
        }

        let spec = ContainerSpec {
            name: format!("fetchit-ansible-{}", self.config.common.name),
            image: HELPER_IMAGE.to_owned(),
            command,
            binds,
            privileged: false,
        };
        let code = ctx.podman.run_to_completion(&spec).await?;
        anyhow::ensure!(code == 0, "ansible-playbook exited with code {code}");
        Ok(())
    }
}
