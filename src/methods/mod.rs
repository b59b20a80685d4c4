// One file per method kind (spec.md §4.8's table). `build_for_target`
// turns a parsed `TargetConfig` into the `MethodInstance`s the
// `TargetRegistry` holds; everything else here is shared plumbing the
// per-kind executors lean on (schedule tuples, a bare ExecCtx builder used
// by Supervisor, and the always-on pseudo-targets: Prune/ConfigReload/
// PodmanAutoUpdate don't belong to a git target at all).

mod ansible;
mod configreload;
mod filetransfer;
mod image;
mod kube;
mod podman_auto_update;
mod prune;
mod quadlet;
mod raw;
mod systemd;

use std::sync::Arc;

use crate::config::TargetConfig;
use crate::executor::Executor;
use crate::reconciler::MethodInstance;
use crate::target::Target;

/// Builds every `MethodInstance` a single target's config declares (one
/// per entry across all six git-scoped kinds; `Prune`/`ConfigReload`/
/// `PodmanAutoUpdate` are process-wide and built separately by the
/// Supervisor since they have no target of their own — spec.md §4.8).
pub fn build_for_target(target_config: &TargetConfig, target: &Arc<Target>) -> anyhow::Result<Vec<Arc<MethodInstance>>> {
    let mut out = Vec::new();

    for m in &target_config.raw {
        let executor: Arc<dyn Executor> = Arc::new(raw::RawExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }
    for m in &target_config.kube {
        let executor: Arc<dyn Executor> = Arc::new(kube::KubeExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }
    for m in &target_config.systemd {
        let executor: Arc<dyn Executor> = Arc::new(systemd::SystemdExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }
    for m in &target_config.quadlet {
        let executor: Arc<dyn Executor> = Arc::new(quadlet::QuadletExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }
    for m in &target_config.filetransfer {
        let executor: Arc<dyn Executor> = Arc::new(filetransfer::FileTransferExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }
    for m in &target_config.ansible {
        let executor: Arc<dyn Executor> = Arc::new(ansible::AnsibleExecutor::new(m.clone()));
        out.push(Arc::new(MethodInstance::new(target.clone(), executor)));
    }

    Ok(out)
}

pub use configreload::ConfigReloadExecutor;
pub use image::ImageExecutor;
pub use podman_auto_update::PodmanAutoUpdateExecutor;
pub use prune::PruneExecutor;

/// Shared by every per-kind `Executor::change_filter` impl: resolves the
/// `ChangeFilter` that scopes a method's diff to its `targetPath`/`glob`/
/// `tags` (spec.md §4.2). Broken out so the 6 git-scoped kinds don't each
/// repeat the same three-argument call.
pub(crate) fn change_filter(
    common: &crate::config::MethodCommon,
    base_dir: &std::path::Path,
) -> anyhow::Result<crate::change::ChangeFilter> {
    crate::change::ChangeFilter::new(
        base_dir,
        common.target_path.clone(),
        common.glob.as_deref(),
        common.tags.clone(),
    )
}
