// Target + TargetRegistry (spec.md §3). A Target identifies one upstream
// source; the registry is the process-wide `name -> Target` and
// `(target,kind,name) -> MethodInstance` mapping the Supervisor owns
// exclusively and mutates only during a restart (spec.md §9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tokio::sync::{Mutex, OnceCell};

use crate::config::{AuthConfig, RootConfig, SourceKind, TargetConfig, VerifyCommitsInfo};
use crate::git::{working_dir_name, PersistentWorktree};
use crate::reconciler::MethodInstance;

/// One named upstream source of declarative artifacts (spec.md §3).
/// Created at config load; destroyed by scheduler restart; never mutated
/// after registration except via restart. The mutex serialises every
/// `Process` tick across the methods bound to this target (spec.md §5).
#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub source: SourceKind,
    pub branch: String,
    pub auth: Option<AuthConfig>,
    pub verify: Option<VerifyCommitsInfo>,
    pub disconnected: bool,
    /// Working directory this target's clone lives in, named after the
    /// repository's basename (spec.md §4.1 `Ensure`, §6 "Persisted state").
    pub working_dir: PathBuf,
    pub mutex: Mutex<()>,
    /// Lazily materialised on the first tick that needs it (spec.md §4.4
    /// step 3a). Reads/writes happen only while `mutex` is held, so a
    /// plain `OnceCell` suffices without extra locking.
    worktree_cell: OnceCell<Arc<PersistentWorktree>>,
}

impl Target {
    pub fn new(config: &TargetConfig, clones_dir: &std::path::Path, default_auth: Option<&AuthConfig>) -> anyhow::Result<Self> {
        let source = config.source_kind()?;
        let working_dir = match &source {
            SourceKind::GitUrl(url) | SourceKind::ZipUrl(url) => clones_dir.join(working_dir_name(url)),
            SourceKind::BlockDevice(_) => clones_dir.join(&config.name),
            SourceKind::LocalPath(path) => path.clone(),
        };
        Ok(Self {
            name: config.name.clone(),
            source,
            branch: config.branch.clone().unwrap_or_else(|| "main".to_owned()),
            auth: config.auth.clone().or_else(|| default_auth.cloned()),
            verify: config.verify_commits_info.clone(),
            disconnected: config.disconnected,
            working_dir,
            mutex: Mutex::new(()),
            worktree_cell: OnceCell::new(),
        })
    }

    /// GitStore `Ensure` (spec.md §4.1), memoised per Target. Only valid
    /// for network/local sources; block-device/zip sources materialise
    /// via a different path (spec.md §4.4 step 3a, §9 re-architecture
    /// notes: "modelled as an extra materialisation step of
    /// GitStore.Ensure").
    pub async fn worktree(&self, git_binary: &std::path::Path) -> anyhow::Result<Arc<PersistentWorktree>> {
        self.worktree_cell
            .get_or_try_init(|| async {
                let url = match &self.source {
                    SourceKind::GitUrl(url) => url.clone(),
                    SourceKind::LocalPath(path) => path.display().to_string(),
                    other => bail!("target {:?} source {:?} has no direct git worktree", self.name, other),
                };
                let wt = PersistentWorktree::ensure(
                    self.working_dir.clone(),
                    git_binary.to_owned(),
                    &url,
                    &self.branch,
                    self.auth.as_ref(),
                )
                .await
                .context(format!("ensuring clone for target {:?}", self.name))?;
                Ok(Arc::new(wt))
            })
            .await
            .map(|wt| wt.clone())
    }

    #[cfg(test)]
    pub fn for_test(name: &str, working_dir: PathBuf, branch: &str) -> Self {
        Self {
            name: name.to_owned(),
            source: SourceKind::LocalPath(working_dir.clone()),
            branch: branch.to_owned(),
            auth: None,
            verify: None,
            disconnected: true,
            working_dir,
            mutex: Mutex::new(()),
            worktree_cell: OnceCell::new(),
        }
    }
}

/// The process-wide `name -> Target` and `(target,kind,name) ->
/// MethodInstance` mapping (spec.md §3). Built fresh on every config load
/// / restart; never mutated in place outside that path.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<Target>>,
    methods: Vec<Arc<MethodInstance>>,
}

impl TargetRegistry {
    pub fn targets(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    pub fn methods(&self) -> &[Arc<MethodInstance>] {
        &self.methods
    }

    pub fn target(&self, name: &str) -> anyhow::Result<Arc<Target>> {
        self.targets
            .get(name)
            .cloned()
            .with_context(|| format!("no such target {name:?}"))
    }

    pub fn insert_target(&mut self, target: Arc<Target>) -> anyhow::Result<()> {
        if self.targets.insert(target.name.clone(), target.clone()).is_some() {
            bail!("duplicate target {:?} registered", target.name);
        }
        Ok(())
    }

    pub fn insert_method(&mut self, method: Arc<MethodInstance>) {
        self.methods.push(method);
    }

    /// Rebuilds a fresh registry from `config`; does not clone any git
    /// repositories (that happens lazily, in each MethodInstance's first
    /// `Process` tick per spec.md §4.4 step 3a). `clones_dir` is where
    /// network-sourced targets' working trees live (spec.md §6: "one per
    /// target named by the URL's basename").
    pub fn build(config: &RootConfig, clones_dir: &std::path::Path) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for target_config in &config.target_configs {
            let target = Arc::new(Target::new(target_config, clones_dir, config.git_auth.as_ref())?);
            registry.insert_target(target.clone())?;
            for method in crate::methods::build_for_target(target_config, &target)? {
                registry.insert_method(method);
            }
        }
        Ok(registry)
    }
}
