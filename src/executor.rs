// The Executor interface (spec.md §4.3) and the generic `apply` driver
// that turns two commits into a dispatched ChangeSet. Every method kind
// implements `Executor`; the ChangeFilter-to-ApplyOne plumbing in
// `run_apply` below is shared so individual method files only need to
// supply `change_filter`/`apply_one`/`parallel_safe`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::change::{Change, ChangeAction, ChangeFilter};
use crate::git::{CommitHash, Worktree};
use crate::podman::PodmanConn;
use crate::systemd_dbus::SystemdConn;
use crate::util::ErrGroup;

/// Short stable identifier for a method kind (spec.md §4.3 `Kind()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Raw,
    Kube,
    Systemd,
    Quadlet,
    FileTransfer,
    Ansible,
    Image,
    Prune,
    ConfigReload,
    PodmanAutoUpdate,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Raw => "raw",
            MethodKind::Kube => "kube",
            MethodKind::Systemd => "systemd",
            MethodKind::Quadlet => "quadlet",
            MethodKind::FileTransfer => "filetransfer",
            MethodKind::Ansible => "ansible",
            MethodKind::Image => "image",
            MethodKind::Prune => "prune",
            MethodKind::ConfigReload => "configreload",
            MethodKind::PodmanAutoUpdate => "podmanautoupdate",
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connections shared by every tick (spec.md §5: "All tasks share one
/// Podman connection and one systemd D-Bus connection").
#[derive(Clone)]
pub struct ExecCtx {
    pub podman: Arc<dyn PodmanConn>,
    pub systemd: Arc<dyn SystemdConn>,
    pub ct: CancellationToken,
}

/// Every method kind implements this (spec.md §4.3). `Process` itself
/// lives in reconciler.rs since its state-machine logic (§4.4) is
/// identical across all kinds; what varies per kind is captured here.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> MethodKind;
    fn name(&self) -> &str;
    fn schedule(&self) -> (&str, Option<u64>);

    /// Builds this instance's ChangeFilter rooted at `base_dir` (the
    /// target's clone directory). `None` means this kind ignores
    /// `from`/`to` entirely and acts unconditionally every tick (Prune,
    /// ConfigReload, Systemd's `autoUpdateAll` mode — spec.md §4.3).
    fn change_filter(&self, base_dir: &Path) -> anyhow::Result<Option<ChangeFilter>>;

    /// Whether this kind's `ApplyOne` calls are safe to fan out across a
    /// bounded worker group (spec.md §4.4: Kube/Systemd/Raw declare this
    /// safe because their changes are commutative across distinct files).
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Idempotent handler for a single filtered change (spec.md §4.3
    /// `ApplyOne`).
    async fn apply_one(&self, ctx: &ExecCtx, change: &Change, action: &ChangeAction) -> anyhow::Result<()>;

    /// Invoked instead of the ChangeFilter/ApplyOne pipeline when
    /// `change_filter` returns `None` (unconditional kinds).
    async fn apply_unconditional(&self, _ctx: &ExecCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after all of a tick's ApplyOne calls finish, still
    /// inside the target mutex. Used by Quadlet's batched
    /// `daemon-reload` (spec.md §4.8/§8 property 8); a no-op for every
    /// other kind.
    async fn after_apply(&self, _ctx: &ExecCtx, _changes: &[(Change, ChangeAction)]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prune, Image and ConfigReload have no git target to diff at all (spec.md
/// §4.8: Input selector "n/a") — the Supervisor schedules them directly by
/// `schedule()`/`skew` rather than routing them through a MethodInstance's
/// Target-bound state machine (spec.md §4.4's materialise/zeroToCurrent/
/// currentToLatest steps don't apply to something with no commits).
#[async_trait]
pub trait PeriodicJob: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> MethodKind;
    fn schedule(&self) -> (&str, Option<u64>);
    async fn tick(&self, ctx: &ExecCtx) -> anyhow::Result<()>;
}

/// `Apply(ctx, podmanConn, from, to, tags) → error` (spec.md §4.3): given
/// two commits, compute the filtered changeset and dispatch each entry
/// through `ApplyOne`, fanning out when the executor declares it safe.
pub async fn run_apply(
    executor: &Arc<dyn Executor>,
    ctx: &ExecCtx,
    worktree: &(impl Worktree + ?Sized),
    base_dir: &Path,
    from: &CommitHash,
    to: &CommitHash,
) -> anyhow::Result<()> {
    let Some(filter) = executor.change_filter(base_dir)? else {
        return executor.apply_unconditional(ctx).await;
    };
    let from_tree = worktree
        .sub_tree(from, Path::new(""))
        .await
        .context("resolving `from` tree")?;
    let to_tree = worktree
        .sub_tree(to, Path::new(""))
        .await
        .context("resolving `to` tree")?;
    let raw_changes = worktree
        .diff_trees(&from_tree, &to_tree)
        .await
        .context("diffing trees")?;
    let changeset = filter.filter(&raw_changes);

    if changeset.is_empty() {
        return Ok(());
    }

    if executor.parallel_safe() {
        let mut group = ErrGroup::new(ctx.ct.clone());
        for (change, action) in changeset.clone() {
            let executor = executor.clone();
            let ctx = ctx.clone();
            group.spawn(async move { executor.apply_one(&ctx, &change, &action).await });
        }
        group.wait().await?;
    } else {
        for (change, action) in &changeset {
            executor.apply_one(ctx, change, action).await?;
        }
    }

    executor.after_apply(ctx, &changeset).await
}
