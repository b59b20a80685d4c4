// The per-(target,method) state machine (spec.md §4.4). `MethodInstance`
// is the spec's MethodInstance: one Executor bound to a Target, with its
// own applied-tag lineage and `initialRun` flag. `Process` implements the
// literal pseudocode in spec.md §4.4, including the conservative
// `zeroToCurrent` reading recorded as an Open Question decision in
// DESIGN.md.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::Mutex;

use crate::error::{ErrorContext, FailureKind};
use crate::executor::{run_apply, Executor, ExecCtx, MethodKind};
use crate::git::{CommitHash, Worktree};
use crate::status::StatusTracker;
use crate::target::Target;

/// Default location the `git` binary is invoked from. A Supervisor may
/// override this; it's threaded through rather than hardcoded at the
/// call site so tests can point at a fixed path.
pub const DEFAULT_GIT_BINARY: &str = "/usr/bin/git";

#[derive(Debug, Default)]
struct ReconcilerState {
    /// True until the first successful `Apply` completes (spec.md §3
    /// MethodInstance invariant).
    initial_run: bool,
}

/// One executor bound to one target (spec.md §3 MethodInstance). Holds a
/// weak reference to its Target (lookup by name via the TargetRegistry at
/// construction time, never ownership — spec.md §9 re-architecture
/// notes).
#[derive(Debug)]
pub struct MethodInstance {
    pub target: Arc<Target>,
    pub executor: Arc<dyn Executor>,
    pub git_binary: PathBuf,
    state: Mutex<ReconcilerState>,
    /// Last-tick bookkeeping (spec.md §8 property 1); see `status.rs`.
    pub status: StatusTracker,
}

impl MethodInstance {
    pub fn new(target: Arc<Target>, executor: Arc<dyn Executor>) -> Self {
        Self {
            target,
            executor,
            git_binary: PathBuf::from(DEFAULT_GIT_BINARY),
            state: Mutex::new(ReconcilerState { initial_run: true }),
            status: StatusTracker::new(),
        }
    }

    pub fn kind(&self) -> MethodKind {
        self.executor.kind()
    }

    pub fn name(&self) -> &str {
        self.executor.name()
    }

    /// `current-<kind>-<name>` (spec.md §3 AppliedTag).
    pub fn tag_name(&self) -> String {
        format!("current-{}-{}", self.kind(), self.name())
    }

    fn ctx(&self, target: &str, commit: Option<&CommitHash>) -> ErrorContext {
        ErrorContext {
            target: target.to_owned(),
            kind: self.kind().to_string(),
            name: self.name().to_owned(),
            commit_prefix: commit.map(|c| c.abbrev().to_owned()),
        }
    }

    /// `Process(ctx, podmanConn, skewMillis)` (spec.md §4.3/§4.4): the
    /// scheduler entry point. Never propagates errors; failures are
    /// logged and retried next tick (spec.md §7).
    pub async fn process(&self, ctx: &ExecCtx) {
        if let Err(err) = self.process_fallible(ctx).await {
            self.status.record_failed(err.to_string());
            err.log();
        }
    }

    async fn process_fallible(&self, ctx: &ExecCtx) -> Result<(), FailureKind> {
        // Step 1: sleep `skew` milliseconds (jitters bursts within the
        // same cron slot).
        if let (_, Some(skew)) = self.executor.schedule() {
            tokio::time::sleep(Duration::from_millis(skew)).await;
        }

        // Step 2: acquire the target's mutex (serialises all methods of
        // the same target).
        let _guard = self.target.mutex.lock().await;

        let initial_run = self.state.lock().await.initial_run;

        if initial_run {
            self.materialize(ctx).await.map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?;
        }

        let worktree = self
            .target
            .worktree(&self.git_binary)
            .await
            .map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?;

        if initial_run {
            self.zero_to_current(ctx, &worktree).await?;
        }

        self.current_to_latest(ctx, &worktree).await?;

        self.state.lock().await.initial_run = false;
        Ok(())
    }

    /// Step 3a: materialise the source (spec.md §4.4). Git URLs are
    /// handled lazily by `Target::worktree`; zip/device/local-path
    /// sources get their own materialisation here, per the re-
    /// architecture note that treats them as "an extra materialisation
    /// step of GitStore.Ensure" rather than separate methods.
    async fn materialize(&self, _ctx: &ExecCtx) -> anyhow::Result<()> {
        use crate::config::SourceKind;
        match &self.target.source {
            SourceKind::GitUrl(_) | SourceKind::LocalPath(_) => Ok(()),
            SourceKind::ZipUrl(url) => self.materialize_zip(url).await,
            SourceKind::BlockDevice(device) => self.materialize_device(device).await,
        }
    }

    async fn materialize_zip(&self, url: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.target.working_dir)
            .await
            .context("creating zip extraction directory")?;
        let bytes = reqwest::get(url)
            .await
            .context(format!("fetching zip archive {url}"))?
            .bytes()
            .await
            .context("reading zip archive body")?;
        let dest = self.target.working_dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let reader = std::io::Cursor::new(bytes);
            let mut archive = zip::ZipArchive::new(reader).context("opening zip archive")?;
            archive.extract(&dest).context("extracting zip archive")?;
            Ok(())
        })
        .await
        .context("zip extraction task panicked")??;
        Ok(())
    }

    /// Mount the configured block device and rsync via a throwaway
    /// privileged container (spec.md §4.4 step 3a). The mount/rsync
    /// mechanics themselves are an external collaborator (spec.md §1);
    /// this just drives the Podman side via `PodmanConn`.
    async fn materialize_device(&self, device: &std::path::Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.target.working_dir)
            .await
            .context("creating device sync destination")?;
        // The throwaway privileged container is a Podman concern; the
        // exact image/mount spec lives with PodmanConn since bit-exact
        // Podman REST calls are out of scope (spec.md §1).
        Err(anyhow::anyhow!(
            "block-device materialisation for target {:?} requires a mounted device at {:?}; \
             wire PodmanConn::sync_device to your host's mount tooling",
            self.target.name,
            device
        ))
    }

    /// Step 3b: `zeroToCurrent` (spec.md §4.4 + Open Question decision in
    /// DESIGN.md). Replays `Apply(zero -> current, tags)` only when a
    /// non-zero applied tag already exists; does nothing on a genuinely
    /// first-ever run, trusting `currentToLatest` to take it from there.
    async fn zero_to_current(&self, ctx: &ExecCtx, worktree: &crate::git::PersistentWorktree) -> Result<(), FailureKind> {
        let current = worktree
            .read_tag(&self.tag_name())
            .await
            .map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?
            .unwrap_or_else(CommitHash::zero);

        if current.is_zero() {
            return Ok(());
        }

        run_apply(
            &self.executor,
            ctx,
            worktree,
            &self.target.working_dir,
            &CommitHash::zero(),
            &current,
        )
        .await
        .map_err(|e| FailureKind::Apply {
            ctx: self.ctx(&self.target.name, Some(&current)),
            source: e,
        })
    }

    /// Step 4: `currentToLatest` (spec.md §4.4).
    async fn current_to_latest(&self, ctx: &ExecCtx, worktree: &crate::git::PersistentWorktree) -> Result<(), FailureKind> {
        let latest = self.latest(worktree).await?;

        let current = worktree
            .read_tag(&self.tag_name())
            .await
            .map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?
            .unwrap_or_else(CommitHash::zero);

        if latest == current {
            log::debug!(
                "{} up to date at {}",
                self.ctx(&self.target.name, Some(&latest)),
                latest.abbrev()
            );
            self.status.record_up_to_date();
            return Ok(());
        }

        // StateError check (spec.md §7): the applied tag must resolve to
        // a commit reachable from the configured branch. If it doesn't
        // any more (branch force-push), the tag itself is untrustworthy:
        // treat `current` as unset for *this* reconciliation (apply
        // zero->latest, not current->latest) instead of erroring out
        // before anything is applied and re-hitting the same guard
        // forever. This *is* spec.md §7's "fall back to initialRun=true"
        // — reconciling as though nothing had ever been applied — done
        // inline rather than deferred to a further tick, since deferring
        // it would mean the following, genuinely up-to-date tick replays
        // zero->latest all over again and violates the idempotent-tick
        // property (spec.md §8 property 1).
        let from = if current.is_zero() {
            current.clone()
        } else if self.commit_is_reachable(worktree, &current).await.map_err(|e| FailureKind::State {
            ctx: self.ctx(&self.target.name, Some(&current)),
            source: e,
        })? {
            current.clone()
        } else {
            log::warn!(
                "{} applied tag no longer reachable from branch {:?} (force-push?); reconverging from zero",
                self.ctx(&self.target.name, Some(&current)),
                self.target.branch
            );
            worktree.delete_tag(&self.tag_name()).await.ok();
            CommitHash::zero()
        };

        run_apply(&self.executor, ctx, worktree, &self.target.working_dir, &from, &latest)
            .await
            .map_err(|e| FailureKind::Apply {
                ctx: self.ctx(&self.target.name, Some(&latest)),
                source: e,
            })?;

        worktree
            .set_tag(&self.tag_name(), &latest)
            .await
            .map_err(|e| FailureKind::Apply {
                ctx: self.ctx(&self.target.name, Some(&latest)),
                source: e,
            })?;

        self.status.record_applied(latest);
        Ok(())
    }

    async fn commit_is_reachable(&self, worktree: &crate::git::PersistentWorktree, commit: &CommitHash) -> anyhow::Result<bool> {
        worktree.is_ancestor(commit, &self.target.branch).await
    }

    /// `GitStore.Latest(target)` (spec.md §4.1), including the
    /// disconnected-target fallback and signature verification.
    async fn latest(&self, worktree: &crate::git::PersistentWorktree) -> Result<CommitHash, FailureKind> {
        if !self.target.disconnected {
            if let Err(e) = worktree.fetch_branch("origin", &self.target.branch, self.target.auth.as_ref()).await {
                if self.target.disconnected {
                    log::debug!("fetch failed for disconnected target {:?}: {e}", self.target.name);
                } else {
                    return Err(FailureKind::Source {
                        ctx: self.ctx(&self.target.name, None),
                        source: e,
                    });
                }
            }
        }

        let commit = worktree
            .rev_parse(self.target.branch.as_str())
            .await
            .map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?
            .context("resolving branch head")
            .map_err(|e| FailureKind::Source {
                ctx: self.ctx(&self.target.name, None),
                source: e,
            })?;

        worktree.checkout(&commit.hash).await.map_err(|e| FailureKind::Source {
            ctx: self.ctx(&self.target.name, Some(&commit.hash)),
            source: e,
        })?;

        if let Some(verify) = &self.target.verify {
            if verify.gitsign_verify {
                let rekor_url = verify
                    .gitsign_rekor_url
                    .clone()
                    .unwrap_or_else(|| "https://rekor.sigstore.dev".to_owned());
                crate::signature::verify_commit(worktree, &commit.hash, &rekor_url)
                    .await
                    .map_err(|e| FailureKind::Verification {
                        ctx: self.ctx(&self.target.name, Some(&commit.hash)),
                        source: e,
                    })?;
            }
        }

        Ok(commit.hash)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::change::{Change, ChangeAction, ChangeFilter};
    use crate::git::test_utils::{TempRepo, WorktreeExt};
    use crate::podman::test_utils::NoopPodman;
    use crate::systemd_dbus::test_utils::NoopSystemd;

    use super::*;

    #[derive(Debug)]
    struct CountingExecutor {
        name: String,
        applied: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        fn kind(&self) -> MethodKind {
            MethodKind::Raw
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn schedule(&self) -> (&str, Option<u64>) {
            ("@every 1m", None)
        }

        fn change_filter(&self, base_dir: &std::path::Path) -> anyhow::Result<Option<ChangeFilter>> {
            Ok(Some(ChangeFilter::new(base_dir, "", None, None)?))
        }

        async fn apply_one(&self, _ctx: &ExecCtx, _change: &Change, _action: &ChangeAction) -> anyhow::Result<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_ctx() -> ExecCtx {
        ExecCtx {
            podman: Arc::new(NoopPodman::default()),
            systemd: Arc::new(NoopSystemd::default()),
            ct: CancellationToken::new(),
        }
    }

    async fn current_branch_name(repo: &TempRepo) -> String {
        repo.current_branch().await.unwrap()
    }

    #[tokio::test]
    async fn test_idempotent_tick_does_not_reapply() {
        let repo = TempRepo::new().await.unwrap();
        repo.write_file("web.json", "v1").await.unwrap();
        repo.commit("one").await.unwrap();
        let branch = current_branch_name(&repo).await;

        let target = Arc::new(Target::for_test("t1", repo.path().to_owned(), &branch));

        let applied = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn Executor> = Arc::new(CountingExecutor {
            name: "web".to_owned(),
            applied: applied.clone(),
        });
        let instance = MethodInstance::new(target, executor);
        let ctx = test_ctx();

        instance.process(&ctx).await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        instance.process(&ctx).await;
        assert_eq!(
            applied.load(Ordering::SeqCst),
            1,
            "second tick with no upstream change must not re-apply"
        );
    }

    #[tokio::test]
    async fn test_new_commit_triggers_apply_and_advances_tag() {
        let repo = TempRepo::new().await.unwrap();
        repo.write_file("web.json", "v1").await.unwrap();
        repo.commit("one").await.unwrap();
        let branch = current_branch_name(&repo).await;

        let target = Arc::new(Target::for_test("t1", repo.path().to_owned(), &branch));
        let applied = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn Executor> = Arc::new(CountingExecutor {
            name: "web".to_owned(),
            applied: applied.clone(),
        });
        let instance = MethodInstance::new(target.clone(), executor);
        let ctx = test_ctx();

        instance.process(&ctx).await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        // `latest()` leaves the clone's HEAD detached at the applied commit;
        // reattach to the branch before adding the next one, same as a real
        // upstream push would land on the branch ref rather than HEAD.
        repo.checkout_branch(&branch).await.unwrap();
        repo.write_file("web.json", "v2").await.unwrap();
        let second = repo.commit("two").await.unwrap();

        instance.process(&ctx).await;
        assert_eq!(applied.load(Ordering::SeqCst), 2);

        let worktree = target.worktree(std::path::Path::new(DEFAULT_GIT_BINARY)).await.unwrap();
        let tag = worktree.read_tag(&instance.tag_name()).await.unwrap();
        assert_eq!(tag, Some(second.hash));
    }

    #[tokio::test]
    async fn test_force_push_past_applied_tag_reconverges_instead_of_wedging() {
        let repo = TempRepo::new().await.unwrap();
        repo.write_file("web.json", "v1").await.unwrap();
        let first = repo.commit("one").await.unwrap();
        let branch = current_branch_name(&repo).await;

        let target = Arc::new(Target::for_test("t1", repo.path().to_owned(), &branch));
        let applied = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn Executor> = Arc::new(CountingExecutor {
            name: "web".to_owned(),
            applied: applied.clone(),
        });
        let instance = MethodInstance::new(target.clone(), executor);
        let ctx = test_ctx();

        instance.process(&ctx).await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        let worktree = target.worktree(std::path::Path::new(DEFAULT_GIT_BINARY)).await.unwrap();
        assert_eq!(worktree.read_tag(&instance.tag_name()).await.unwrap(), Some(first.hash.clone()));

        // Simulate a force-push: rewrite `branch` onto an unrelated root
        // commit so the applied tag (`first`) is no longer reachable from
        // it, without deleting `first`'s object.
        repo.checkout_orphan("rewritten-history").await.unwrap();
        repo.write_file("web.json", "v2").await.unwrap();
        let rewritten = repo.commit("rewritten root").await.unwrap();
        repo.force_branch(&branch, &rewritten.hash).await.unwrap();
        repo.checkout_branch(&branch).await.unwrap();

        instance.process(&ctx).await;
        assert_eq!(
            applied.load(Ordering::SeqCst),
            2,
            "tick must make forward progress instead of repeatedly hitting the same StateError"
        );
        assert_eq!(
            worktree.read_tag(&instance.tag_name()).await.unwrap(),
            Some(rewritten.hash),
            "tag must advance past the unreachable applied commit, not stay wedged"
        );

        // A following tick with no further upstream change must not
        // re-apply (idempotent tick, spec.md §8 property 1), confirming
        // the instance isn't left in a permanently-resetting state.
        instance.process(&ctx).await;
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }
}
