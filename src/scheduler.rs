// Scheduler (spec.md §4.5): wraps a cron engine. Registration is flat, one
// job per MethodInstance or process-wide PeriodicJob, each tagged by
// `MethodKind` so `ConfigLoader::restart` (spec.md §4.6) can tear down
// selectively. Built on `tokio-cron-scheduler`, the async-tokio analogue
// of the `robfig/cron` engine the original agent wraps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::executor::{ExecCtx, MethodKind, PeriodicJob};
use crate::reconciler::MethodInstance;

struct JobHandle {
    id: Uuid,
    kind: MethodKind,
}

/// `StartImmediately` semantics (spec.md §4.5: "the first tick fires as
/// soon as `StartAsync` returns"; "subsequent ticks obey the cron
/// expression") plus "the next tick is skipped, not queued" (spec.md §5):
/// implemented by spawning one unconditional tick at registration time,
/// outside the cron engine's own timer, and guarding every cron-triggered
/// invocation with a per-job `busy` flag.
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Vec<JobHandle>,
}

impl Scheduler {
    pub async fn new() -> anyhow::Result<Self> {
        let inner = JobScheduler::new().await.context("creating cron scheduler")?;
        Ok(Self { inner, jobs: Vec::new() })
    }

    /// Registers one MethodInstance's `Process` as a cron job (spec.md
    /// §4.5). `skew` is handled inside `MethodInstance::process` itself
    /// (spec.md §4.4 step 1), so the job body here is just the tick.
    pub async fn register_method(&mut self, instance: Arc<MethodInstance>, ctx: ExecCtx) -> anyhow::Result<()> {
        let (cron_expr, _skew) = instance.executor.schedule();
        let cron_expr = cron_expr.to_owned();
        let kind = instance.kind();

        {
            let instance = instance.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { instance.process(&ctx).await });
        }

        let busy = Arc::new(AtomicBool::new(false));
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _scheduler| {
            let instance = instance.clone();
            let ctx = ctx.clone();
            let busy = busy.clone();
            Box::pin(async move {
                if busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                    log::warn!(
                        "method {}/{} tick still running, skipping this cron slot",
                        instance.kind(),
                        instance.name()
                    );
                    return;
                }
                instance.process(&ctx).await;
                busy.store(false, Ordering::SeqCst);
            })
        })
        .with_context(|| format!("building cron job for schedule {cron_expr:?}"))?;

        let id = self.inner.add(job).await.context("adding cron job to scheduler")?;
        self.jobs.push(JobHandle { id, kind });
        Ok(())
    }

    /// Registers a process-wide `PeriodicJob` (Prune/Image/ConfigReload;
    /// spec.md §4.8: these kinds have no git target to bind a
    /// MethodInstance to).
    pub async fn register_periodic(&mut self, job_impl: Arc<dyn PeriodicJob>, ctx: ExecCtx) -> anyhow::Result<()> {
        let (cron_expr, _skew) = job_impl.schedule();
        let cron_expr = cron_expr.to_owned();
        let kind = job_impl.kind();

        {
            let job_impl = job_impl.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = job_impl.tick(&ctx).await {
                    log::error!("{} tick failed: {e:#}", job_impl.kind());
                }
            });
        }

        let busy = Arc::new(AtomicBool::new(false));
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _scheduler| {
            let job_impl = job_impl.clone();
            let ctx = ctx.clone();
            let busy = busy.clone();
            Box::pin(async move {
                if busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                    log::warn!("{} tick still running, skipping this cron slot", job_impl.kind());
                    return;
                }
                if let Err(e) = job_impl.tick(&ctx).await {
                    log::error!("{} tick failed: {e:#}", job_impl.kind());
                }
                busy.store(false, Ordering::SeqCst);
            })
        })
        .with_context(|| format!("building cron job for schedule {cron_expr:?}"))?;

        let id = self.inner.add(job).await.context("adding cron job to scheduler")?;
        self.jobs.push(JobHandle { id, kind });
        Ok(())
    }

    /// Starts the cron engine's background tick loop (spec.md §4.5: "the
    /// scheduler starts asynchronously"). Call once; jobs added
    /// afterwards (e.g. during a later `register_method` call) are picked
    /// up without a second `start`.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.inner.start().await.context("starting cron scheduler")
    }

    /// Removes every job tagged with `kind` (spec.md §4.6 `Restart`:
    /// "remove every scheduled job (by kind tag)").
    pub async fn remove_kind(&mut self, kind: MethodKind) -> anyhow::Result<()> {
        let (to_remove, remaining): (Vec<_>, Vec<_>) = self.jobs.drain(..).partition(|j| j.kind == kind);
        for job in to_remove {
            self.inner.remove(&job.id).await.context("removing cron job")?;
        }
        self.jobs = remaining;
        Ok(())
    }

    /// Removes every job (spec.md §4.6 `Restart`: "clear the scheduler").
    pub async fn clear(&mut self) -> anyhow::Result<()> {
        for job in self.jobs.drain(..) {
            self.inner.remove(&job.id).await.context("removing cron job")?;
        }
        Ok(())
    }

    /// Cancels the parent context and stops the cron engine (spec.md §5
    /// "Cancellation & timeout": "on process shutdown the root context is
    /// cancelled; in-flight ticks finish their current syscall and
    /// return").
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("shutting down cron scheduler")
    }

    #[cfg(test)]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    #[cfg(test)]
    pub fn job_count_for_kind(&self, kind: MethodKind) -> usize {
        self.jobs.iter().filter(|j| j.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::podman::test_utils::NoopPodman;
    use crate::systemd_dbus::test_utils::NoopSystemd;

    use super::*;

    #[derive(Debug)]
    struct NoopPeriodic {
        kind: MethodKind,
    }

    #[async_trait]
    impl PeriodicJob for NoopPeriodic {
        fn kind(&self) -> MethodKind {
            self.kind
        }

        fn schedule(&self) -> (&str, Option<u64>) {
            ("0 0 0 1 1 * 2099", None)
        }

        async fn tick(&self, _ctx: &ExecCtx) -> anyhow::Result<()> {
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

    #[tokio::test]
    async fn test_remove_kind_only_removes_matching_jobs() {
        let mut scheduler = Scheduler::new().await.unwrap();
        scheduler
            .register_periodic(Arc::new(NoopPeriodic { kind: MethodKind::Prune }), test_ctx())
            .await
            .unwrap();
        scheduler
            .register_periodic(Arc::new(NoopPeriodic { kind: MethodKind::Image }), test_ctx())
            .await
            .unwrap();

        assert_eq!(scheduler.job_count(), 2);
        scheduler.remove_kind(MethodKind::Prune).await.unwrap();
        assert_eq!(scheduler.job_count(), 1);
        assert_eq!(scheduler.job_count_for_kind(MethodKind::Image), 1);
        assert_eq!(scheduler.job_count_for_kind(MethodKind::Prune), 0);
    }

    #[tokio::test]
    async fn test_clear_removes_all_jobs() {
        let mut scheduler = Scheduler::new().await.unwrap();
        scheduler
            .register_periodic(Arc::new(NoopPeriodic { kind: MethodKind::Prune }), test_ctx())
            .await
            .unwrap();
        scheduler.clear().await.unwrap();
        assert_eq!(scheduler.job_count(), 0);
    }
}
