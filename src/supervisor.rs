// Supervisor (spec.md §4.7): process-wide singleton. Owns the Podman
// connection, the systemd D-Bus connection, the Scheduler, and the
// mutable pointer to the current TargetRegistry. `run()` is the entry
// point `main.rs`'s `fetchit start` calls into (spec.md §6 CLI).
//
// Per spec.md §9 re-architecture notes ("shared mutable singletons...
// become fields of a Supervisor value threaded explicitly; tests
// instantiate their own Supervisor"), nothing here is a lazily-initialised
// global: every field is constructed in `Supervisor::new` and owned by
// the returned value.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{podman_socket_path, ConfigLoader, ConfigSource, DeviceConfigSource, HttpConfigSource, RootConfig};
use crate::executor::{ExecCtx, PeriodicJob};
use crate::methods::{ConfigReloadExecutor, ImageExecutor, PodmanAutoUpdateExecutor, PruneExecutor};
use crate::podman::{PodmanClient, PodmanConn};
use crate::reconciler::DEFAULT_GIT_BINARY;
use crate::scheduler::Scheduler;
use crate::systemd_dbus::{SystemdClient, SystemdConn};
use crate::target::TargetRegistry;

/// The helper image fetchit's own FileTransfer/Ansible executors rely on
/// (spec.md §4.7: "prefetches a base image the agent itself needs").
const AGENT_BASE_IMAGE: &str = "docker.io/library/busybox:latest";

pub struct Supervisor {
    config_loader: ConfigLoader,
    clones_dir: PathBuf,
    cache_dir: PathBuf,
    podman: Arc<dyn PodmanConn>,
    systemd: Arc<dyn SystemdConn>,
    ct: CancellationToken,
    registry: RwLock<Arc<TargetRegistry>>,
    scheduler: AsyncMutex<Scheduler>,
    restart_tx: mpsc::Sender<()>,
    restart_rx: AsyncMutex<mpsc::Receiver<()>>,
}

impl Supervisor {
    /// Opens the Podman and systemd connections (spec.md §6 "Outbound
    /// sockets") once, for the life of the process (spec.md §5: "All
    /// tasks share one Podman connection and one systemd D-Bus
    /// connection"). `clones_dir` is where git-sourced targets' working
    /// trees live; `cache_dir` backs disconnected-mode image/config
    /// caching (spec.md §6 "Persisted state").
    pub async fn new(config_loader: ConfigLoader, clones_dir: PathBuf, cache_dir: PathBuf) -> anyhow::Result<Self> {
        let socket = podman_socket_path();
        let uri = format!("unix://{}", socket.display());
        let podman: Arc<dyn PodmanConn> =
            Arc::new(PodmanClient::connect(&uri).with_context(|| format!("connecting to podman socket {uri:?}"))?);

        let root = nix::unistd::Uid::effective().is_root();
        let systemd: Arc<dyn SystemdConn> = Arc::new(
            SystemdClient::connect(root)
                .await
                .context("connecting to systemd D-Bus")?,
        );

        let scheduler = Scheduler::new().await.context("creating scheduler")?;
        let (restart_tx, restart_rx) = mpsc::channel(1);

        Ok(Self {
            config_loader,
            clones_dir,
            cache_dir,
            podman,
            systemd,
            ct: CancellationToken::new(),
            registry: RwLock::new(Arc::new(TargetRegistry::default())),
            scheduler: AsyncMutex::new(scheduler),
            restart_tx,
            restart_rx: AsyncMutex::new(restart_rx),
        })
    }

    fn ctx(&self) -> ExecCtx {
        ExecCtx {
            podman: self.podman.clone(),
            systemd: self.systemd.clone(),
            ct: self.ct.clone(),
        }
    }

    /// `Run()` (spec.md §4.7): loads config, prefetches the agent's own
    /// base image, installs always-on targets, starts the scheduler, and
    /// blocks until terminated.
    pub async fn run(&self) -> anyhow::Result<()> {
        let config = self
            .config_loader
            .load()
            .await
            .context("loading initial configuration")?;

        if let Err(e) = self.podman.pull_image(AGENT_BASE_IMAGE, true).await {
            log::warn!("failed to prefetch agent base image {AGENT_BASE_IMAGE:?}: {e:#}");
        }

        self.load_and_register(config)
            .await
            .context("registering initial target set")?;
        self.scheduler.lock().await.start().await.context("starting scheduler")?;

        let mut restart_rx = self.restart_rx.lock().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received shutdown signal, draining in-flight ticks");
                    break;
                }
                Some(()) = restart_rx.recv() => {
                    if let Err(e) = self.restart().await {
                        log::error!("config restart failed, keeping previous target set: {e:#}");
                    }
                }
            }
        }

        self.ct.cancel();
        self.scheduler.lock().await.shutdown().await.ok();
        Ok(())
    }

    /// `ConfigLoader::Restart()` (spec.md §4.6): remove every scheduled
    /// job, re-parse config, rebuild the TargetRegistry, re-register. The
    /// scheduler's background loop itself is left running; only its job
    /// set is torn down and rebuilt (spec.md §8 property 6: "no job
    /// tagged with a kind that is no longer present in the new config
    /// fires again").
    async fn restart(&self) -> anyhow::Result<()> {
        log::info!("restarting with reloaded configuration");
        let config = self.config_loader.load().await.context("reloading configuration")?;
        self.scheduler
            .lock()
            .await
            .clear()
            .await
            .context("clearing scheduler for restart")?;
        self.load_and_register(config)
            .await
            .context("re-registering target set")?;
        Ok(())
    }

    /// Builds a fresh `TargetRegistry` from `config` and registers every
    /// MethodInstance plus process-wide periodic job (Prune/Image/
    /// ConfigReload) with the scheduler (spec.md §4.7 "installs any
    /// always-on targets").
    async fn load_and_register(&self, config: RootConfig) -> anyhow::Result<()> {
        let registry = TargetRegistry::build(&config, &self.clones_dir).context("building target registry")?;
        let registry = Arc::new(registry);

        {
            let mut scheduler = self.scheduler.lock().await;
            for method in registry.methods() {
                scheduler
                    .register_method(method.clone(), self.ctx())
                    .await
                    .with_context(|| format!("registering method {}/{}", method.kind(), method.name()))?;
            }

            if let Some(prune_cfg) = &config.prune {
                let job: Arc<dyn PeriodicJob> = Arc::new(PruneExecutor::new(prune_cfg.clone()));
                scheduler
                    .register_periodic(job, self.ctx())
                    .await
                    .context("registering prune job")?;
            }

            if let Some(auto_update_cfg) = &config.podman_auto_update {
                let job: Arc<dyn PeriodicJob> = Arc::new(PodmanAutoUpdateExecutor::new(auto_update_cfg.clone()));
                scheduler
                    .register_periodic(job, self.ctx())
                    .await
                    .context("registering podmanAutoUpdate job")?;
            }

            for image_cfg in &config.images {
                let job: Arc<dyn PeriodicJob> = Arc::new(ImageExecutor::new(image_cfg.clone(), self.cache_dir.clone()));
                scheduler
                    .register_periodic(job, self.ctx())
                    .await
                    .context("registering image job")?;
            }

            if let Some(reload_cfg) = &config.config_reload {
                let source = self.config_reload_source(reload_cfg)?;
                let loader = match &reload_cfg.config_path {
                    Some(path) => ConfigLoader::new(PathBuf::from(path), self.config_loader.backup_path.clone()),
                    None => self.config_loader.clone(),
                };
                let job: Arc<dyn PeriodicJob> = Arc::new(ConfigReloadExecutor::new(
                    reload_cfg.clone(),
                    loader,
                    source,
                    self.restart_tx.clone(),
                ));
                scheduler
                    .register_periodic(job, self.ctx())
                    .await
                    .context("registering configReload job")?;
            }
        }

        *self.registry.write().await = registry;
        Ok(())
    }

    /// Priority order for the ConfigReload source (spec.md §4.6): the
    /// target's declared `configURL`, then its `device`, then the
    /// `FETCHIT_CONFIG_URL` environment variable (spec.md §6 "Environment
    /// variables").
    fn config_reload_source(&self, reload_cfg: &crate::config::ConfigReloadConfig) -> anyhow::Result<Arc<dyn ConfigSource>> {
        if let Some(url) = &reload_cfg.config_url {
            return Ok(Arc::new(HttpConfigSource {
                url: url.clone(),
                client: reqwest::Client::new(),
            }));
        }
        if let Some(device) = &reload_cfg.device {
            return Ok(Arc::new(DeviceConfigSource { path: PathBuf::from(device) }));
        }
        let url = std::env::var("FETCHIT_CONFIG_URL")
            .context("configReload has neither configURL nor device set, and FETCHIT_CONFIG_URL is unset")?;
        Ok(Arc::new(HttpConfigSource { url, client: reqwest::Client::new() }))
    }

    #[cfg(test)]
    pub async fn registry(&self) -> Arc<TargetRegistry> {
        self.registry.read().await.clone()
    }

    #[cfg(test)]
    pub fn git_binary() -> &'static str {
        DEFAULT_GIT_BINARY
    }
}
