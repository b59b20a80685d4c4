// The Podman REST connection (spec.md §6 "Outbound sockets" + §7
// ApplyError). Bit-exact request bodies are an external collaborator
// (spec.md §1); `PodmanConn` only fixes the interface the executors in
// `methods/` actually call, backed by `podman-api` over the host's unix
// socket. Kept behind a trait object (spec.md §5 "All tasks share one
// Podman connection") so tests substitute `test_utils::NoopPodman`.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;
use podman_api::opts::{
    ContainerCreateOpts, ContainerDeleteOpts, ContainerStopOpts, ImagePullOpts, PullPolicy,
    SystemPruneOpts,
};
use podman_api::Podman;

/// A minimal container spec understood by the Raw and FileTransfer/Ansible
/// helper-container paths (spec.md §4.8 table). Kube's multi-doc YAML is
/// handled via `kube_play`/`kube_down` instead, since Podman exposes that
/// as its own play/down pair rather than create+start.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub binds: Vec<(String, String)>,
    pub privileged: bool,
}

/// The Podman surface the executors need (spec.md §6). One connection is
/// opened for the life of the process and shared by every tick.
#[async_trait]
pub trait PodmanConn: Send + Sync {
    /// Stop then remove a container by name, ignoring "no such container"
    /// (spec.md §4.8 Raw: "if a container of that name exists, stop+remove").
    async fn stop_and_remove(&self, name: &str) -> anyhow::Result<()>;

    /// Pull `image` unless `only_if_missing` is true and it's already
    /// present locally (spec.md §4.8 Raw: "pull image if missing or
    /// `pullImage=true`").
    async fn pull_image(&self, image: &str, only_if_missing: bool) -> anyhow::Result<()>;

    /// Create and start a container from `spec` (spec.md §4.8 Raw).
    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<()>;

    /// Run a throwaway container to completion and return its exit code
    /// (spec.md §4.8 FileTransfer/Ansible: "launch a helper container").
    async fn run_to_completion(&self, spec: &ContainerSpec) -> anyhow::Result<i64>;

    /// Stop containers backed by pods declared in `yaml_path`, without
    /// removing the pod definition (spec.md §4.8 Kube: "stop matching pods
    /// via Podman's kube-play API").
    async fn kube_down(&self, yaml_path: &Path) -> anyhow::Result<()>;

    /// Play (or replay) the multi-doc YAML at `yaml_path` (spec.md §4.8
    /// Kube).
    async fn kube_play(&self, yaml_path: &Path) -> anyhow::Result<()>;

    /// Load an image tarball from `tar_path` (spec.md §4.8 Image:
    /// "download/stream tar, call Podman image-load").
    async fn image_load(&self, tar_path: &Path) -> anyhow::Result<()>;

    /// Remove an image by name/reference, ignoring "no such image" (spec.md
    /// §4.8 Image: "flush local copy if source becomes unreachable").
    async fn remove_image(&self, image: &str) -> anyhow::Result<()>;

    /// `podman system prune` (spec.md §4.8 Prune).
    async fn system_prune(&self, volumes: bool, all: bool) -> anyhow::Result<()>;
}

/// Connects to `uri` (spec.md §6: `unix:///run/podman/podman.sock` or the
/// rootless `XDG_RUNTIME_DIR` variant). Resolving which socket path to use
/// is the Supervisor's job (`config::podman_socket_path`); this just wraps
/// whatever URI it's given.
pub struct PodmanClient {
    podman: Podman,
}

impl PodmanClient {
    pub fn connect(uri: &str) -> anyhow::Result<Self> {
        let podman = Podman::new(uri).with_context(|| format!("connecting to podman socket {uri:?}"))?;
        Ok(Self { podman })
    }
}

impl std::fmt::Debug for PodmanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodmanClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl PodmanConn for PodmanClient {
    async fn stop_and_remove(&self, name: &str) -> anyhow::Result<()> {
        let container = self.podman.containers().get(name);
        match container.stop(&ContainerStopOpts::default()).await {
            Ok(_) => {}
            Err(podman_api::Error::Fault { code, .. }) if code.as_u16() == 404 || code.as_u16() == 304 => {}
            Err(e) => return Err(e).context(format!("stopping container {name:?}")),
        }
        match container.delete(&ContainerDeleteOpts::default().force(true)).await {
            Ok(_) => Ok(()),
            Err(podman_api::Error::Fault { code, .. }) if code.as_u16() == 404 => Ok(()),
            Err(e) => Err(e).context(format!("removing container {name:?}")),
        }
    }

    async fn pull_image(&self, image: &str, only_if_missing: bool) -> anyhow::Result<()> {
        if only_if_missing && self.podman.images().get(image).exists().await.unwrap_or(false) {
            return Ok(());
        }
        let opts = ImagePullOpts::builder()
            .reference(image)
            .policy(PullPolicy::Always)
            .build();
        let mut stream = self.podman.images().pull(&opts);
        use futures::StreamExt as _;
        while let Some(report) = stream.next().await {
            report.with_context(|| format!("pulling image {image:?}"))?;
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<()> {
        let opts = ContainerCreateOpts::builder()
            .name(&spec.name)
            .image(&spec.image)
            .command(&spec.command)
            .privileged(spec.privileged)
            .volumes(spec.binds.iter().map(|(host, ctr)| format!("{host}:{ctr}")))
            .build();
        let container = self
            .podman
            .containers()
            .create(&opts)
            .await
            .with_context(|| format!("creating container {:?}", spec.name))?;
        container
            .start(None)
            .await
            .with_context(|| format!("starting container {:?}", spec.name))?;
        Ok(())
    }

    async fn run_to_completion(&self, spec: &ContainerSpec) -> anyhow::Result<i64> {
        self.create_and_start(spec).await?;
        let container = self.podman.containers().get(&spec.name);
        container
            .wait(&Default::default())
            .await
            .with_context(|| format!("waiting for helper container {:?}", spec.name))?;
        let inspect = container
            .inspect()
            .await
            .with_context(|| format!("inspecting helper container {:?}", spec.name))?;
        let code = inspect.state.and_then(|s| s.exit_code).unwrap_or(-1);
        self.stop_and_remove(&spec.name).await?;
        Ok(code)
    }

    async fn kube_down(&self, yaml_path: &Path) -> anyhow::Result<()> {
        let yaml = tokio::fs::read(yaml_path)
            .await
            .with_context(|| format!("reading kube yaml {yaml_path:?}"))?;
        match self.podman.remove_kubernetes_yaml(&yaml, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(podman_api::Error::Fault { code, .. }) if code.as_u16() == 404 => Ok(()),
            Err(e) => Err(e).context(format!("stopping kube pods for {yaml_path:?}")),
        }
    }

    async fn kube_play(&self, yaml_path: &Path) -> anyhow::Result<()> {
        let yaml = tokio::fs::read(yaml_path)
            .await
            .with_context(|| format!("reading kube yaml {yaml_path:?}"))?;
        self.podman
            .play_kubernetes(&yaml, &Default::default())
            .await
            .with_context(|| format!("playing kube yaml {yaml_path:?}"))?;
        Ok(())
    }

    async fn image_load(&self, tar_path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(tar_path)
            .await
            .with_context(|| format!("reading image tar {tar_path:?}"))?;
        self.podman
            .images()
            .import(&Default::default(), bytes)
            .await
            .with_context(|| format!("loading image tar {tar_path:?}"))?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> anyhow::Result<()> {
        match self.podman.images().get(image).remove().await {
            Ok(_) => Ok(()),
            Err(podman_api::Error::Fault { code, .. }) if code.as_u16() == 404 => Ok(()),
            Err(e) => Err(e).context(format!("removing image {image:?}")),
        }
    }

    async fn system_prune(&self, volumes: bool, all: bool) -> anyhow::Result<()> {
        let opts = SystemPruneOpts::builder().volumes(volumes).all(all).build();
        self.podman
            .system()
            .prune(&opts)
            .await
            .context("pruning podman system resources")?;
        Ok(())
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::sync::Mutex;

    use super::*;

    /// Records every call for assertions without touching a real socket
    /// (spec.md §8 "testable properties" rely on this for the Executor
    /// state-machine tests, which don't exercise Podman itself).
    #[derive(Debug, Default)]
    pub struct NoopPodman {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PodmanConn for NoopPodman {
        async fn stop_and_remove(&self, name: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("stop_and_remove({name})"));
            Ok(())
        }

        async fn pull_image(&self, image: &str, only_if_missing: bool) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("pull_image({image}, {only_if_missing})"));
            Ok(())
        }

        async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("create_and_start({})", spec.name));
            Ok(())
        }

        async fn run_to_completion(&self, spec: &ContainerSpec) -> anyhow::Result<i64> {
            self.calls.lock().unwrap().push(format!("run_to_completion({})", spec.name));
            Ok(0)
        }

        async fn kube_down(&self, yaml_path: &Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("kube_down({yaml_path:?})"));
            Ok(())
        }

        async fn kube_play(&self, yaml_path: &Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("kube_play({yaml_path:?})"));
            Ok(())
        }

        async fn image_load(&self, tar_path: &Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("image_load({tar_path:?})"));
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("remove_image({image})"));
            Ok(())
        }

        async fn system_prune(&self, volumes: bool, all: bool) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("system_prune({volumes}, {all})"));
            Ok(())
        }
    }
}
