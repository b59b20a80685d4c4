// Image (spec.md §4.8): downloads/streams an image tarball from a URL or
// a mounted device, loads it via Podman, and flushes the local copy if the
// source later becomes unreachable. Has no git target to diff against
// (Input selector "n/a"), so it runs as a `PeriodicJob` rather than an
// `Executor`.

use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::ImageConfig;
use crate::executor::{ExecCtx, MethodKind, PeriodicJob};

#[derive(Debug)]
pub struct ImageExecutor {
    config: ImageConfig,
    cache_dir: PathBuf,
    /// The tarball path last successfully loaded, kept around so a later
    /// unreachable-source tick knows what to flush (spec.md §4.8: "flush
    /// local copy if source becomes unreachable"). The image's own name
    /// inside Podman is whatever the tar's embedded manifest declares, not
    /// something this crate assigns, so what's tracked is the cached file.
    last_loaded: Mutex<Option<PathBuf>>,
}

impl ImageExecutor {
    pub fn new(config: ImageConfig, cache_dir: PathBuf) -> Self {
        Self {
            config,
            cache_dir,
            last_loaded: Mutex::new(None),
        }
    }

    fn cache_path(&self) -> PathBuf {
        let key = self
            .config
            .url
            .as_deref()
            .or(self.config.image_path.as_deref())
            .unwrap_or("image");
        self.cache_dir.join(crate::git::working_dir_name(key)).with_extension("tar")
    }
}

#[async_trait]
impl PeriodicJob for ImageExecutor {
    fn kind(&self) -> MethodKind {
        MethodKind::Image
    }

    fn schedule(&self) -> (&str, Option<u64>) {
        (&self.config.schedule, self.config.skew)
    }

    async fn tick(&self, ctx: &ExecCtx) -> anyhow::Result<()> {
        let dest = self.cache_path();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.context("creating image cache directory")?;
        }

        let fetch_result: anyhow::Result<()> = async {
            if let Some(url) = &self.config.url {
                let bytes = reqwest::get(url)
                    .await
                    .context(format!("fetching image tar {url}"))?
                    .bytes()
                    .await
                    .context("reading image tar body")?;
                tokio::fs::write(&dest, &bytes).await.context("writing cached image tar")?;
            } else if let Some(path) = &self.config.image_path {
                tokio::fs::copy(path, &dest).await.context(format!("copying image tar from {path:?}"))?;
            } else {
                anyhow::bail!("image method {:?} has neither url nor imagePath configured", self.config.schedule);
            }
            Ok(())
        }
        .await;

        if let Err(e) = fetch_result {
            let mut last = self.last_loaded.lock().await;
            if let Some(stale) = last.take() {
                log::warn!("image source unreachable ({e:#}); flushing previously loaded tar {stale:?}");
                tokio::fs::remove_file(&stale).await.ok();
            }
            return Err(e);
        }

        ctx.podman.image_load(&dest).await.context("loading fetched image tar")?;
        *self.last_loaded.lock().await = Some(dest);
        Ok(())
    }
}
