// fetchit's declarative config model (spec.md §3, §6) and the ConfigLoader
// that fetches/validates/atomically-swaps it (spec.md §4.6). Shape and
// derive style (serde + schemars, untagged sum types) is the teacher's
// `config.rs` pattern, reapplied: the wire format here is YAML rather than
// TOML since spec.md §6 is explicit about that.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
#[allow(unused_imports)]
use log::debug;
use schemars::JsonSchema;
use serde::Deserialize;

/// One of the four source kinds a Target can have (spec.md §3). Which
/// variant applies is inferred from which of `url`/`device`/`localPath` is
/// present in the YAML, and for `url`, whether it ends in `.zip` (spec.md
/// leaves this undiscriminated in its literal config shape; this is the
/// Open Question-style call recorded in DESIGN.md).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    GitUrl(String),
    ZipUrl(String),
    BlockDevice(PathBuf),
    LocalPath(PathBuf),
}

/// `gitAuth` (spec.md §6): optional authentication, one of PAT / SSH key /
/// username+password / env-secret. Modelled as a single struct with
/// all-optional fields (matching the literal `{ ssh, sshKeyFile, username,
/// password, pat, envSecret }` shape spec.md §6 shows), rather than an
/// enum, since the spec's own example shows them coexisting in one object
/// rather than being mutually exclusive variants.
#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub ssh: bool,
    pub ssh_key_file: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pat: Option<String>,
    pub env_secret: Option<String>,
}

impl AuthConfig {
    /// Resolves a literal token from either `pat` or, if set, by reading
    /// `envSecret`'s named environment variable (spec.md §3's "env-secret").
    fn token(&self) -> Option<String> {
        if let Some(pat) = &self.pat {
            return Some(pat.clone());
        }
        if let Some(name) = &self.env_secret {
            return std::env::var(name).ok();
        }
        None
    }

    /// Rewrites an `https://` clone URL to embed credentials as userinfo,
    /// the only auth channel a shelled-out `git clone`/`git fetch` accepts
    /// without an askpass helper.
    pub fn rewrite_url(&self, url: &str) -> String {
        if let Some(rest) = url.strip_prefix("https://") {
            if let Some(token) = self.token() {
                return format!("https://{token}@{rest}");
            }
            if let (Some(user), Some(pass)) = (&self.username, &self.password) {
                return format!("https://{user}:{pass}@{rest}");
            }
        }
        url.to_owned()
    }

    /// For SSH auth, points git at a private key via `GIT_SSH_COMMAND`
    /// rather than a credential callback, since every git invocation in
    /// this crate is a subprocess (git.rs).
    pub fn apply_to_command(&self, cmd: &mut tokio::process::Command) {
        if self.ssh {
            if let Some(key) = &self.ssh_key_file {
                cmd.env(
                    "GIT_SSH_COMMAND",
                    format!("ssh -i {key} -o StrictHostKeyChecking=accept-new"),
                );
            }
        }
    }
}

/// `verifyCommitsInfo` (spec.md §3): commit-signature verification toggle
/// plus the transparency-log URL to verify against.
#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCommitsInfo {
    #[serde(default)]
    pub gitsign_verify: bool,
    #[serde(rename = "gitsignRekorURL")]
    pub gitsign_rekor_url: Option<String>,
}

/// Fields shared by every method entry (spec.md §4.6: "every method entry
/// carries at minimum name, schedule, optional skew, targetPath, optional
/// glob").
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MethodCommon {
    pub name: String,
    pub schedule: String,
    pub skew: Option<u64>,
    #[serde(default)]
    pub target_path: String,
    pub glob: Option<String>,
    /// Optional suffix tag list consumed by ChangeFilter (spec.md §4.2),
    /// e.g. environment suffixes like `-prod`/`-staging`.
    pub tags: Option<Vec<String>>,
}

impl MethodCommon {
    /// Validates the one invariant spec.md §3 assigns to MethodInstance
    /// that a plain struct can't express by construction: `schedule` must
    /// be a valid cron expression.
    pub fn validate(&self) -> anyhow::Result<()> {
        use std::str::FromStr;
        cron::Schedule::from_str(&self.schedule)
            .with_context(|| format!("method {:?} has invalid cron schedule {:?}", self.name, self.schedule))?;
        Ok(())
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
    #[serde(default)]
    pub pull_image: bool,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct KubeMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SystemdMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub restart: bool,
    /// Special mode (spec.md §4.8): ignores from/to and enables
    /// `podman-auto-update.{timer,service}` unconditionally every tick.
    #[serde(default)]
    pub auto_update_all: bool,
    #[serde(default)]
    pub root: bool,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QuadletMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub root: bool,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
    pub destination_directory: String,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleMethodConfig {
    #[serde(flatten)]
    pub common: MethodCommon,
    pub ssh_directory: Option<String>,
    pub inventory: Option<String>,
}

/// `targetConfigs[]` (spec.md §3 "Target" + §6). Source kind is inferred
/// from which of `url`/`device`/`localPath` is populated (see
/// `source_kind`); exactly one must be present.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub name: String,
    pub url: Option<String>,
    pub device: Option<String>,
    pub local_path: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub disconnected: bool,
    pub verify_commits_info: Option<VerifyCommitsInfo>,
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub raw: Vec<RawMethodConfig>,
    #[serde(default)]
    pub kube: Vec<KubeMethodConfig>,
    #[serde(default)]
    pub systemd: Vec<SystemdMethodConfig>,
    #[serde(default)]
    pub quadlet: Vec<QuadletMethodConfig>,
    #[serde(default)]
    pub filetransfer: Vec<FileTransferMethodConfig>,
    #[serde(default)]
    pub ansible: Vec<AnsibleMethodConfig>,
}

impl TargetConfig {
    pub fn source_kind(&self) -> anyhow::Result<SourceKind> {
        match (&self.url, &self.device, &self.local_path) {
            (Some(url), None, None) => {
                if url.ends_with(".zip") {
                    Ok(SourceKind::ZipUrl(url.clone()))
                } else {
                    Ok(SourceKind::GitUrl(url.clone()))
                }
            }
            (None, Some(dev), None) => Ok(SourceKind::BlockDevice(PathBuf::from(dev))),
            (None, None, Some(path)) => Ok(SourceKind::LocalPath(PathBuf::from(path))),
            _ => bail!(
                "target {:?} must set exactly one of url, device, localPath",
                self.name
            ),
        }
    }

    /// All `(kind, name, schedule string)` triples this target registers,
    /// used for the global-uniqueness check in `RootConfig::validate`.
    fn method_identities(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        out.extend(self.raw.iter().map(|m| ("raw", m.common.name.as_str())));
        out.extend(self.kube.iter().map(|m| ("kube", m.common.name.as_str())));
        out.extend(self.systemd.iter().map(|m| ("systemd", m.common.name.as_str())));
        out.extend(self.quadlet.iter().map(|m| ("quadlet", m.common.name.as_str())));
        out.extend(
            self.filetransfer
                .iter()
                .map(|m| ("filetransfer", m.common.name.as_str())),
        );
        out.extend(self.ansible.iter().map(|m| ("ansible", m.common.name.as_str())));
        out
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReloadConfig {
    pub schedule: String,
    pub skew: Option<u64>,
    #[serde(rename = "configURL")]
    pub config_url: Option<String>,
    pub device: Option<String>,
    pub config_path: Option<String>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PruneConfig {
    pub schedule: String,
    pub skew: Option<u64>,
    #[serde(default)]
    pub volumes: bool,
    #[serde(default)]
    pub all: bool,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PodmanAutoUpdateConfig {
    pub schedule: String,
    pub skew: Option<u64>,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub schedule: String,
    pub skew: Option<u64>,
    pub url: Option<String>,
    pub image_path: Option<String>,
    pub device: Option<String>,
}

/// Top-level document (spec.md §6). The source of truth for a running
/// Supervisor's TargetRegistry (spec.md §3).
#[derive(Deserialize, JsonSchema, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RootConfig {
    #[serde(default)]
    pub target_configs: Vec<TargetConfig>,
    pub config_reload: Option<ConfigReloadConfig>,
    pub prune: Option<PruneConfig>,
    pub podman_auto_update: Option<PodmanAutoUpdateConfig>,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    pub git_auth: Option<AuthConfig>,
}

impl RootConfig {
    /// Parses and validates in one step; this is the only path by which a
    /// `RootConfig` should be produced (spec.md §7 ConfigError: "invalid
    /// YAML, missing required field, unknown method kind").
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let cfg: RootConfig = serde_yaml::from_slice(bytes).context("parsing config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Spec.md §3 invariants this constructor-time validation enforces:
    /// `(target.name, method.kind, method.name)` is globally unique, and
    /// every `schedule` is a valid cron expression.
    fn validate(&self) -> anyhow::Result<()> {
        let mut seen_targets = std::collections::HashSet::new();
        let mut seen_methods = std::collections::HashSet::new();
        for target in &self.target_configs {
            target.source_kind()?;
            if !seen_targets.insert(target.name.clone()) {
                bail!("duplicate target name {:?}", target.name);
            }
            for (kind, name) in target.method_identities() {
                if !seen_methods.insert((target.name.clone(), kind, name.to_owned())) {
                    bail!(
                        "duplicate method ({}, {}, {}) on target {:?}",
                        target.name,
                        kind,
                        name,
                        target.name
                    );
                }
            }
            for m in &target.raw {
                m.common.validate()?;
            }
            for m in &target.kube {
                m.common.validate()?;
            }
            for m in &target.systemd {
                m.common.validate()?;
            }
            for m in &target.quadlet {
                m.common.validate()?;
            }
            for m in &target.filetransfer {
                m.common.validate()?;
            }
            for m in &target.ansible {
                m.common.validate()?;
            }
        }
        if let Some(reload) = &self.config_reload {
            use std::str::FromStr;
            cron::Schedule::from_str(&reload.schedule).context("invalid configReload schedule")?;
        }
        if let Some(prune) = &self.prune {
            use std::str::FromStr;
            cron::Schedule::from_str(&prune.schedule).context("invalid prune schedule")?;
        }
        for image in &self.images {
            use std::str::FromStr;
            cron::Schedule::from_str(&image.schedule).context("invalid images[] schedule")?;
        }
        Ok(())
    }
}

/// External collaborator boundary (SPEC_FULL.md §6.1): fetches the raw
/// bytes of a candidate config from wherever it lives, independent of how
/// `ConfigLoader` decides whether those bytes are new.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Vec<u8>>;
}

/// Priority source 2 (spec.md §4.6): a remote URL, via plain HTTP GET.
/// "Opaque-path redirect preservation" means we let reqwest follow
/// redirects with its default policy rather than normalising the path,
/// since some config hosts redirect to signed, opaque URLs.
pub struct HttpConfigSource {
    pub url: String,
    pub client: reqwest::Client,
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .context(format!("fetching config from {}", self.url))?
            .error_for_status()
            .context(format!("config URL {} returned an error status", self.url))?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Priority source 3 (spec.md §4.6): a path on a mounted block device, for
/// disconnected operation.
pub struct DeviceConfigSource {
    pub path: PathBuf,
}

#[async_trait]
impl ConfigSource for DeviceConfigSource {
    async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .context(format!("reading device config at {:?}", self.path))
    }
}

/// ConfigLoader (spec.md §4.6): owns the default config path and its
/// sibling backup path, and implements `CheckForConfigUpdates`.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub default_path: PathBuf,
    pub backup_path: PathBuf,
}

/// Canonical config path (spec.md §6).
pub const DEFAULT_CONFIG_PATH: &str = "/opt/mount/config.yaml";
pub const DEFAULT_BACKUP_PATH: &str = "/opt/mount/config-backup.yaml";

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            default_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            backup_path: PathBuf::from(DEFAULT_BACKUP_PATH),
        }
    }
}

impl ConfigLoader {
    pub fn new(default_path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            default_path: default_path.into(),
            backup_path: backup_path.into(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<RootConfig> {
        let bytes = tokio::fs::read(&self.default_path)
            .await
            .context(format!("reading config at {:?}", self.default_path))?;
        RootConfig::parse(&bytes)
    }

    /// `CheckForConfigUpdates(url, existsAlready, initial) → restart?`
    /// (spec.md §4.6), parameterised over `candidate` (the already-fetched
    /// bytes) rather than re-fetching inside this function, so callers
    /// control the `ConfigSource` used.
    pub async fn check_for_config_updates(
        &self,
        candidate: &[u8],
        exists_already: bool,
        initial: bool,
    ) -> anyhow::Result<bool> {
        if initial && !exists_already {
            if let Some(parent) = self.default_path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::write(&self.default_path, candidate)
                .await
                .context("writing initial config")?;
            return Ok(false);
        }
        let current = tokio::fs::read(&self.default_path).await.unwrap_or_default();
        if current == candidate {
            return Ok(false);
        }
        if exists_already {
            tokio::fs::copy(&self.default_path, &self.backup_path)
                .await
                .context("backing up previous config")?;
        }
        tokio::fs::write(&self.default_path, candidate)
            .await
            .context("writing updated config")?;
        Ok(true)
    }
}

/// Resolves the canonical fetchit rootless-vs-rootful path conventions
/// named in spec.md §6 ("Environment variables"): `XDG_RUNTIME_DIR` for
/// the Podman socket, `XDG_CONFIG_HOME`/`HOME` for Quadlet/systemd unit
/// directories.
pub fn podman_socket_path() -> PathBuf {
    if nix::unistd::Uid::effective().is_root() {
        PathBuf::from("/run/podman/podman.sock")
    } else if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        Path::new(&dir).join("podman/podman.sock")
    } else {
        PathBuf::from("/run/user/1000/podman/podman.sock")
    }
}

pub fn systemd_unit_dir(root: bool) -> PathBuf {
    if root {
        PathBuf::from("/etc/systemd/system")
    } else if let Ok(home) = std::env::var("XDG_CONFIG_HOME") {
        Path::new(&home).join("systemd/user")
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".config/systemd/user")
    } else {
        PathBuf::from(".config/systemd/user")
    }
}

pub fn quadlet_input_dir(root: bool) -> PathBuf {
    if root {
        PathBuf::from("/etc/containers/systemd")
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".config/containers/systemd")
    } else {
        PathBuf::from(".config/containers/systemd")
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use schemars::schema_for;
    use tempfile::TempDir;

    use super::*;

    // Proves the derive compiles and produces at least the top-level
    // properties spec.md §6 names, without pinning to a byte-exact
    // checked-in schema file (cf. the teacher's `limmat.schema.json`
    // approach, which needs a generated artifact this crate doesn't ship).
    #[googletest::test]
    fn test_json_schema_has_top_level_fields() {
        let schema = schema_for!(RootConfig);
        let json = serde_json::to_value(&schema).unwrap();
        let props = &json["properties"];
        for field in ["targetConfigs", "configReload", "prune", "images", "gitAuth"] {
            assert_that!(props.get(field), some(anything()), "missing schema property {field:?}");
        }
    }

    #[googletest::test]
    fn test_parse_minimal_raw_target() {
        let yaml = r#"
targetConfigs:
  - name: t1
    url: https://example.com/org/repo.git
    branch: main
    raw:
      - name: web
        schedule: "@every 1m"
        targetPath: containers
        glob: "**"
        tags: [".json"]
"#;
        let cfg = RootConfig::parse(yaml.as_bytes()).unwrap();
        assert_that!(cfg.target_configs.len(), eq(1));
        let t = &cfg.target_configs[0];
        assert_that!(t.raw.len(), eq(1));
        assert_that!(
            t.source_kind().unwrap(),
            eq(&SourceKind::GitUrl("https://example.com/org/repo.git".to_owned()))
        );
    }

    #[googletest::test]
    fn test_duplicate_method_name_rejected() {
        let yaml = r#"
targetConfigs:
  - name: t1
    url: https://example.com/org/repo.git
    raw:
      - name: web
        schedule: "0 * * * * *"
      - name: web
        schedule: "0 * * * * *"
"#;
        assert_that!(RootConfig::parse(yaml.as_bytes()), err(anything()));
    }

    #[googletest::test]
    fn test_invalid_schedule_rejected() {
        let yaml = r#"
targetConfigs:
  - name: t1
    url: https://example.com/org/repo.git
    raw:
      - name: web
        schedule: "not a cron expr"
"#;
        assert_that!(RootConfig::parse(yaml.as_bytes()), err(anything()));
    }

    #[googletest::test]
    fn test_missing_source_rejected() {
        let yaml = r#"
targetConfigs:
  - name: t1
"#;
        assert_that!(RootConfig::parse(yaml.as_bytes()), err(anything()));
    }

    #[googletest::test]
    fn test_zip_url_inferred() {
        let yaml = r#"
targetConfigs:
  - name: t1
    url: https://example.com/archive.zip
"#;
        let cfg = RootConfig::parse(yaml.as_bytes()).unwrap();
        assert_that!(
            cfg.target_configs[0].source_kind().unwrap(),
            eq(&SourceKind::ZipUrl("https://example.com/archive.zip".to_owned()))
        );
    }

    #[googletest::test]
    fn test_auth_rewrite_url_with_pat() {
        let auth = AuthConfig {
            pat: Some("sekret".to_owned()),
            ..Default::default()
        };
        assert_that!(
            auth.rewrite_url("https://example.com/org/repo.git"),
            eq("https://sekret@example.com/org/repo.git")
        );
    }

    #[googletest::test]
    async fn test_check_for_config_updates_initial_write() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(dir.path().join("config.yaml"), dir.path().join("config-backup.yaml"));
        let restart = loader
            .check_for_config_updates(b"targetConfigs: []", false, true)
            .await
            .unwrap();
        assert_that!(restart, eq(false));
        assert_that!(
            tokio::fs::read(&loader.default_path).await.unwrap(),
            eq(b"targetConfigs: []".to_vec())
        );
    }

    #[googletest::test]
    async fn test_check_for_config_updates_detects_change() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(dir.path().join("config.yaml"), dir.path().join("config-backup.yaml"));
        tokio::fs::write(&loader.default_path, b"old").await.unwrap();

        let restart_same = loader.check_for_config_updates(b"old", true, false).await.unwrap();
        assert_that!(restart_same, eq(false));

        let restart_diff = loader.check_for_config_updates(b"new", true, false).await.unwrap();
        assert_that!(restart_diff, eq(true));
        assert_that!(tokio::fs::read(&loader.backup_path).await.unwrap(), eq(b"old".to_vec()));
        assert_that!(tokio::fs::read(&loader.default_path).await.unwrap(), eq(b"new".to_vec()));
    }
}
