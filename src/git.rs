use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::{OsStr, OsString};
use std::ops::Deref;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::{self, Command as SyncCommand};
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context};
use futures::future::BoxFuture;
use futures::FutureExt;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::config::AuthConfig;
use crate::process::OutputExt;
use crate::process::{CommandExt, SyncCommandExt as _};

// --- Hash newtypes, kept from the teacher verbatim (see DESIGN.md). ---

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

// My attempt at newtypery for Git IDs. Why is this so damned verbose?
// The answer is that Deref lets you do some stuff on the inner type via
// expressions of the outer type, but it doesn't actually make the outer type
// implement the traits of the inner type. So we have to manually forward all
// those traits.
impl Hash {
    // Note that this is infallible. That's because having a Hash doesn't
    // guarantee you that the ID refers to an object in an actual repo.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..self.0.len().min(9)]
    }

    pub fn is_zero(&self) -> bool {
        self.0.chars().all(|c| c == '0')
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conventional all-zero hash used as the "nothing applied yet" sentinel
/// (spec.md §3, CommitRef).
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000";
/// Git's well-known empty-tree object ID, the other half of that sentinel
/// when we need a Tree rather than a Commit (spec.md §4.1, SubTree).
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }

    pub fn zero() -> Self {
        Self::new(ZERO_HASH)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn abbrev(&self) -> &str {
        self.0.abbrev()
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct TreeHash(Hash);

impl TreeHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }

    pub fn empty() -> Self {
        Self::new(EMPTY_TREE_HASH)
    }
}

impl Deref for TreeHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl From<TreeHash> for Hash {
    fn from(h: TreeHash) -> Hash {
        h.0
    }
}

impl AsRef<OsStr> for TreeHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Alias matching spec.md §4.1's "Tree" in `SubTree(hash, path) → Tree` --
/// a tree is fully identified by its hash for our purposes.
pub type Tree = TreeHash;

// Worktree represents a git tree, which might be the "main" worktree (in which case it might be
// more clearly refrred to by the name Repo) or some other one.
#[derive(Debug)]
pub struct PersistentWorktree {
    pub path: PathBuf,
    pub git_binary: PathBuf,
}

impl Worktree for PersistentWorktree {
    fn path(&self) -> &Path {
        &self.path
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: CommitHash,
    pub tree: TreeHash,
}

impl Commit {
    #[cfg(test)]
    pub fn arbitrary() -> Self {
        Self {
            hash: CommitHash::new("080b8ecbad3e34e55c5a035af80100f73b742a8d"),
            tree: TreeHash::new("6366d790125291272542a6b40f6fd3400e080821"),
        }
    }
}

impl From<Commit> for CommitHash {
    fn from(val: Commit) -> Self {
        val.hash
    }
}

pub enum LogStyle {
    WithGraph,
    NoGraph,
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command, that holds a semaphore for as long as the process
// exists. Just delegates enough methods to allow you to use it without
// letting you drop the semaphore until the process has terminated (which
// hopefully implies the stdio pipes have been closed...).
// This exists to try and avoid running into file descriptor exhaustion, without
// needing any retry logic that would risk creating livelocks.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    pub async fn output(&mut self) -> std::io::Result<process::Output> {
        self.command.output().await
    }
}

// Trait's can't have private methods, this is one reason why my
// inheritance-brained idea to use this Worktree kinda like a superclass was not
// a very good one.  This trait is a workaround for that, to avoid linter
// warnings from having a public method return a private type.
trait WorktreePriv: Worktree {
    fn git<'a, I, S>(&'a self, args: I) -> BoxFuture<'a, GitCommand>
    where
        I: IntoIterator<Item = S> + Send + 'a,
        S: AsRef<OsStr>,
    {
        (async {
            let mut cmd = Command::new(self.git_binary());
            cmd.current_dir(self.path());
            cmd.args(args);
            cmd.process_group(0);
            GitCommand {
                _permit: COMMAND_SEM.acquire().await.unwrap(),
                command: cmd,
            }
        })
        .boxed()
    }
}

impl<W: Worktree + ?Sized> WorktreePriv for W {}

/// One entry of a raw, unfiltered tree diff (spec.md §4.1 `Diff`). Mirrors
/// `git diff --name-status -M`'s output: either side's name may be empty
/// (see the change-type table in spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub from_name: String,
    pub to_name: String,
}

// This is a weird kinda inheritance type thing to enable different types of worktree (with
// different fields and drop behaviours) to share the functionality that users actually care about.
pub trait Worktree: Debug + Sync {
    fn path(&self) -> &Path;
    fn git_binary(&self) -> &Path;

    async fn lookup_git_dir(&self, rev_parse_arg: &str) -> anyhow::Result<PathBuf> {
        let output = self
            .git(["rev-parse", rev_parse_arg])
            .await
            .execute()
            .await
            .map_err(|e| anyhow!("'git rev-parse {rev_parse_arg}' failed: {e}"))?;
        let mut bytes = output.stdout;
        while bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        Ok(OsStr::from_bytes(&bytes).into())
    }

    async fn git_common_dir(&self) -> anyhow::Result<PathBuf> {
        self.lookup_git_dir("--git-common-dir").await
    }

    async fn git_dir(&self) -> anyhow::Result<PathBuf> {
        self.lookup_git_dir("--absolute-git-dir").await
    }

    async fn rev_list<S>(&self, range_spec: S) -> anyhow::Result<Vec<CommitHash>>
    where
        S: AsRef<OsStr>,
    {
        let output = self
            .git(["rev-list"])
            .await
            .arg(range_spec)
            .execute()
            .await
            .context("'git rev-list' failed")?;
        if output.code_not_killed()? == 128 {
            return Ok(vec![]);
        }
        let code = output.status.code().unwrap();
        if code != 0 {
            bail!(
                "failed with exit code {}. stderr:\n{}\nstdout:\n{}",
                code,
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            );
        }
        let out_str: &str =
            std::str::from_utf8(&output.stdout).context("non utf-8 rev-list output")?;
        Ok(out_str.lines().map(CommitHash::new).collect())
    }

    async fn checkout(&self, commit: &CommitHash) -> anyhow::Result<()> {
        self.git(["checkout"])
            .await
            .arg(commit)
            .output()
            .await?
            .ok()
            .context(format!(
                "checking out revision {:?} in {:?}",
                commit,
                self.path()
            ))
    }

    async fn log<S, T>(
        &self,
        range_spec: S,
        format_spec: T,
        style: LogStyle,
    ) -> anyhow::Result<Vec<u8>>
    where
        S: AsRef<OsStr>,
        T: AsRef<OsStr>,
    {
        let mut format_arg = OsString::from("--format=");
        format_arg.push(format_spec.as_ref());
        let stdout = self
            .git(match style {
                LogStyle::WithGraph => vec!["log", "--graph"],
                LogStyle::NoGraph => vec!["log"],
            })
            .await
            .args([&format_arg, range_spec.as_ref()])
            .execute()
            .await
            .context(format!(
                "getting graph log for {:?} with format {:?}",
                range_spec.as_ref(),
                format_spec.as_ref(),
            ))?
            .stdout;
        Ok(stdout)
    }

    // None means we successfully looked it up but it didn't exist.
    async fn rev_parse<S>(&self, rev_spec: S) -> anyhow::Result<Option<Commit>>
    where
        S: AsRef<OsStr>,
    {
        let mut cmd = self.git(["log", "-n1", "--format=%H %T"]).await;
        let cmd = cmd.arg(rev_spec);
        let output = cmd.output().await.context("failed to run 'git log -n1'")?;
        let exit_code = output.code_not_killed()?;
        if exit_code == 128 {
            return Ok(None);
        }
        if exit_code != 0 {
            bail!("'git log -n1' failed with code {exit_code}");
        }
        let out_string =
            String::from_utf8(output.stdout).context("reading git rev-parse output")?;
        let parts: Vec<&str> = out_string.trim().splitn(2, " ").collect();
        if parts.len() != 2 {
            bail!(
                "Failed to parse result of {cmd:?} - {out_string:?}\nstderr: {:?}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(Some(Commit {
            hash: CommitHash::new(parts[0]),
            tree: TreeHash::new(parts[1]),
        }))
    }

    /// `git fetch +refs/heads/<branch>:refs/heads/<branch> HEAD:refs/heads/HEAD --force`
    /// (spec.md §4.1 `Latest`). Auth, if any, is injected via environment
    /// variables on the child process rather than a Git library credential
    /// callback, since we shell out to the binary throughout (see
    /// SPEC_FULL.md §4.1.1).
    async fn fetch_branch(
        &self,
        remote: &str,
        branch: &str,
        auth: Option<&AuthConfig>,
    ) -> anyhow::Result<()> {
        let refspec_branch = format!("+refs/heads/{branch}:refs/heads/{branch}");
        let mut cmd = self
            .git([
                "fetch",
                "--force",
                remote,
                &refspec_branch,
                "HEAD:refs/heads/HEAD",
            ])
            .await;
        if let Some(auth) = auth {
            auth.apply_to_command(&mut cmd.command);
        }
        // A "nothing to fetch" outcome surfaces as a clean 0 exit with no
        // new refs; that is not an error (spec.md §4.1).
        cmd.execute()
            .await
            .context(format!("fetching {branch} from {remote}"))?;
        Ok(())
    }

    /// Read a lightweight tag; `None` if absent (spec.md §4.1 `Applied`).
    async fn read_tag(&self, tag_name: &str) -> anyhow::Result<Option<CommitHash>> {
        let output = self
            .git(["rev-parse", "--verify", "--quiet"])
            .await
            .arg(format!("refs/tags/{tag_name}"))
            .output()
            .await
            .context("running git rev-parse for tag")?;
        if output.code_not_killed()? != 0 {
            return Ok(None);
        }
        let s = String::from_utf8(output.stdout)
            .context("non-utf8 tag rev-parse output")?
            .trim()
            .to_owned();
        if s.is_empty() {
            return Ok(None);
        }
        Ok(Some(CommitHash::new(s)))
    }

    /// Delete the old tag if present, create a new lightweight tag pointing
    /// at `hash` (spec.md §4.1 `SetApplied`). Callers serialise this with
    /// the Target mutex, so no locking happens here.
    async fn set_tag(&self, tag_name: &str, hash: &CommitHash) -> anyhow::Result<()> {
        // -f both deletes-and-recreates atomically from Git's perspective.
        self.git(["tag", "-f"])
            .await
            .arg(tag_name)
            .arg(hash)
            .execute()
            .await
            .context(format!("setting tag {tag_name} to {hash}"))?;
        Ok(())
    }

    async fn delete_tag(&self, tag_name: &str) -> anyhow::Result<()> {
        let output = self
            .git(["tag", "-d"])
            .await
            .arg(tag_name)
            .output()
            .await
            .context("running git tag -d")?;
        // Deleting an absent tag is not an error for our purposes.
        if output.code_not_killed()? != 0
            && !String::from_utf8_lossy(&output.stderr).contains("not found")
        {
            bail!(
                "deleting tag {tag_name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Resolve `commit`'s tree, descend to `path`. The zero hash yields an
    /// empty tree, never an error (spec.md §4.1 `SubTree`).
    async fn sub_tree(&self, commit: &CommitHash, path: &Path) -> anyhow::Result<Tree> {
        if commit.is_zero() {
            return Ok(Tree::empty());
        }
        let spec = if path.as_os_str().is_empty() {
            format!("{commit}^{{tree}}")
        } else {
            format!("{commit}:{}", path.display())
        };
        let output = self
            .git(["rev-parse", "--verify", "--quiet"])
            .await
            .arg(&spec)
            .output()
            .await
            .context(format!("resolving subtree {spec:?}"))?;
        if output.code_not_killed()? != 0 {
            // Path doesn't exist at this commit: treat as empty, matching
            // the zero-hash case rather than erroring, since a freshly
            // created targetPath directory is a completely normal state.
            return Ok(Tree::empty());
        }
        let s = String::from_utf8(output.stdout)
            .context("non-utf8 rev-parse output")?
            .trim()
            .to_owned();
        Ok(Tree::new(s))
    }

    /// Ordered-by-path raw diff between two trees (spec.md §4.1 `Diff`).
    async fn diff_trees(&self, from: &Tree, to: &Tree) -> anyhow::Result<Vec<RawChange>> {
        if from == to {
            return Ok(vec![]);
        }
        let output = self
            .git([
                "diff",
                "--no-color",
                "-z",
                "--name-status",
                "--find-renames",
            ])
            .await
            .arg(from)
            .arg(to)
            .execute()
            .await
            .context("running git diff between trees")?;
        parse_name_status_z(&output.stdout)
    }

    /// True if `ancestor` is an ancestor of (or equal to) `descendant`.
    /// Used for the StateError check (spec.md §7): an applied tag that no
    /// longer resolves to a commit reachable from the configured branch
    /// signals a force-push, and the caller should reset `initialRun`.
    async fn is_ancestor(&self, ancestor: &CommitHash, descendant: &str) -> anyhow::Result<bool> {
        let output = self
            .git(["merge-base", "--is-ancestor"])
            .await
            .arg(ancestor)
            .arg(descendant)
            .output()
            .await
            .context("running git merge-base --is-ancestor")?;
        match output.code_not_killed()? {
            0 => Ok(true),
            1 => Ok(false),
            // git exits 128 when `ancestor` doesn't resolve to an object at
            // all (e.g. the tag pointed at a commit a force-push rewound
            // past and gc later pruned). A commit that no longer exists is
            // unambiguously not reachable, not a fatal error (spec.md §7
            // StateError).
            128 => Ok(false),
            code => bail!(
                "git merge-base --is-ancestor exited with unexpected code {code}: {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        }
    }

    /// Raw `git cat-file commit <commit>` bytes, headers and all. Used by
    /// signature verification (spec.md §4.1 `Latest`: "verify the commit's
    /// embedded signature") to recover the `gpgsig` trailer gitsign writes.
    async fn read_raw_commit(&self, commit: &CommitHash) -> anyhow::Result<Vec<u8>> {
        let output = self
            .git(["cat-file", "commit"])
            .await
            .arg(commit)
            .execute()
            .await
            .context(format!("reading raw commit {commit}"))?;
        Ok(output.stdout)
    }
}

/// Parses the `-z --name-status` output format used by `diff_trees`, which
/// is `STATUS NUL NAME NUL [NAME2 NUL]` repeated, NUL-separated rather than
/// newline-separated so filenames containing newlines can't corrupt
/// parsing.
fn parse_name_status_z(bytes: &[u8]) -> anyhow::Result<Vec<RawChange>> {
    let fields: Vec<&[u8]> = bytes
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .collect();
    let mut changes = Vec::new();
    let mut i = 0;
    while i < fields.len() {
        let status =
            std::str::from_utf8(fields[i]).context("non-utf8 status field in diff output")?;
        i += 1;
        let name = std::str::from_utf8(
            fields
                .get(i)
                .context("truncated diff --name-status output")?,
        )
        .context("non-utf8 filename in diff output")?
        .to_owned();
        i += 1;
        if let Some(c) = status.chars().next() {
            match c {
                'A' => changes.push(RawChange {
                    from_name: String::new(),
                    to_name: name,
                }),
                'D' => changes.push(RawChange {
                    from_name: name,
                    to_name: String::new(),
                }),
                'M' | 'T' => changes.push(RawChange {
                    from_name: name.clone(),
                    to_name: name,
                }),
                'R' | 'C' => {
                    let new_name = std::str::from_utf8(
                        fields
                            .get(i)
                            .context("truncated rename entry in diff output")?,
                    )
                    .context("non-utf8 filename in diff output")?
                    .to_owned();
                    i += 1;
                    changes.push(RawChange {
                        from_name: name,
                        to_name: new_name,
                    });
                }
                other => bail!("unrecognised diff --name-status code {other:?}"),
            }
        }
    }
    changes.sort_by(|a, b| {
        let a_key = if a.to_name.is_empty() {
            &a.from_name
        } else {
            &a.to_name
        };
        let b_key = if b.to_name.is_empty() {
            &b.from_name
        } else {
            &b.to_name
        };
        a_key.cmp(b_key)
    });
    Ok(changes)
}

/// Error produced by `ensure` when a pre-existing directory lacks git
/// metadata (spec.md §4.1 `Ensure`).
#[derive(Debug, thiserror::Error)]
#[error("{0:?} exists but is not a git repository")]
pub struct NotARepository(pub PathBuf);

impl PersistentWorktree {
    /// Idempotent: clone `url`'s `branch` into `path` if it doesn't exist;
    /// if it exists but has no `.git`, fail with `NotARepository`
    /// (spec.md §4.1 `Ensure`).
    pub async fn ensure(
        path: PathBuf,
        git_binary: PathBuf,
        url: &str,
        branch: &str,
        auth: Option<&AuthConfig>,
    ) -> anyhow::Result<Self> {
        if path.exists() {
            if !path.join(".git").exists() {
                bail!(NotARepository(path));
            }
            return Ok(Self { path, git_binary });
        }
        let parent = path
            .parent()
            .context("clone destination has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("creating clone parent directory")?;
        let clone_url = auth.map(|a| a.rewrite_url(url)).unwrap_or_else(|| url.to_owned());
        let mut cmd = Command::new(&git_binary);
        cmd.args(["clone", "--branch", branch, "--origin", "origin", &clone_url]);
        cmd.arg(&path);
        cmd.process_group(0);
        if let Some(auth) = auth {
            auth.apply_to_command(&mut cmd);
        }
        cmd.execute()
            .await
            .context(format!("cloning {url} (branch {branch}) into {path:?}"))?;
        Ok(Self { path, git_binary })
    }

    #[cfg(test)]
    pub async fn init(path: PathBuf, git_binary: PathBuf) -> anyhow::Result<Self> {
        Command::new(&git_binary)
            .arg("init")
            .current_dir(&path)
            .execute()
            .await?;
        Ok(Self { path, git_binary })
    }
}

// A worktree that is deleted when dropped. Used for the disconnected-mode
// materialisation step (zip extraction, USB mount+rsync) described in
// spec.md §4.4 step 3a / §9 re-architecture notes.
#[derive(Debug)]
pub struct TempWorktree {
    origin: PathBuf,
    temp_dir: TempDir,
    cleaned_up: bool,
    git_binary: PathBuf,
}

impl TempWorktree {
    pub async fn new<W>(
        ct: &CancellationToken,
        origin: &W,
        temp_dir: TempDir,
    ) -> anyhow::Result<TempWorktree>
    where
        W: Worktree,
    {
        let zelf = Self {
            origin: origin.path().to_owned(),
            temp_dir,
            cleaned_up: false,
            git_binary: origin.git_binary().to_owned(),
        };
        let mut attempts = 1;
        loop {
            let mut cmd = origin.git(["worktree", "add"]).await;
            let cmd = cmd.arg(zelf.temp_dir.path()).arg("HEAD");
            futures::select! {
                _ = ct.cancelled().fuse() => {
                    zelf.cleanup().await;
                    bail!("canceled")
                },
                res = cmd.execute().fuse() => {
                    match res {
                        Ok(_) => return Ok(zelf),
                        Err(e) => {
                            if attempts >= 5 {
                                bail!("git worktree add failed: {}", e);
                            }
                            attempts += 1;
                        },
                    }
                },
            }
        }
    }

    fn cleanup_cmd(&self) -> Option<SyncCommand> {
        if !self.origin.exists() {
            debug!(
                "Not de-registering worktree at {:?} as origin repo ({:?}) is gone.",
                self.temp_dir.path(),
                self.origin
            );
            return None;
        }
        let mut cmd = SyncCommand::new(self.git_binary());
        cmd.args(["worktree", "remove", "--force", "--force"])
            .arg(self.temp_dir.path())
            .current_dir(&self.origin);
        Some(cmd)
    }

    pub async fn cleanup(mut self) {
        if let Some(cmd) = self.cleanup_cmd() {
            match Command::from(cmd).execute().await {
                Err(e) => debug!("Couldn't clean up worktree {:?}: {:?}", &self.temp_dir, e),
                Ok(_) => debug!("Cleaned up worktree at {:?}", self.temp_dir.path()),
            }
        }
        self.cleaned_up = true;
    }
}

impl Worktree for TempWorktree {
    fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

impl Drop for TempWorktree {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        warn!(
            "TempWorktree was not cleaned up before drop. \
                This is functionally harmless but probably slows things down."
        );
        if let Some(mut cmd) = self.cleanup_cmd() {
            match cmd.execute() {
                Err(e) => debug!("Couldn't clean up worktree {:?}: {:?}", &self.temp_dir, e),
                Ok(_) => debug!("Cleaned up worktree at {:?}", self.temp_dir.path()),
            }
        }
    }
}

/// Derive the name fetchit stores a clone's working directory under: the
/// URL's basename, with a trailing `.git` stripped (spec.md §4.1 `Ensure`,
/// §6 "Persisted state").
pub fn working_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
    base.strip_suffix(".git").unwrap_or(base).to_owned()
}

#[cfg(test)]
pub mod test_utils {
    use super::*;

    #[derive(Debug)]
    pub struct TempRepo {
        temp_dir: TempDir,
        git_binary: PathBuf,
    }

    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            let zelf = Self {
                temp_dir: TempDir::with_prefix("fixture-").expect("couldn't make tempdir"),
                git_binary: PathBuf::from("/usr/bin/git"),
            };
            zelf.git(["init"]).await.execute().await?;
            zelf.git(["config", "user.email", "test@example.com"])
                .await
                .execute()
                .await?;
            zelf.git(["config", "user.name", "test"])
                .await
                .execute()
                .await?;
            Ok(zelf)
        }
    }

    impl Worktree for TempRepo {
        fn path(&self) -> &Path {
            self.temp_dir.path()
        }

        fn git_binary(&self) -> &Path {
            &self.git_binary
        }
    }

    pub trait WorktreeExt: Worktree {
        async fn commit<S>(&self, message: S) -> anyhow::Result<Commit>
        where
            S: AsRef<OsStr>,
        {
            self.git(["commit", "-m"])
                .await
                .arg(message)
                .arg("--allow-empty")
                .execute()
                .await
                .context("'git commit' failed")?;
            self.rev_parse("HEAD")
                .await?
                .ok_or(anyhow!("no HEAD after committing"))
        }

        async fn write_file(&self, relpath: &str, content: &str) -> anyhow::Result<()> {
            let full = self.path().join(relpath);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(full, content).await?;
            self.git(["add", relpath]).await.execute().await?;
            Ok(())
        }

        async fn current_branch(&self) -> anyhow::Result<String> {
            let output = self
                .git(["branch", "--show-current"])
                .await
                .execute()
                .await
                .context("getting current branch")?;
            Ok(String::from_utf8(output.stdout)?.trim().to_owned())
        }

        async fn checkout_branch(&self, branch: &str) -> anyhow::Result<()> {
            self.git(["checkout", branch]).await.execute().await?;
            Ok(())
        }

        /// Switches to a new unborn branch, keeping the current index so
        /// the next commit becomes a parentless root unrelated to whatever
        /// branch was checked out before. Used to simulate a force-push
        /// that rewrites history out from under an applied tag.
        async fn checkout_orphan(&self, branch: &str) -> anyhow::Result<()> {
            self.git(["checkout", "--orphan", branch]).await.execute().await?;
            Ok(())
        }

        /// Force-moves `branch` to `commit`, same as a force-push landing
        /// a rewritten history on the remote.
        async fn force_branch(&self, branch: &str, commit: &CommitHash) -> anyhow::Result<()> {
            self.git(["branch", "-f", branch]).await.arg(commit).execute().await?;
            Ok(())
        }
    }

    impl<W: Worktree> WorktreeExt for W {}
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use tempfile::TempDir;

    use super::test_utils::{TempRepo, WorktreeExt};
    use super::*;

    #[tokio::test]
    async fn test_new_gitdir_notgit() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        let wt = PersistentWorktree {
            path: tmp_dir.path().to_path_buf(),
            git_binary: PathBuf::from("/usr/bin/git"),
        };
        assert!(
            wt.git_common_dir().await.is_err(),
            "opening repo with no .git didn't fail"
        );
    }

    #[tokio::test]
    async fn test_new_gitdir_file_notgit() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        {
            let mut bogus_git_file =
                File::create(tmp_dir.path().join(".git")).expect("couldn't create .git");
            write!(bogus_git_file, "no no no").expect("couldn't write .git");
        }
        let wt = PersistentWorktree {
            path: tmp_dir.path().to_path_buf(),
            git_binary: PathBuf::from("/usr/bin/git"),
        };
        assert!(
            wt.git_common_dir().await.is_err(),
            "opening repo with bogus .git file didn't fail"
        );
    }

    #[tokio::test]
    async fn test_tag_roundtrip() {
        let repo = TempRepo::new().await.unwrap();
        let c1 = repo.commit("one").await.unwrap();
        assert_eq!(repo.read_tag("current-raw-foo").await.unwrap(), None);
        repo.set_tag("current-raw-foo", &c1.hash).await.unwrap();
        assert_eq!(
            repo.read_tag("current-raw-foo").await.unwrap(),
            Some(c1.hash.clone())
        );
        let c2 = repo.commit("two").await.unwrap();
        repo.set_tag("current-raw-foo", &c2.hash).await.unwrap();
        assert_eq!(
            repo.read_tag("current-raw-foo").await.unwrap(),
            Some(c2.hash)
        );
    }

    #[tokio::test]
    async fn test_sub_tree_zero_hash_is_empty() {
        let repo = TempRepo::new().await.unwrap();
        let tree = repo
            .sub_tree(&CommitHash::zero(), Path::new("containers"))
            .await
            .unwrap();
        assert_eq!(tree, Tree::empty());
    }

    #[tokio::test]
    async fn test_diff_trees_create_update_delete() {
        let repo = TempRepo::new().await.unwrap();
        repo.write_file("containers/web.json", "v1").await.unwrap();
        repo.write_file("keep.json", "keep").await.unwrap();
        let c1 = repo.commit("one").await.unwrap();

        repo.write_file("containers/web.json", "v2").await.unwrap();
        tokio::fs::remove_file(repo.path().join("keep.json"))
            .await
            .unwrap();
        repo.git(["add", "-A"]).await.execute().await.unwrap();
        repo.write_file("containers/new.json", "new").await.unwrap();
        let c2 = repo.commit("two").await.unwrap();

        let from = repo.sub_tree(&c1.hash, Path::new("")).await.unwrap();
        let to = repo.sub_tree(&c2.hash, Path::new("")).await.unwrap();
        let mut changes = repo.diff_trees(&from, &to).await.unwrap();
        changes.sort_by(|a, b| a.to_name.cmp(&b.to_name).then(a.from_name.cmp(&b.from_name)));

        assert_eq!(
            changes,
            vec![
                RawChange {
                    from_name: "containers/web.json".into(),
                    to_name: "containers/new.json".into(),
                },
                RawChange {
                    from_name: "containers/web.json".into(),
                    to_name: "containers/web.json".into(),
                },
                RawChange {
                    from_name: "keep.json".into(),
                    to_name: "".into(),
                },
            ]
        );
    }

    #[test]
    fn test_working_dir_name() {
        assert_eq!(
            working_dir_name("https://example.com/org/my-repo.git"),
            "my-repo"
        );
        assert_eq!(working_dir_name("https://example.com/org/my-repo"), "my-repo");
        assert_eq!(working_dir_name("/local/path/repo/"), "repo");
    }
}
