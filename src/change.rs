// Turns a raw, unfiltered git tree diff (git::RawChange) into the
// {Change -> action} map each Executor actually iterates over. Reused
// verbatim for every method kind; only the glob/tag/targetPath inputs vary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{Glob, GlobMatcher};

use crate::git::RawChange;

/// How a single path differs between the current and desired tree,
/// matching the create/update/rename/delete classification referenced by
/// spec.md §8 property 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Rename,
    Delete,
}

/// One filtered diff entry together with its classification. `from_name`/
/// `to_name` are the raw, clone-relative paths (not yet joined to
/// `targetPath`); `action` below carries the fully resolved path the
/// executor should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub from_name: Option<String>,
    pub to_name: Option<String>,
}

/// What an executor should do about a `Change` (spec.md §4.2): either
/// apply the file at this path, or remove whatever it previously applied.
/// Both variants carry the resolved, base-dir-joined path: `Delete` needs
/// it just as much as `Apply` since the file is already gone from the
/// working tree by the time `ApplyOne` runs, so it's the only way an
/// executor recovers where the deleted entry used to live (e.g. reading it
/// back out of the `from` commit to find a container's declared name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    Apply(PathBuf),
    Delete(PathBuf),
}

/// Freshly computed per tick, never persisted (spec.md §3 "ChangeSet").
pub type ChangeSet = Vec<(Change, ChangeAction)>;

/// Filters a raw tree diff down to the entries a given MethodInstance
/// cares about: matching its glob, matching its (optional) suffix tags,
/// rooted under its `targetPath` (spec.md §4.2).
#[derive(Debug)]
pub struct ChangeFilter {
    base_dir: PathBuf,
    target_path: PathBuf,
    glob: GlobMatcher,
    tags: Option<Vec<String>>,
}

impl ChangeFilter {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        glob_pattern: Option<&str>,
        tags: Option<Vec<String>>,
    ) -> anyhow::Result<Self> {
        // "Empty glob compiles to `**`" (spec.md §4.2).
        let pattern = glob_pattern.filter(|p| !p.is_empty()).unwrap_or("**");
        let glob = Glob::new(pattern)
            .context(format!("compiling glob {pattern:?}"))?
            .compile_matcher();
        Ok(Self {
            base_dir: base_dir.into(),
            target_path: target_path.into(),
            glob,
            tags,
        })
    }

    /// Strips `target_path`'s prefix off a clone-relative diff name,
    /// returning `None` if `name` doesn't live under `target_path` at all
    /// (such entries are outside this method's scope regardless of glob/tag
    /// — spec.md §4.2 "rooted under its targetPath").
    fn strip_target_path<'a>(&self, name: &'a str) -> Option<&'a str> {
        if self.target_path.as_os_str().is_empty() {
            return Some(name);
        }
        let prefix = self.target_path.to_string_lossy();
        if name == prefix {
            Some("")
        } else {
            name.strip_prefix(prefix.as_ref()).and_then(|rest| rest.strip_prefix('/'))
        }
    }

    fn tag_ok(&self, relative_name: &str) -> bool {
        let Some(tags) = &self.tags else {
            return true;
        };
        // Matched against the full file name, not the stem: tags are
        // commonly extensions like ".json" (spec.md §4.2/§8 S1), which
        // file_stem() would strip before the comparison ever runs.
        let file_name = Path::new(relative_name)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(relative_name);
        tags.iter().any(|tag| file_name.ends_with(tag.as_str()))
    }

    fn glob_ok(&self, relative_name: &str) -> bool {
        self.glob.is_match(relative_name)
    }

    fn resolved_path(&self, relative_name: &str) -> PathBuf {
        self.base_dir.join(&self.target_path).join(relative_name)
    }

    /// Apply this filter to a raw diff, producing the ChangeSet an
    /// Executor iterates over. Order is not significant (spec.md §4
    /// "Ordering guarantees" leaves ChangeSet iteration unordered); we
    /// preserve the input order for determinism in tests.
    pub fn filter(&self, raw_changes: &[RawChange]) -> ChangeSet {
        let mut out = ChangeSet::new();
        for raw in raw_changes {
            let from = (!raw.from_name.is_empty()).then(|| raw.from_name.clone());
            let to = (!raw.to_name.is_empty()).then(|| raw.to_name.clone());

            // Tie-break: new-name wins over old-name when both are
            // present, so an update looks like a create, never a
            // delete-then-create (spec.md §4.2/§9).
            if let Some(to_name) = &to {
                if let Some(to_rel) = self.strip_target_path(to_name) {
                    if self.tag_ok(to_rel) && self.glob_ok(to_rel) {
                        let kind = match &from {
                            None => ChangeKind::Create,
                            Some(from_name) if from_name == to_name => ChangeKind::Update,
                            Some(_) => ChangeKind::Rename,
                        };
                        out.push((
                            Change {
                                kind,
                                from_name: from.clone(),
                                to_name: to.clone(),
                            },
                            ChangeAction::Apply(self.resolved_path(to_rel)),
                        ));
                        continue;
                    }
                }
            }
            if let Some(from_name) = &from {
                if let Some(from_rel) = self.strip_target_path(from_name) {
                    if self.tag_ok(from_rel) && self.glob_ok(from_rel) {
                        out.push((
                            Change {
                                kind: ChangeKind::Delete,
                                from_name: from.clone(),
                                to_name: None,
                            },
                            ChangeAction::Delete(self.resolved_path(from_rel)),
                        ));
                    }
                }
            }
            // Neither side passes: drop (spec.md §4.2 step 3).
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(from: &str, to: &str) -> RawChange {
        RawChange {
            from_name: from.to_owned(),
            to_name: to.to_owned(),
        }
    }

    #[test]
    fn test_create_update_rename_delete() {
        let filter = ChangeFilter::new("/clone", "containers", None, None).unwrap();
        let changes = filter.filter(&[
            raw("", "containers/new.yaml"),
            raw("containers/web.yaml", "containers/web.yaml"),
            raw("containers/old.yaml", "containers/renamed.yaml"),
            raw("containers/gone.yaml", ""),
        ]);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].0.kind, ChangeKind::Create);
        assert_eq!(
            changes[0].1,
            ChangeAction::Apply(PathBuf::from("/clone/containers/new.yaml"))
        );
        assert_eq!(changes[1].0.kind, ChangeKind::Update);
        assert_eq!(changes[2].0.kind, ChangeKind::Rename);
        assert_eq!(changes[3].0.kind, ChangeKind::Delete);
        assert_eq!(
            changes[3].1,
            ChangeAction::Delete(PathBuf::from("/clone/containers/gone.yaml"))
        );
    }

    #[test]
    fn test_empty_glob_defaults_to_double_star() {
        let filter = ChangeFilter::new("/clone", "", None, None).unwrap();
        let changes = filter.filter(&[raw("", "a/b/c.yaml")]);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_glob_excludes_non_matching() {
        let filter = ChangeFilter::new("/clone", "", Some("*.yaml"), None).unwrap();
        let changes = filter.filter(&[raw("", "containers/web.json")]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_tag_filter_requires_suffix_match() {
        let filter = ChangeFilter::new(
            "/clone",
            "",
            None,
            Some(vec!["prod".to_owned(), "staging".to_owned()]),
        )
        .unwrap();
        let changes = filter.filter(&[
            raw("", "app-prod.yaml"),
            raw("", "app-dev.yaml"),
        ]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0.to_name.as_deref(), Some("app-prod.yaml"));
    }

    #[test]
    fn test_extension_tag_matches_full_file_name_not_stem() {
        // spec.md §8 S1: a Raw method tagged ".json" must match
        // "containers/web.json" — file_stem() would strip the extension
        // before the suffix check ever ran.
        let filter = ChangeFilter::new("/clone", "containers", None, Some(vec![".json".to_owned()])).unwrap();
        let changes = filter.filter(&[raw("", "containers/web.json")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].1,
            ChangeAction::Apply(PathBuf::from("/clone/containers/web.json"))
        );
    }

    #[test]
    fn test_rename_tie_break_prefers_new_name() {
        // Both old and new names pass the filter; only one Change should
        // be emitted, classified as a Rename (update-shaped), not a
        // delete-then-create.
        let filter = ChangeFilter::new("/clone", "", None, None).unwrap();
        let changes = filter.filter(&[raw("old.yaml", "new.yaml")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0.kind, ChangeKind::Rename);
    }
}
