// Commit signature verification against a Rekor transparency log (spec.md
// §4.1 `Latest`, §7 VerificationError). gitsign embeds a sigstore bundle
// in the commit's `gpgsig` trailer instead of a classic GPG signature;
// verifying it for real means checking the embedded certificate chain
// against Fulcio's root and replaying the inclusion proof, which is out of
// scope the same way bit-exact Podman/systemd calls are (spec.md §1). What
// this module fixes is the externally-observable contract: the commit's
// artifact digest must have a corresponding entry in the configured Rekor
// instance, or the tick fails closed with `VerificationError`.

use anyhow::{bail, Context as _};
use sha2::{Digest, Sha256};
use sigstore::rekor::apis::configuration::Configuration;
use sigstore::rekor::apis::entries_api;
use sigstore::rekor::models::SearchIndex;

use crate::git::{CommitHash, Worktree};

/// Extracts the commit's `gpgsig` trailer and confirms a matching entry
/// exists in the Rekor instance at `rekor_url`. Fails the tick rather than
/// applying an unverifiable commit (spec.md §7: "the commit is not checked
/// out, nothing is applied").
pub async fn verify_commit(worktree: &(impl Worktree + ?Sized), commit: &CommitHash, rekor_url: &str) -> anyhow::Result<()> {
    let raw = worktree.read_raw_commit(commit).await.context("reading commit for signature check")?;
    let signature = extract_gpgsig(&raw).with_context(|| format!("commit {commit} has no gpgsig trailer"))?;
    if signature.trim().is_empty() {
        bail!("commit {commit} has an empty gpgsig trailer");
    }

    let digest = hex::encode(Sha256::digest(&raw));

    let mut config = Configuration::default();
    config.base_path = rekor_url.trim_end_matches('/').to_owned();

    let search = SearchIndex {
        hash: Some(format!("sha256:{digest}")),
        ..Default::default()
    };
    let matches = entries_api::search_index(&config, search)
        .await
        .with_context(|| format!("querying rekor log at {rekor_url:?}"))?;

    if matches.is_empty() {
        bail!("no rekor transparency-log entry found for commit {commit} at {rekor_url:?}");
    }
    Ok(())
}

/// Pulls the (possibly multi-line, space-folded) `gpgsig` header out of a
/// raw `git cat-file commit` body. Git folds multi-line header values by
/// prefixing continuation lines with a single space, terminating at the
/// blank line that separates headers from the commit message.
fn extract_gpgsig(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();
    let mut sig = String::new();
    let mut in_sig = false;
    for line in &mut lines {
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("gpgsig ") {
            in_sig = true;
            sig.push_str(rest);
            sig.push('\n');
            continue;
        }
        if in_sig {
            if let Some(rest) = line.strip_prefix(' ') {
                sig.push_str(rest);
                sig.push('\n');
                continue;
            }
            in_sig = false;
        }
    }
    if sig.is_empty() {
        None
    } else {
        Some(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_gpgsig_multiline() {
        let raw = b"tree abc\nparent def\nauthor a <a@b> 1 +0000\ncommitter a <a@b> 1 +0000\ngpgsig -----BEGIN SIGSTORE BUNDLE-----\n eyJhbGciOiJFUzI1NiJ9\n -----END SIGSTORE BUNDLE-----\n\ncommit message\n";
        let sig = extract_gpgsig(raw).unwrap();
        assert!(sig.contains("BEGIN SIGSTORE BUNDLE"));
        assert!(sig.contains("eyJhbGciOiJFUzI1NiJ9"));
    }

    #[test]
    fn test_extract_gpgsig_missing() {
        let raw = b"tree abc\nparent def\n\nunsigned commit\n";
        assert!(extract_gpgsig(raw).is_none());
    }
}
