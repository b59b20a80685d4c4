// Error taxonomy for fetchit, classified "by kind, not type" per the spec:
// every error that crosses a Reconciler/Scheduler/ConfigLoader boundary gets
// tagged with one of these kinds so callers can decide retry/fatal policy
// without needing to downcast into a specific error type.

use std::fmt;

use thiserror::Error;

/// Identifies a (target, method) pair for error reporting, independent of
/// whether the MethodInstance that produced the error still exists.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub target: String,
    pub kind: String,
    pub name: String,
    /// First 9 hex chars of the commit hash involved, if any (spec.md §4.1).
    pub commit_prefix: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target={} method={}/{}", self.target, self.kind, self.name)?;
        if let Some(prefix) = &self.commit_prefix {
            write!(f, " commit={prefix}")?;
        }
        Ok(())
    }
}

/// The kind of a fetchit failure, per spec.md §7. Every variant carries the
/// underlying `anyhow::Error` so the detailed cause is never lost, plus the
/// `ErrorContext` so the uniform "target, method kind, method name, commit
/// prefix" log line (spec.md §7) can be built from one `Display` impl.
#[derive(Error, Debug)]
pub enum FailureKind {
    /// Invalid YAML, missing required field, unknown method kind. Fatal at
    /// startup; during live reload the old config is retained.
    #[error("config error ({ctx}): {source:#}")]
    Config {
        ctx: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// git clone/fetch/auth failure, unreachable URL, missing device. Never
    /// fatal; the tick is retried next cron slot.
    #[error("source error ({ctx}): {source:#}")]
    Source {
        ctx: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// Signature or transparency-log mismatch. Handled identically to
    /// `Source`: the commit is not checked out, nothing is applied.
    #[error("verification error ({ctx}): {source:#}")]
    Verification {
        ctx: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// Executor failed (Podman API error, file copy failure, systemd
    /// error). The tick is aborted and the applied tag is not advanced.
    #[error("apply error ({ctx}): {source:#}")]
    Apply {
        ctx: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// The applied tag points to a commit that no longer exists (branch
    /// force-push). Handled by resetting `initialRun = true`.
    #[error("state error ({ctx}): {source:#}")]
    State {
        ctx: ErrorContext,
        #[source]
        source: anyhow::Error,
    },

    /// Context cancellation. Silent; the scheduler absorbs it.
    #[error("cancelled ({ctx})")]
    Cancelled { ctx: ErrorContext },
}

impl FailureKind {
    pub fn context(&self) -> &ErrorContext {
        match self {
            FailureKind::Config { ctx, .. }
            | FailureKind::Source { ctx, .. }
            | FailureKind::Verification { ctx, .. }
            | FailureKind::Apply { ctx, .. }
            | FailureKind::State { ctx, .. }
            | FailureKind::Cancelled { ctx } => ctx,
        }
    }

    pub fn log(&self) {
        match self {
            FailureKind::Cancelled { .. } => log::debug!("{self}"),
            _ => log::error!("{self}"),
        }
    }
}
