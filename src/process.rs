// Small helpers for running subprocesses and checking their results. Every
// git/systemctl/helper-container invocation in this crate goes through a
// `Command` via these traits, so callers get uniform "non-zero exit is an
// error, but let me see the code" behaviour instead of hand-rolling it at
// every call site.

use std::process::{ExitStatus, Output};

use anyhow::{bail, Context};
use tokio::process::Command as AsyncCommand;

/// Extension for `std::process::Output`/anything holding an `ExitStatus`.
pub trait OutputExt {
    /// Error if the process didn't exit with status 0.
    fn ok(self) -> anyhow::Result<()>;
    /// The exit code, or an error if the process was killed by a signal
    /// rather than exiting normally.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn ok(self) -> anyhow::Result<()> {
        if self.status.success() {
            return Ok(());
        }
        bail!(
            "process exited with {:?}\nstdout:\n{}\nstderr:\n{}",
            self.status.code(),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        );
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        status_code_not_killed(&self.status)
    }
}

fn status_code_not_killed(status: &ExitStatus) -> anyhow::Result<i32> {
    status
        .code()
        .context("process was killed by a signal rather than exiting")
}

/// Extension for `tokio::process::Command`: run it and get the output,
/// erroring out (with stdout/stderr attached) on non-zero exit.
pub trait CommandExt {
    #[allow(async_fn_in_trait)]
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for AsyncCommand {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .context(format!("spawning {:?}", self))?;
        if !output.status.success() {
            bail!(
                "{:?} exited with {:?}\nstdout:\n{}\nstderr:\n{}",
                self,
                output.status.code(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }
        Ok(output)
    }
}

/// Same idea, for the rare places we need a blocking `std::process::Command`
/// (e.g. in `Drop` impls, where we can't await).
pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for std::process::Command {
    fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().context(format!("spawning {:?}", self))?;
        if !output.status.success() {
            bail!(
                "{:?} exited with {:?}\nstdout:\n{}\nstderr:\n{}",
                self,
                output.status.code(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }
        Ok(output)
    }
}
