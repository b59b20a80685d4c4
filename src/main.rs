// CLI entry point (spec.md §6): `fetchit start [--config PATH] [--volume
// NAME]`. There is only one subcommand today; it's kept as a subcommand
// rather than flattened onto the root command so additional ones (e.g. a
// future `fetchit validate`) can be added without breaking the existing
// invocation.

mod change;
mod config;
mod error;
mod executor;
mod git;
mod methods;
mod podman;
mod process;
mod reconciler;
mod scheduler;
mod signature;
mod status;
mod supervisor;
mod systemd_dbus;
mod target;
mod util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{ConfigLoader, DEFAULT_BACKUP_PATH};
use crate::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "fetchit", version, about = "GitOps agent that reconciles host container state against git repositories")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent: load configuration, clone/fetch every target, and
    /// reconcile host state against it on each target's schedule.
    Start {
        /// Path to the root configuration file (spec.md §4.6). Defaults
        /// to /opt/mount/config.yaml.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Base directory for clones, caches, and the config backup
        /// (spec.md §6 "Persisted state"). Defaults to the current
        /// directory.
        #[arg(long, value_name = "NAME")]
        volume: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .expect("invalid RUST_LOG")
        .start()
        .expect("failed to initialize logging");

    let cli = Cli::parse();
    let Command::Start { config, volume } = cli.command;

    let config_loader = match config {
        Some(path) => ConfigLoader::new(path, PathBuf::from(DEFAULT_BACKUP_PATH)),
        None => ConfigLoader::default(),
    };

    let base_dir = volume.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let clones_dir = base_dir.join("clones");
    let cache_dir = base_dir.join("cache");

    let supervisor = match Supervisor::new(config_loader, clones_dir, cache_dir).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("fatal: failed to start fetchit: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
