//! steamos-log-submitter-hook
//!
//! The kernel and udev ignore the exit status, so every failure is logged
//! and the process still exits normally.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sls_core::config::{ConfigStore, DEFAULT_BASE_CONFIG};
use sls_core::process::ProcTree;
use sls_core::staging::{DEFAULT_BASE, Staging};
use sls_hooks::coredump::{self, CoredumpArgs, Programs};
use sls_hooks::devcoredump::{self, DEFAULT_POLICY_DIR};
use sls_hooks::{gpu, notify};
use tracing::error;

/// SteamOS log submitter hooks.
#[derive(Debug, Parser)]
#[command(name = "steamos-log-submitter-hook", version, about)]
struct Cli {
    /// Base configuration file.
    #[arg(long, default_value = DEFAULT_BASE_CONFIG)]
    config: PathBuf,

    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL).
    #[arg(long, default_value = "WARNING")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Handle a core piped in by the kernel
    Coredump(CoredumpArgs),

    /// Archive a device coredump
    Devcoredump {
        /// The `devcd` directory
        dir: PathBuf,
    },

    /// Report a GPU reset
    Gpu,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = sls_core::log::init(&cli.log_level, None) {
        eprintln!("failed to set up logging: {e}");
    }
    if let Err(e) = run(cli) {
        error!("{e:#}");
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> Result<()> {
    let config = ConfigStore::load(&cli.config);
    let staging = Staging::new(
        config
            .get("sls", "base")
            .map_or_else(|| PathBuf::from(DEFAULT_BASE), PathBuf::from),
    );

    let staged = match cli.command {
        Commands::Coredump(args) => coredump::run(
            &args,
            io::stdin().lock(),
            &staging,
            &ProcTree::default(),
            &Programs::default(),
        )?,
        Commands::Devcoredump { dir } => {
            let policy_dir = config
                .get("helpers.devcoredump", "policy-dir")
                .map_or_else(|| PathBuf::from(DEFAULT_POLICY_DIR), PathBuf::from);
            runtime()?
                .block_on(devcoredump::run(&dir, &staging, &policy_dir))?
                .is_some()
        },
        Commands::Gpu => {
            runtime()?.block_on(gpu::run(&staging, &ProcTree::default()))?;
            true
        },
    };

    if staged {
        notify::notify_daemon();
    }
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")
}
