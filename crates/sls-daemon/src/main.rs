//! steamos-log-submitter-daemon
//!
//! Runs in the foreground under systemd. SIGTERM and SIGINT take the same
//! path as the `shutdown` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sls_core::config::{ConfigStore, DEFAULT_BASE_CONFIG, MIGRATED_KEYS};
use sls_core::log::DEFAULT_LEVEL;
use sls_core::staging::Owner;
use sls_core::{Registry, Runner, Services};
use sls_daemon::protocol::{SocketManager, SocketManagerConfig};
use sls_daemon::state::DaemonStateHandle;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// SteamOS log submitter daemon.
#[derive(Debug, Parser)]
#[command(name = "steamos-log-submitter-daemon", version, about)]
struct Args {
    /// Base configuration file.
    #[arg(long, default_value = DEFAULT_BASE_CONFIG)]
    config: PathBuf,

    /// Control socket path.
    #[arg(long, env = "STEAMOS_LOG_SUBMITTER_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level, overriding `logging.level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Log file, overriding `logging.path`.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let mut config = ConfigStore::load(&args.config);

    let level = args
        .log_level
        .clone()
        .or_else(|| config.get("logging", "level"))
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.get("logging", "path").map(PathBuf::from));
    let log = sls_core::log::init(&level, log_file.as_deref()).context("failed to set up logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting");

    if let Err(e) = config.migrate(MIGRATED_KEYS) {
        warn!("configuration migration failed: {e}");
    }

    let services = Services::from_config(config.into_shared()).context("failed to set up services")?;
    let registry = Registry::default();
    let owner = if nix::unistd::geteuid().is_root() {
        Owner::service_user()
    } else {
        None
    };
    sls_daemon::prepare_staging(&services.staging, &registry, owner);

    let state = DaemonStateHandle::new(Runner::new(services, registry), Some(log)).into_shared();

    let socket_config = match args.socket {
        Some(path) => {
            let config = SocketManagerConfig::new(path);
            match Owner::service_user() {
                Some(owner) => config.with_group(owner.gid),
                None => config,
            }
        },
        None => SocketManagerConfig::default(),
    };
    let manager = SocketManager::bind(socket_config).context("failed to bind control socket")?;

    let signal_state = state.clone();
    let signal_task = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to register SIGTERM: {e}");
                return;
            },
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                error!("failed to register SIGINT: {e}");
                return;
            },
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        signal_state.request_shutdown();
    });

    let result = sls_daemon::run(manager, state).await;
    signal_task.abort();
    info!("stopped");
    result.context("control socket failed")
}
