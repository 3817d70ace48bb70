//! Tracing setup shared by the daemon and the hooks.
//!
//! Levels are named the way the configuration and the `log-level` command
//! name them (`DEBUG`, `INFO`, `WARNING`, `ERROR`, `CRITICAL`) and mapped
//! onto `tracing` filters. The filter sits behind a reload layer so the
//! daemon can change it while running.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

/// Level names accepted by configuration and RPC.
pub const LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Level used when none (or an unknown one) is configured.
pub const DEFAULT_LEVEL: &str = "INFO";

/// Logging errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Not one of [`LEVELS`].
    #[error("unknown log level {0}")]
    InvalidLevel(String),

    /// The log file could not be opened.
    #[error("cannot open log file {}: {source}", path.display())]
    Io {
        /// Log file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The filter could not be swapped.
    #[error("cannot reload log filter: {0}")]
    Reload(#[from] reload::Error),

    /// A global subscriber was already installed.
    #[error("cannot install subscriber: {0}")]
    Init(String),
}

/// Maps a level name onto a `tracing` filter directive.
#[must_use]
pub fn filter_for(level: &str) -> Option<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

/// Handle for changing the level of an installed subscriber.
#[derive(Debug, Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    level: Arc<Mutex<String>>,
}

impl LogControl {
    /// Current level name.
    #[must_use]
    pub fn level(&self) -> String {
        self.level.lock().expect("log level lock poisoned").clone()
    }

    /// Switches to `level`.
    pub fn set_level(&self, level: &str) -> Result<(), LogError> {
        let directive =
            filter_for(level).ok_or_else(|| LogError::InvalidLevel(level.to_string()))?;
        self.handle.reload(EnvFilter::new(directive))?;
        *self.level.lock().expect("log level lock poisoned") = level.to_ascii_uppercase();
        Ok(())
    }
}

/// Installs the global subscriber.
///
/// Output goes to `path` (append mode, no colours) when given, else to
/// stderr. An unknown `level` falls back to [`DEFAULT_LEVEL`].
pub fn init(level: &str, path: Option<&Path>) -> Result<LogControl, LogError> {
    let (level, unknown) = match filter_for(level) {
        Some(_) => (level.to_ascii_uppercase(), false),
        None => (DEFAULT_LEVEL.to_string(), true),
    };
    let directive = filter_for(&level).unwrap_or("info");
    let (filter, handle) = reload::Layer::new(EnvFilter::new(directive));

    let installed = if let Some(path) = path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| LogError::Init(e.to_string()))?;

    if unknown {
        warn!("unknown log level configured, using {DEFAULT_LEVEL}");
    }
    Ok(LogControl {
        handle,
        level: Arc::new(Mutex::new(level)),
    })
}
